use std::fmt;

/// A parsed media type such as `application/vnd.api+json; charset=utf-8`
/// (RFC 6838).
///
/// The suffix is the part of the subtype after the last `+`; the parameter
/// is everything after the first `;`, kept as-is.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MediaType {
    pub type_: String,
    pub subtype: String,
    pub suffix: Option<String>,
    pub parameter: Option<String>,
}

impl MediaType {
    pub fn parse(media_type: &str) -> Self {
        let (main, parameter) = match media_type.split_once(';') {
            Some((main, parameter)) => (main.trim(), Some(parameter.trim().to_string())),
            None => (media_type.trim(), None),
        };

        let (type_, subtype) = match main.split_once('/') {
            Some((type_, subtype)) => (type_.to_string(), subtype.to_string()),
            None => (main.to_string(), String::new()),
        };

        let suffix = subtype.rsplit_once('+').map(|(_, suffix)| suffix.to_string());

        Self {
            type_,
            subtype,
            suffix,
            parameter,
        }
    }

    /// `type/subtype` without the parameter.
    pub fn main_section(&self) -> String {
        if self.subtype.is_empty() {
            self.type_.clone()
        } else {
            format!("{}/{}", self.type_, self.subtype)
        }
    }

    /// Named parameter value, e.g. `boundary` from
    /// `multipart/form-data; boundary=xyz`.
    pub fn parameter_value(&self, name: &str) -> Option<String> {
        let parameter = self.parameter.as_deref()?;
        for part in parameter.split(';') {
            if let Some((key, value)) = part.split_once('=') {
                if key.trim().eq_ignore_ascii_case(name) {
                    return Some(value.trim().trim_matches('"').to_string());
                }
            }
        }
        None
    }
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.main_section())?;
        if let Some(parameter) = &self.parameter {
            write!(f, "; {}", parameter)?;
        }
        Ok(())
    }
}
