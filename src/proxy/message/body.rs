//! Message bodies and structured request-body parsing.

use crate::proxy::message::media_type::MediaType;
use crate::proxy::message::uri::Query;

/// Raw body bytes plus the media type announced for them, if any.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Body {
    raw: Vec<u8>,
    pub media_type: Option<MediaType>,
}

impl Body {
    pub fn new(raw: Vec<u8>, media_type: Option<MediaType>) -> Self {
        Self { raw, media_type }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.raw
    }

    pub fn len(&self) -> usize {
        self.raw.len()
    }

    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }

    pub fn set(&mut self, raw: Vec<u8>, media_type: Option<MediaType>) {
        self.raw = raw;
        if media_type.is_some() {
            self.media_type = media_type;
        }
    }
}

/// One field of a `multipart/form-data` body.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FormPart {
    pub name: String,
    pub filename: Option<String>,
    pub value: Vec<u8>,
}

/// A request body interpreted according to its media type.
#[derive(Clone, Debug, PartialEq)]
pub enum ParsedBody {
    Json(serde_json::Value),
    Form(Query),
    Multipart(Vec<FormPart>),
}

/// A [`Body`] on the request side, which additionally knows how to sniff and
/// parse the three structured formats the proxy understands.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RequestBody {
    raw: Vec<u8>,
    pub media_type: Option<MediaType>,
}

impl RequestBody {
    pub fn new(raw: Vec<u8>, media_type: Option<MediaType>) -> Self {
        Self { raw, media_type }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.raw
    }

    pub fn len(&self) -> usize {
        self.raw.len()
    }

    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }

    pub fn set(&mut self, raw: Vec<u8>, media_type: Option<MediaType>) {
        self.raw = raw;
        if media_type.is_some() {
            self.media_type = media_type;
        }
    }

    /// Sniffs the body content: JSON first, then form-urlencoded, then
    /// multipart form-data (which needs the announced boundary to resolve).
    pub fn guess_media_type(&self) -> Option<MediaType> {
        if self.raw.is_empty() {
            return None;
        }

        if serde_json::from_slice::<serde_json::Value>(&self.raw).is_ok() {
            return Some(MediaType::parse("application/json"));
        }

        if let Ok(text) = std::str::from_utf8(&self.raw) {
            if text.contains('=') && !text.contains("\r\n") {
                let query = Query::parse(text);
                if !query.is_empty() {
                    return Some(MediaType::parse("application/x-www-form-urlencoded"));
                }
            }
        }

        if !self.multipart_parts().is_empty() {
            return Some(MediaType::parse("multipart/form-data"));
        }

        None
    }

    /// Parses the body under `media_type`, falling back to the announced
    /// media type and then to [`Self::guess_media_type`].
    pub fn parse(&self, media_type: Option<&MediaType>) -> Option<ParsedBody> {
        if self.raw.is_empty() {
            return None;
        }

        let guessed;
        let media_type = match media_type.or(self.media_type.as_ref()) {
            Some(media_type) => media_type,
            None => {
                guessed = self.guess_media_type()?;
                &guessed
            }
        };

        if media_type.subtype == "json" || media_type.suffix.as_deref() == Some("json") {
            if let Ok(tree) = serde_json::from_slice(&self.raw) {
                return Some(ParsedBody::Json(tree));
            }
        }

        if media_type.subtype == "x-www-form-urlencoded" {
            if let Ok(text) = std::str::from_utf8(&self.raw) {
                let query = Query::parse(text);
                if !query.is_empty() {
                    return Some(ParsedBody::Form(query));
                }
            }
        }

        if media_type.subtype == "form-data" {
            let parts = self.multipart_parts();
            if !parts.is_empty() {
                return Some(ParsedBody::Multipart(parts));
            }
        }

        None
    }

    /// Splits a `multipart/form-data` body at its boundary (RFC 7578).
    /// Returns no parts when the boundary is missing or never matches.
    fn multipart_parts(&self) -> Vec<FormPart> {
        let Some(boundary) = self
            .media_type
            .as_ref()
            .and_then(|mt| mt.parameter_value("boundary"))
        else {
            return Vec::new();
        };

        let delimiter = format!("--{}", boundary);
        let mut parts = Vec::new();

        for segment in split_bytes(&self.raw, delimiter.as_bytes()) {
            // The terminator segment starts with "--"; preamble and epilogue
            // segments carry no part headers.
            let segment = segment.strip_prefix(b"\r\n").unwrap_or(segment);
            let Some(header_end) = find(segment, b"\r\n\r\n") else {
                continue;
            };

            let header_text = String::from_utf8_lossy(&segment[..header_end]);
            let Some(disposition) = header_text
                .split("\r\n")
                .find(|line| line.to_ascii_lowercase().starts_with("content-disposition:"))
            else {
                continue;
            };

            let Some(name) = disposition_parameter(disposition, "name") else {
                continue;
            };
            let filename = disposition_parameter(disposition, "filename");

            let mut value = segment[header_end + 4..].to_vec();
            if value.ends_with(b"\r\n") {
                value.truncate(value.len() - 2);
            }

            parts.push(FormPart {
                name,
                filename,
                value,
            });
        }

        parts
    }
}

fn disposition_parameter(disposition: &str, name: &str) -> Option<String> {
    for part in disposition.split(';') {
        if let Some((key, value)) = part.split_once('=') {
            if key.trim().eq_ignore_ascii_case(name) {
                return Some(value.trim().trim_matches('"').to_string());
            }
        }
    }
    None
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn split_bytes<'a>(haystack: &'a [u8], needle: &[u8]) -> Vec<&'a [u8]> {
    let mut segments = Vec::new();
    let mut rest = haystack;
    while let Some(pos) = find(rest, needle) {
        segments.push(&rest[..pos]);
        rest = &rest[pos + needle.len()..];
    }
    segments.push(rest);
    segments
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_body_is_guessed_and_parsed() {
        let body = RequestBody::new(br#"{"name": "value", "n": 3}"#.to_vec(), None);
        assert_eq!(
            body.guess_media_type().unwrap().main_section(),
            "application/json"
        );
        match body.parse(None) {
            Some(ParsedBody::Json(tree)) => assert_eq!(tree["n"], 3),
            other => panic!("expected JSON, got {:?}", other),
        }
    }

    #[test]
    fn form_body_is_guessed_and_parsed() {
        let body = RequestBody::new(b"user=alice&token=&scope=read".to_vec(), None);
        assert_eq!(
            body.guess_media_type().unwrap().main_section(),
            "application/x-www-form-urlencoded"
        );
        match body.parse(None) {
            Some(ParsedBody::Form(query)) => {
                assert_eq!(query.get("user").unwrap(), &["alice".to_string()]);
                assert_eq!(query.get("token").unwrap(), &[String::new()]);
            }
            other => panic!("expected form, got {:?}", other),
        }
    }

    #[test]
    fn multipart_body_is_parsed_by_boundary() {
        let raw = b"--xyz\r\n\
                    Content-Disposition: form-data; name=\"field\"\r\n\r\n\
                    value\r\n\
                    --xyz\r\n\
                    Content-Disposition: form-data; name=\"file\"; filename=\"a.txt\"\r\n\
                    Content-Type: text/plain\r\n\r\n\
                    contents\r\n\
                    --xyz--\r\n"
            .to_vec();
        let body = RequestBody::new(
            raw,
            Some(MediaType::parse("multipart/form-data; boundary=xyz")),
        );

        match body.parse(None) {
            Some(ParsedBody::Multipart(parts)) => {
                assert_eq!(parts.len(), 2);
                assert_eq!(parts[0].name, "field");
                assert_eq!(parts[0].value, b"value");
                assert_eq!(parts[1].filename.as_deref(), Some("a.txt"));
                assert_eq!(parts[1].value, b"contents");
            }
            other => panic!("expected multipart, got {:?}", other),
        }
    }

    #[test]
    fn empty_and_opaque_bodies_parse_to_none() {
        assert_eq!(RequestBody::new(Vec::new(), None).parse(None), None);

        let opaque = RequestBody::new(vec![0u8, 159, 146, 150], None);
        assert_eq!(opaque.guess_media_type(), None);
        assert_eq!(opaque.parse(None), None);
    }
}
