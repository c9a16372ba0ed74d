//! Case-insensitive, multi-valued HTTP header fields.
//!
//! Field names are stored in canonical `Title-Cased-Dash-Separated` form and
//! every lookup goes through the same canonicalization, so `host`, `HOST`
//! and `Host` all address the same field. A single incoming value containing
//! commas is split into individual elements; serialization re-joins the
//! elements of one field with `", "`. Insertion order of distinct fields is
//! preserved.

use crate::proxy::errors::ProxyError;
use std::fmt;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Headers {
    fields: Vec<(String, Vec<String>)>,
}

impl Headers {
    pub fn new() -> Self {
        Self { fields: Vec::new() }
    }

    /// Parses a header block: every non-empty `Name: value` line up to the
    /// blank line. Folded (continuation) lines are not supported.
    pub fn parse(raw: &[u8]) -> Result<Self, ProxyError> {
        let text = String::from_utf8_lossy(raw);
        let mut headers = Headers::new();

        for line in text.split("\r\n") {
            if line.is_empty() {
                continue;
            }
            let Some((name, value)) = line.split_once(':') else {
                return Err(ProxyError::HeaderParse(line.to_string()));
            };
            let name = name.trim();
            if name.is_empty() {
                return Err(ProxyError::HeaderParse(line.to_string()));
            }
            headers.add(name, value.trim());
        }

        Ok(headers)
    }

    /// `accept-encoding` -> `Accept-Encoding`.
    fn canonical(key: &str) -> String {
        let mut canonical = String::with_capacity(key.len());
        for (i, part) in key.split('-').enumerate() {
            if i > 0 {
                canonical.push('-');
            }
            let mut chars = part.chars();
            if let Some(first) = chars.next() {
                canonical.extend(first.to_uppercase());
                canonical.extend(chars.flat_map(|c| c.to_lowercase()));
            }
        }
        canonical
    }

    pub fn contains(&self, key: &str) -> bool {
        let key = Self::canonical(key);
        self.fields.iter().any(|(k, _)| *k == key)
    }

    /// All values for the field joined with `", "`, or `None` when absent.
    pub fn get(&self, key: &str) -> Option<String> {
        self.get_as_list(key).map(|values| values.join(", "))
    }

    /// The individual value elements of the field.
    pub fn get_as_list(&self, key: &str) -> Option<&[String]> {
        let key = Self::canonical(key);
        self.fields
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.as_slice())
    }

    /// Appends values to the field, splitting `value` at commas. Creates the
    /// field at the end of the ordering when it does not exist yet.
    pub fn add(&mut self, key: &str, value: &str) {
        let key = Self::canonical(key);
        let values = value.split(',').map(|v| v.trim().to_string());

        if let Some((_, existing)) = self.fields.iter_mut().find(|(k, _)| *k == key) {
            existing.extend(values);
        } else {
            self.fields.push((key, values.collect()));
        }
    }

    /// Replaces every value of the field with `value` (comma-split).
    pub fn set(&mut self, key: &str, value: &str) {
        self.remove(key);
        self.add(key, value);
    }

    /// Removes the field and all of its values. Returns whether it existed.
    pub fn remove(&mut self, key: &str) -> bool {
        let key = Self::canonical(key);
        let before = self.fields.len();
        self.fields.retain(|(k, _)| *k != key);
        before != self.fields.len()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Iterates fields in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    /// Serializes as `Name: v1, v2\r\n` per field, without the terminating
    /// blank line.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.to_string().into_bytes()
    }
}

impl fmt::Display for Headers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (key, values) in &self.fields {
            write!(f, "{}: {}\r\n", key, values.join(", "))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Headers {
        Headers::parse(
            b"Host: example.com\r\n\
              Accept: text/html\r\n\
              accept: application/xml\r\n\
              Accept-Encoding: gzip, deflate\r\n",
        )
        .unwrap()
    }

    #[test]
    fn lookup_is_case_insensitive() {
        let h = sample();
        assert_eq!(h.get("Host"), h.get("host"));
        assert_eq!(h.get("HOST").as_deref(), Some("example.com"));
    }

    #[test]
    fn same_field_merges_across_spellings() {
        let h = sample();
        assert_eq!(h.get("accept").as_deref(), Some("text/html, application/xml"));
        assert_eq!(
            h.get_as_list("Accept").unwrap(),
            &["text/html".to_string(), "application/xml".to_string()]
        );
    }

    #[test]
    fn comma_separated_values_are_split() {
        let h = sample();
        assert_eq!(
            h.get_as_list("Accept-Encoding").unwrap(),
            &["gzip".to_string(), "deflate".to_string()]
        );
    }

    #[test]
    fn insertion_order_is_preserved() {
        let h = sample();
        let keys: Vec<&str> = h.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, ["Host", "Accept", "Accept-Encoding"]);
    }

    #[test]
    fn set_replaces_and_remove_clears_all_values() {
        let mut h = sample();
        h.set("Accept", "application/text");
        assert_eq!(h.get("Accept").as_deref(), Some("application/text"));

        assert!(h.remove("ACCEPT"));
        assert_eq!(h.get("Accept"), None);
        assert!(!h.remove("Accept"));
    }

    #[test]
    fn serialization_uses_canonical_names() {
        let mut h = Headers::new();
        h.add("content-length", "5");
        h.add("x-request-id", "abc");
        assert_eq!(
            String::from_utf8(h.to_bytes()).unwrap(),
            "Content-Length: 5\r\nX-Request-Id: abc\r\n"
        );
    }

    #[test]
    fn line_without_colon_is_an_error() {
        assert!(matches!(
            Headers::parse(b"not a header line\r\n"),
            Err(ProxyError::HeaderParse(_))
        ));
    }
}
