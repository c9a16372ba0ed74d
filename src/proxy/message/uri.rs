//! Request-target and query-string handling (RFC 3986 subset).

use crate::proxy::errors::ProxyError;
use crate::proxy::message::method::HTTPMethod;
use std::fmt;

/// An ordered query-string multi-map.
///
/// Duplicate keys keep every value, blank values are allowed
/// (`?flag&x=`), and serialization walks the pairs in insertion order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Query {
    pairs: Vec<(String, Vec<String>)>,
}

impl Query {
    pub fn new() -> Self {
        Self { pairs: Vec::new() }
    }

    /// `parse_qs` semantics: `a=1&a=2&b=` yields `a -> [1, 2]`, `b -> [""]`.
    pub fn parse(raw: &str) -> Self {
        let mut query = Query::new();
        for pair in raw.split('&') {
            if pair.is_empty() {
                continue;
            }
            match pair.split_once('=') {
                Some((key, value)) => query.push(&url_decode(key), url_decode(value)),
                None => query.push(&url_decode(pair), String::new()),
            }
        }
        query
    }

    fn push(&mut self, key: &str, value: String) {
        if let Some((_, values)) = self.pairs.iter_mut().find(|(k, _)| k == key) {
            values.push(value);
        } else {
            self.pairs.push((key.to_string(), vec![value]));
        }
    }

    pub fn get(&self, key: &str) -> Option<&[String]> {
        self.pairs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_slice())
    }

    pub fn set(&mut self, key: &str, values: Vec<String>) {
        self.remove(key);
        self.pairs.push((key.to_string(), values));
    }

    pub fn remove(&mut self, key: &str) -> bool {
        let before = self.pairs.len();
        self.pairs.retain(|(k, _)| k != key);
        before != self.pairs.len()
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.pairs.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (key, values) in &self.pairs {
            for value in values {
                if !first {
                    write!(f, "&")?;
                }
                first = false;
                write!(f, "{}={}", url_encode(key), url_encode(value))?;
            }
        }
        Ok(())
    }
}

/// A decomposed request target.
///
/// `scheme`/`authority` are empty for origin-form targets (`/path?q`);
/// absolute-form targets (`http://host/path`) carry both, and authority-form
/// targets (`CONNECT host:port`) carry only the authority.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct URI {
    pub scheme: String,
    pub authority: String,
    pub host: String,
    pub port: Option<u16>,
    pub path: String,
    pub query: Query,
    pub fragment: String,
}

impl URI {
    /// Parses an absolute URI, enforcing an `http`/`https` scheme and a
    /// non-empty authority.
    pub fn parse(uri: &str) -> Result<Self, ProxyError> {
        let Some((scheme, rest)) = uri.split_once("://") else {
            return Err(ProxyError::BadRequestLine(uri.to_string()));
        };
        if scheme != "http" && scheme != "https" {
            return Err(ProxyError::BadRequestLine(uri.to_string()));
        }

        let (authority, from_path) = match rest.find('/') {
            Some(slash) => (&rest[..slash], &rest[slash..]),
            None => (rest, ""),
        };
        if authority.is_empty() {
            return Err(ProxyError::BadRequestLine(uri.to_string()));
        }

        let (host, port) = split_authority(authority, uri)?;
        let (path, query, fragment) = split_from_path(from_path);

        Ok(Self {
            scheme: scheme.to_string(),
            authority: authority.to_string(),
            host,
            port,
            path,
            query,
            fragment,
        })
    }

    /// Parses the request-target of a request line: absolute form when a
    /// scheme is present, authority form for `CONNECT`, origin form
    /// otherwise.
    pub fn from_request_target(target: &str, method: HTTPMethod) -> Result<Self, ProxyError> {
        if target.contains("://") {
            return Self::parse(target);
        }

        if method == HTTPMethod::CONNECT {
            let (host, port) = split_authority(target, target)?;
            return Ok(Self {
                scheme: String::new(),
                authority: target.to_string(),
                host,
                port,
                path: String::new(),
                query: Query::new(),
                fragment: String::new(),
            });
        }

        let (path, query, fragment) = split_from_path(target);
        Ok(Self {
            scheme: String::new(),
            authority: String::new(),
            host: String::new(),
            port: None,
            path,
            query,
            fragment,
        })
    }

    /// `path?query#fragment`, the part after the authority.
    pub fn origin_form(&self) -> String {
        let mut origin_form = self.path.clone();
        if !self.query.is_empty() {
            origin_form.push('?');
            origin_form.push_str(&self.query.to_string());
        }
        if !self.fragment.is_empty() {
            origin_form.push('#');
            origin_form.push_str(&self.fragment);
        }
        origin_form
    }

    /// The request-target as it goes back on the wire.
    pub fn request_target(&self) -> String {
        if !self.scheme.is_empty() && !self.authority.is_empty() {
            format!("{}://{}{}", self.scheme, self.authority, self.origin_form())
        } else if !self.authority.is_empty() {
            self.authority.clone()
        } else {
            self.origin_form()
        }
    }
}

fn split_authority(authority: &str, context: &str) -> Result<(String, Option<u16>), ProxyError> {
    match authority.rsplit_once(':') {
        Some((host, port)) => {
            let port = port
                .parse::<u16>()
                .map_err(|_| ProxyError::BadRequestLine(context.to_string()))?;
            Ok((host.to_string(), Some(port)))
        }
        None => Ok((authority.to_string(), None)),
    }
}

fn split_from_path(from_path: &str) -> (String, Query, String) {
    let (rest, fragment) = match from_path.split_once('#') {
        Some((rest, fragment)) => (rest, fragment.to_string()),
        None => (from_path, String::new()),
    };
    let (path, query) = match rest.split_once('?') {
        Some((path, query)) => (path.to_string(), Query::parse(query)),
        None => (rest.to_string(), Query::new()),
    };
    (path, query, fragment)
}

/// Decodes `%XX` escapes and `+` as space.
pub(crate) fn url_decode(encoded: &str) -> String {
    let mut decoded = Vec::new();
    let mut bytes = encoded.bytes().peekable();

    while let Some(b) = bytes.next() {
        match b {
            b'%' => {
                let hi = bytes.next();
                let lo = bytes.next();
                match (hi, lo) {
                    (Some(hi), Some(lo)) => {
                        let pair = [hi, lo];
                        match u8::from_str_radix(&String::from_utf8_lossy(&pair), 16) {
                            Ok(byte) => decoded.push(byte),
                            Err(_) => {
                                decoded.push(b'%');
                                decoded.extend_from_slice(&pair);
                            }
                        }
                    }
                    _ => decoded.push(b'%'),
                }
            }
            b'+' => decoded.push(b' '),
            _ => decoded.push(b),
        }
    }

    String::from_utf8_lossy(&decoded).into_owned()
}

/// Percent-encodes everything outside the unreserved set; space becomes `+`.
pub(crate) fn url_encode(raw: &str) -> String {
    let mut encoded = String::with_capacity(raw.len());
    for b in raw.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'_' | b'.' | b'-' | b'~' => {
                encoded.push(b as char)
            }
            b' ' => encoded.push('+'),
            _ => encoded.push_str(&format!("%{:02X}", b)),
        }
    }
    encoded
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_keeps_duplicates_and_blanks() {
        let q = Query::parse("value=a&value=b&num=3&flag=");
        assert_eq!(q.get("value").unwrap(), &["a".to_string(), "b".to_string()]);
        assert_eq!(q.get("num").unwrap(), &["3".to_string()]);
        assert_eq!(q.get("flag").unwrap(), &[String::new()]);
        assert_eq!(q.to_string(), "value=a&value=b&num=3&flag=");
    }

    #[test]
    fn query_percent_round_trip() {
        let q = Query::parse("name=caf%C3%A9&msg=hello+world");
        assert_eq!(q.get("name").unwrap(), &["café".to_string()]);
        assert_eq!(q.get("msg").unwrap(), &["hello world".to_string()]);
        assert_eq!(q.to_string(), "name=caf%C3%A9&msg=hello+world");
    }

    #[test]
    fn absolute_uri_decomposes() {
        let uri = URI::parse("http://example.com:8080/over/there?name=ferret#nose").unwrap();
        assert_eq!(uri.scheme, "http");
        assert_eq!(uri.authority, "example.com:8080");
        assert_eq!(uri.host, "example.com");
        assert_eq!(uri.port, Some(8080));
        assert_eq!(uri.path, "/over/there");
        assert_eq!(uri.fragment, "nose");
        assert_eq!(
            uri.request_target(),
            "http://example.com:8080/over/there?name=ferret#nose"
        );
    }

    #[test]
    fn non_http_scheme_is_rejected() {
        assert!(URI::parse("ftp://example.com/").is_err());
        assert!(URI::parse("example.com/plain").is_err());
    }

    #[test]
    fn connect_target_is_authority_form() {
        let uri = URI::from_request_target("example.test:443", HTTPMethod::CONNECT).unwrap();
        assert_eq!(uri.host, "example.test");
        assert_eq!(uri.port, Some(443));
        assert_eq!(uri.request_target(), "example.test:443");
    }

    #[test]
    fn origin_form_target_keeps_query() {
        let uri = URI::from_request_target("/search?q=rust", HTTPMethod::GET).unwrap();
        assert_eq!(uri.path, "/search");
        assert_eq!(uri.query.get("q").unwrap(), &["rust".to_string()]);
        assert_eq!(uri.request_target(), "/search?q=rust");
    }
}
