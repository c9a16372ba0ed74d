use crate::proxy::errors::ProxyError;
use std::fmt;
use std::str::FromStr;

/// Protocol versions accepted on the wire.
///
/// The proxy itself only speaks HTTP/1.x; `Http2` and `Http3` exist so that
/// a client request carrying them can be parsed and then downgraded before
/// it is sent toward the origin.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum HTTPVersion {
    Http10,
    Http11,
    Http2,
    Http3,
}

impl FromStr for HTTPVersion {
    type Err = ProxyError;

    fn from_str(version: &str) -> Result<HTTPVersion, ProxyError> {
        match version {
            "HTTP/1.0" => Ok(HTTPVersion::Http10),
            "HTTP/1.1" => Ok(HTTPVersion::Http11),
            "HTTP/2" => Ok(HTTPVersion::Http2),
            "HTTP/3" => Ok(HTTPVersion::Http3),
            _ => Err(ProxyError::BadVersion(version.to_string())),
        }
    }
}

impl fmt::Display for HTTPVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HTTPVersion::Http10 => write!(f, "HTTP/1.0"),
            HTTPVersion::Http11 => write!(f, "HTTP/1.1"),
            HTTPVersion::Http2 => write!(f, "HTTP/2"),
            HTTPVersion::Http3 => write!(f, "HTTP/3"),
        }
    }
}
