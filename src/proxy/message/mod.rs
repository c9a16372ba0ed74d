//! HTTP/1.1 message model: parsing from raw bytes and serialization back.
//!
//! A message is `start-line CRLF header-block CRLF body`. Parsing splits the
//! byte buffer at the first CRLF (start line) and the first CRLFCRLF (end of
//! headers); serialization reassembles the same shape. Round-tripping a
//! well-formed message is lossless up to header-name canonicalization and
//! comma-value splitting.

pub mod body;
pub mod encoding;
pub mod headers;
pub mod media_type;
pub mod method;
pub mod uri;
pub mod version;

use crate::proxy::errors::ProxyError;
use crate::proxy::message::body::{Body, RequestBody};
use crate::proxy::message::headers::Headers;
use crate::proxy::message::media_type::MediaType;
use crate::proxy::message::method::HTTPMethod;
use crate::proxy::message::uri::URI;
use crate::proxy::message::version::HTTPVersion;
use std::str::FromStr;

/// A parsed HTTP request (RFC 9112 §3).
#[derive(Clone, Debug)]
pub struct RequestMessage {
    pub method: HTTPMethod,
    pub target: URI,
    pub http_version: HTTPVersion,
    pub headers: Headers,
    pub body: RequestBody,
}

impl RequestMessage {
    /// Parses a complete request from raw bytes.
    pub fn parse(raw: &[u8]) -> Result<Self, ProxyError> {
        let (start_line, remainder) = split_start_line(raw)?;
        let (raw_headers, raw_body) = split_header_block(remainder);

        let line = String::from_utf8_lossy(start_line);
        let tokens: Vec<&str> = line.split(' ').collect();
        if tokens.len() != 3 {
            return Err(ProxyError::BadRequestLine(line.into_owned()));
        }

        let method = HTTPMethod::from_str(tokens[0])?;
        let http_version = HTTPVersion::from_str(tokens[2])?;
        let target = URI::from_request_target(tokens[1], method)?;
        let headers = Headers::parse(raw_headers)?;

        let media_type = headers.get("Content-Type").map(|ct| MediaType::parse(&ct));
        let body = RequestBody::new(raw_body.to_vec(), media_type);

        Ok(Self {
            method,
            target,
            http_version,
            headers,
            body,
        })
    }

    pub fn request_line(&self) -> String {
        format!(
            "{} {} {}\r\n",
            self.method,
            self.target.request_target(),
            self.http_version
        )
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut raw = self.request_line().into_bytes();
        raw.extend_from_slice(&self.headers.to_bytes());
        raw.extend_from_slice(b"\r\n");
        raw.extend_from_slice(self.body.bytes());
        raw
    }

    /// Rewrites `Content-Length` to match the current body: an existing
    /// header always tracks the body length, and an empty body is announced
    /// explicitly as zero.
    pub fn update_content_length(&mut self) {
        if self.headers.contains("Content-Length") {
            self.headers
                .set("Content-Length", &self.body.len().to_string());
        } else if self.body.is_empty() {
            self.headers.set("Content-Length", "0");
        }
    }

    /// Destination `(host, port)` from the `Host` header, which for a
    /// proxied request names the origin rather than the proxy.
    pub fn host_target(&self, default_port: u16) -> Option<(String, u16)> {
        let host = self.headers.get("Host")?;
        match host.split_once(':') {
            Some((name, port)) => {
                let port = port.parse::<u16>().ok()?;
                Some((name.to_string(), port))
            }
            None => Some((host, default_port)),
        }
    }
}

/// A parsed HTTP response.
#[derive(Clone, Debug)]
pub struct ResponseMessage {
    pub http_version: HTTPVersion,
    pub status_code: u16,
    pub reason: Option<String>,
    pub headers: Headers,
    pub body: Body,
}

impl ResponseMessage {
    /// Parses a complete response from raw bytes. A status line without a
    /// reason phrase (`HTTP/1.1 200`) is accepted.
    pub fn parse(raw: &[u8]) -> Result<Self, ProxyError> {
        let (start_line, remainder) = split_start_line(raw)?;
        let (raw_headers, raw_body) = split_header_block(remainder);

        let line = String::from_utf8_lossy(start_line);
        let mut tokens = line.splitn(3, ' ');
        let version = tokens
            .next()
            .ok_or_else(|| ProxyError::BadRequestLine(line.to_string()))?;
        let code = tokens
            .next()
            .ok_or_else(|| ProxyError::BadRequestLine(line.to_string()))?;

        let http_version = HTTPVersion::from_str(version)?;
        let status_code = code
            .parse::<u16>()
            .map_err(|_| ProxyError::BadRequestLine(line.to_string()))?;
        let reason = tokens.next().map(|reason| reason.to_string());

        let headers = Headers::parse(raw_headers)?;
        let media_type = headers.get("Content-Type").map(|ct| MediaType::parse(&ct));
        let body = Body::new(raw_body.to_vec(), media_type);

        Ok(Self {
            http_version,
            status_code,
            reason,
            headers,
            body,
        })
    }

    pub fn status_line(&self) -> String {
        match &self.reason {
            Some(reason) => format!("{} {} {}\r\n", self.http_version, self.status_code, reason),
            None => format!("{} {}\r\n", self.http_version, self.status_code),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut raw = self.status_line().into_bytes();
        raw.extend_from_slice(&self.headers.to_bytes());
        raw.extend_from_slice(b"\r\n");
        raw.extend_from_slice(self.body.bytes());
        raw
    }

    /// Undoes the transport framing so callbacks see the plain payload:
    /// strips chunked framing, decodes the content encoding, and rewrites
    /// `Content-Length` to the decoded length.
    pub fn normalize_body(&mut self) -> Result<(), ProxyError> {
        let mut reframed = false;

        if let Some(transfer_encoding) = self.headers.get("Transfer-Encoding") {
            if transfer_encoding.to_ascii_lowercase().contains("chunked") {
                let media_type = self.body.media_type.clone();
                self.body
                    .set(encoding::dechunk(self.body.bytes()), media_type);
                reframed = true;
            }
            self.headers.remove("Transfer-Encoding");
        }

        if let Some(content_encoding) = self.headers.get("Content-Encoding") {
            let media_type = self.body.media_type.clone();
            let decoded = encoding::decode(self.body.bytes(), &content_encoding)?;
            self.body.set(decoded, media_type);
            self.headers.remove("Content-Encoding");
            reframed = true;
        }

        if reframed {
            self.headers
                .set("Content-Length", &self.body.len().to_string());
        }

        Ok(())
    }
}

fn split_start_line(raw: &[u8]) -> Result<(&[u8], &[u8]), ProxyError> {
    let end = raw
        .windows(2)
        .position(|w| w == b"\r\n")
        .ok_or_else(|| ProxyError::BadRequestLine(String::from_utf8_lossy(raw).into_owned()))?;
    Ok((&raw[..end], &raw[end + 2..]))
}

fn split_header_block(remainder: &[u8]) -> (&[u8], &[u8]) {
    match remainder.windows(4).position(|w| w == b"\r\n\r\n") {
        Some(end) => (&remainder[..end], &remainder[end + 4..]),
        None => (remainder, &[][..]),
    }
}
