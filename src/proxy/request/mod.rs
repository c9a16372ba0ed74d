//! Origin-facing request execution.
//!
//! A [`PreparedRequest`] is a parsed request bound to a concrete destination
//! `(host, port, tls)`. Sending it opens a fresh connection (no reuse),
//! stamps the send time, reads and parses the response, and normalizes the
//! response body so the inspection callbacks see plain payload bytes.

use crate::proxy::errors::ProxyError;
use crate::proxy::message::method::HTTPMethod;
use crate::proxy::message::version::HTTPVersion;
use crate::proxy::message::{RequestMessage, ResponseMessage};
use crate::proxy::tube::Tube;
use chrono::{DateTime, Utc};
use log::warn;
use std::time::Duration;

/// A request message bound to its destination, ready to send.
#[derive(Clone, Debug)]
pub struct PreparedRequest {
    pub host: String,
    pub port: u16,
    pub tls: bool,
    pub message: RequestMessage,
    /// Stamped immediately before the serialized request hits the socket.
    pub request_time: Option<DateTime<Utc>>,
}

impl PreparedRequest {
    pub fn new(host: String, port: u16, tls: bool, message: RequestMessage) -> Self {
        Self {
            host,
            port,
            tls,
            message,
            request_time: None,
        }
    }

    pub fn scheme(&self) -> &'static str {
        if self.tls { "https" } else { "http" }
    }

    /// Full URL of the exchange, for logging and inspection.
    pub fn url(&self) -> String {
        format!(
            "{}://{}:{}{}",
            self.scheme(),
            self.host,
            self.port,
            self.message.target.origin_form()
        )
    }

    /// Rewrites the message for the HTTP/1.1 origin leg: downgrades an
    /// HTTP/2 request line, guarantees a `Host` header, and brings
    /// `Content-Length` in line with the body.
    fn prepare_wire_message(&mut self) {
        if self.message.http_version == HTTPVersion::Http2 {
            self.message.http_version = HTTPVersion::Http11;
        }
        if !self.message.headers.contains("Host") {
            self.message.headers.add("Host", &self.host);
        }
        self.message.update_content_length();
    }

    /// Sends the request and reads one response.
    ///
    /// Returns `Ok(None)` when the origin times out or drops the connection
    /// mid-exchange; the caller then closes the client side without writing
    /// anything. There are no retries.
    pub fn send(
        &mut self,
        timeout: Duration,
        verify_origin: bool,
    ) -> Result<Option<Response<'_>>, ProxyError> {
        self.prepare_wire_message();
        let raw_request = self.message.to_bytes();
        let head_request = self.message.method == HTTPMethod::HEAD;

        let mut tube = Tube::open(&self.host, self.port, self.tls, verify_origin, timeout)?;
        self.request_time = Some(Utc::now());

        let raw_response = match tube.send(&raw_request).and_then(|_| tube.recv_response(head_request)) {
            Ok(raw) => raw,
            Err(ProxyError::Timeout) => {
                warn!("origin {}:{} timed out", self.host, self.port);
                return Ok(None);
            }
            Err(ProxyError::Io(e)) => {
                warn!("origin {}:{} dropped the connection: {e}", self.host, self.port);
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        let response_time = Utc::now();
        tube.close();

        let mut message = ResponseMessage::parse(&raw_response)?;
        message.normalize_body()?;

        Ok(Some(Response {
            request: self,
            response_time,
            message,
        }))
    }
}

/// An origin response tied back to the request that produced it.
#[derive(Debug)]
pub struct Response<'a> {
    pub request: &'a PreparedRequest,
    pub response_time: DateTime<Utc>,
    pub message: ResponseMessage,
}

impl Response<'_> {
    /// Wall-clock time between the request hitting the socket and the
    /// response being fully received.
    pub fn roundtrip_time(&self) -> Option<chrono::Duration> {
        Some(self.response_time - self.request.request_time?)
    }
}
