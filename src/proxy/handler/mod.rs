//! Per-connection handling.
//!
//! Each accepted socket is driven through one request/response pair:
//! read the first request, branch on `CONNECT`, optionally perform the TLS
//! interception handshake, relay through the origin runner, write the
//! response, close. Every client-side failure ends the connection silently;
//! nothing a worker does may crash the accept loop.

use crate::proxy::ProxyContext;
use crate::proxy::errors::ProxyError;
use crate::proxy::message::RequestMessage;
use crate::proxy::message::method::HTTPMethod;
use crate::proxy::request::PreparedRequest;
use crate::proxy::tube::Tube;
use log::{debug, error, warn};
use std::net::TcpStream;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

const AUTH_REQUIRED: &[u8] = b"HTTP/1.0 407 Proxy Authentication Required\r\n\
    Proxy-Authenticate: Basic realm=\"Access to proxy\"\r\n\r\n\
    <html>Proxy Authentication Required.</html>";

const AUTH_FAILED: &[u8] = b"HTTP/1.0 403 Forbidden\r\n\
    Proxy-Authenticate: Basic realm=\"Access to proxy\"\r\n\r\n\
    <html>Proxy Authentication Failed.</html>";

/// Runs one connection to completion, containing every error.
pub(crate) fn run(socket: TcpStream, context: Arc<ProxyContext>) {
    let tube = match Tube::accepted(socket, context.config.timeout) {
        Ok(tube) => tube,
        Err(e) => {
            warn!("could not adopt accepted socket: {e}");
            return;
        }
    };

    let handler = ConnectionHandler { tube, context };
    if let Err(e) = handler.handle() {
        if e.is_disconnect() {
            debug!("connection closed: {e}");
        } else {
            warn!("connection handler: {e}");
        }
    }
}

struct ConnectionHandler {
    tube: Tube,
    context: Arc<ProxyContext>,
}

impl ConnectionHandler {
    /// One pass through the state machine: read, classify, relay, done.
    fn handle(mut self) -> Result<(), ProxyError> {
        let raw_request = self.tube.recv_request()?;
        let message = RequestMessage::parse(&raw_request)?;

        if !self.authorized(&message)? {
            return Ok(());
        }

        if message.method == HTTPMethod::CONNECT {
            self.relay_tls(message)
        } else {
            self.relay_plain(message)
        }
    }

    /// Basic proxy authentication, when configured. A missing credential is
    /// challenged with 407, a wrong one rejected with 403.
    fn authorized(&mut self, message: &RequestMessage) -> Result<bool, ProxyError> {
        let Some(expected) = self.context.config.auth_basic.as_deref() else {
            return Ok(true);
        };

        match message.headers.get("Proxy-Authorization") {
            None => {
                self.tube.send(AUTH_REQUIRED)?;
                Ok(false)
            }
            Some(credential) if credential.split_whitespace().last() == Some(expected) => Ok(true),
            Some(_) => {
                self.tube.send(AUTH_FAILED)?;
                Ok(false)
            }
        }
    }

    /// Plain HTTP: the destination comes from the `Host` header (port 80
    /// unless given) and the exchange runs over a plaintext origin leg.
    fn relay_plain(mut self, message: RequestMessage) -> Result<(), ProxyError> {
        let Some((host, port)) = message.host_target(80) else {
            debug!("plain request without a usable Host header");
            return Ok(());
        };
        self.exchange(host, port, false, message)
    }

    /// CONNECT: acknowledge the tunnel, forge a leaf for the destination,
    /// swap the client leg to TLS, then relay the first tunneled request.
    ///
    /// The 200 is deliberately HTTP/1.0 for maximum client compatibility.
    /// A forge failure closes the tunnel before a single TLS byte is sent.
    fn relay_tls(mut self, message: RequestMessage) -> Result<(), ProxyError> {
        let Some((host, port)) = message.host_target(443) else {
            debug!("CONNECT without a usable Host header");
            return Ok(());
        };

        self.tube
            .send(b"HTTP/1.0 200 Connection established\r\n\r\n")?;

        let tls_config = self.context.certs.server_config(&host, port)?;
        self.tube.upgrade_server(tls_config)?;

        let raw_request = self.tube.recv_request()?;
        let message = RequestMessage::parse(&raw_request)?;
        self.exchange(host, port, true, message)
    }

    /// The shared tail of both relays: callbacks around the origin
    /// exchange, then the response write.
    fn exchange(
        &mut self,
        host: String,
        port: u16,
        tls: bool,
        message: RequestMessage,
    ) -> Result<(), ProxyError> {
        let inspector = &self.context.inspector;
        let mut prepared = PreparedRequest::new(host, port, tls, message);

        if catch_unwind(AssertUnwindSafe(|| inspector.on_request(&mut prepared))).is_err() {
            error!("request callback panicked; dropping the connection");
            return Ok(());
        }

        let timeout = self.context.config.timeout;
        let verify_origin = self.context.config.verify_origin;
        let Some(mut response) = prepared.send(timeout, verify_origin)? else {
            // Origin went silent; nothing is written to the client.
            return Ok(());
        };

        if catch_unwind(AssertUnwindSafe(|| inspector.on_response(&mut response))).is_err() {
            error!("response callback panicked; dropping the connection");
            return Ok(());
        }

        self.tube.send(&response.message.to_bytes())?;
        self.tube.close();
        Ok(())
    }
}
