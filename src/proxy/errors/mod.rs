//! Error taxonomy for the proxy.
//!
//! Parse failures, socket failures, and certificate failures are all
//! recovered at the connection handler boundary; only [`ProxyError::Config`]
//! is fatal, and only during startup.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProxyError {
    /// The start line does not split into the expected tokens.
    #[error("malformed start line: {0:?}")]
    BadRequestLine(String),

    /// The method token is outside the supported set.
    #[error("unsupported HTTP method: {0:?}")]
    BadMethod(String),

    /// The version token is outside the supported set.
    #[error("unsupported HTTP version: {0:?}")]
    BadVersion(String),

    /// A header line is not a `Name: value` pair.
    #[error("malformed header field: {0:?}")]
    HeaderParse(String),

    /// Socket read/write failure, including TLS transport errors.
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),

    /// The receive deadline was reached mid-message.
    #[error("receive timed out")]
    Timeout,

    /// TLS handshake or session failure on either leg.
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    /// The origin probe or the leaf signing failed.
    #[error("certificate forging failed: {0}")]
    CertForge(String),

    /// The configuration file is missing, unparseable, or incomplete.
    #[error("configuration error: {0}")]
    Config(String),
}

impl ProxyError {
    /// `true` for errors that mean the peer went away or never spoke HTTP,
    /// where the handler closes without logging at error level.
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            ProxyError::Io(_)
                | ProxyError::Timeout
                | ProxyError::BadRequestLine(_)
                | ProxyError::BadMethod(_)
                | ProxyError::BadVersion(_)
                | ProxyError::HeaderParse(_)
        )
    }
}
