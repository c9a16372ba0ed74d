//! Proxy configuration file handling.
//!
//! `proxy.conf` is JSON with `#` end-of-line comments stripped before
//! parsing:
//!
//! ```text
//! {
//!     # where to listen
//!     "host": "127.0.0.1",
//!     "port": 8080,
//!     "private_key_path": "ca/private.pem",
//!     "cacert_path": "ca/cacert.pem",
//!     "auth": false
//! }
//! ```

use crate::proxy::errors::ProxyError;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as B64;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default per-socket receive timeout in seconds.
const DEFAULT_TIMEOUT_SECS: u64 = 20;

#[derive(Clone, Debug)]
pub struct ProxyConfig {
    /// Address the listener binds to.
    pub host: String,
    /// Port the listener binds to.
    pub port: u16,
    /// PEM file with the CA private key.
    pub private_key_path: PathBuf,
    /// PEM file with the CA certificate.
    pub cacert_path: PathBuf,
    /// Precomputed `base64(user:password)` when proxy auth is enabled.
    pub auth_basic: Option<String>,
    /// Receive deadline applied to every socket.
    pub timeout: Duration,
    /// Verify origin certificates on the relay leg instead of accepting
    /// whatever the origin presents. Off by default: the re-signed chain is
    /// what clients actually trust.
    pub verify_origin: bool,
}

impl ProxyConfig {
    /// Reads and parses a configuration file.
    pub fn load(path: &Path) -> Result<Self, ProxyError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ProxyError::Config(format!("cannot read {}: {e}", path.display())))?;
        Self::parse(&text)
    }

    /// Parses configuration text (JSON with `#` line comments).
    pub fn parse(text: &str) -> Result<Self, ProxyError> {
        let stripped = strip_comments(text);
        let value: Value = serde_json::from_str(&stripped)
            .map_err(|e| ProxyError::Config(format!("JSON parse error: {e}")))?;

        let host = required_str(&value, "host")?;
        let port = required_port(&value)?;
        let private_key_path = PathBuf::from(required_str(&value, "private_key_path")?);
        let cacert_path = PathBuf::from(required_str(&value, "cacert_path")?);

        let auth = value.get("auth").and_then(Value::as_bool).unwrap_or(false);
        let auth_basic = if auth {
            let user = required_str(&value, "auth_user_name")?;
            let password = required_str(&value, "auth_password")?;
            Some(B64.encode(format!("{user}:{password}")))
        } else {
            None
        };

        let timeout_secs = match value.get("timeout") {
            None => DEFAULT_TIMEOUT_SECS,
            Some(timeout) => timeout
                .as_u64()
                .filter(|&secs| secs > 0)
                .ok_or_else(|| ProxyError::Config("\"timeout\" must be a positive integer".to_string()))?,
        };

        let verify_origin = value
            .get("verify_origin")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        Ok(Self {
            host,
            port,
            private_key_path,
            cacert_path,
            auth_basic,
            timeout: Duration::from_secs(timeout_secs),
            verify_origin,
        })
    }
}

fn required_str(value: &Value, key: &str) -> Result<String, ProxyError> {
    value
        .get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| ProxyError::Config(format!("need \"{key}\"")))
}

fn required_port(value: &Value) -> Result<u16, ProxyError> {
    value
        .get("port")
        .and_then(Value::as_u64)
        .and_then(|port| u16::try_from(port).ok())
        .ok_or_else(|| ProxyError::Config("need \"port\" in 0..65535".to_string()))
}

/// Drops `#` through end-of-line, the way the reference config format
/// defines comments. `#` inside JSON strings is not special-cased; paths
/// containing `#` are not supported.
fn strip_comments(text: &str) -> String {
    text.lines()
        .map(|line| match line.find('#') {
            Some(pos) => &line[..pos],
            None => line,
        })
        .collect::<Vec<_>>()
        .join("\n")
}
