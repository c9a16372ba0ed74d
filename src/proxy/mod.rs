//! An intercepting HTTP/HTTPS proxy.
//!
//! The proxy accepts client connections, relays plain HTTP requests, and
//! answers `CONNECT` by re-terminating TLS with a leaf certificate forged
//! under a locally trusted CA, so both halves of every exchange pass
//! through the [`inspect::Inspector`] callbacks in plaintext.
//!
//! # Example
//!
//! ```no_run
//! use spyglass::proxy::ProxyServer;
//! use spyglass::proxy::config::ProxyConfig;
//!
//! let config = ProxyConfig::load(std::path::Path::new("proxy.conf")).unwrap();
//! let server = ProxyServer::new(config).unwrap();
//! server.start().unwrap();
//! ```

pub mod cert;
pub mod config;
pub mod errors;
mod handler;
pub mod inspect;
pub mod logger;
pub mod message;
pub mod request;
pub mod tube;

use crate::proxy::cert::{CertAuthority, CertStore};
use crate::proxy::config::ProxyConfig;
use crate::proxy::errors::ProxyError;
use crate::proxy::inspect::{Inspector, LogInspector};
use log::{info, warn};
use std::net::TcpListener;
use std::sync::Arc;
use std::thread;

/// Everything a connection worker needs, shared read-only across threads.
/// The certificate cache synchronizes internally.
pub(crate) struct ProxyContext {
    pub(crate) config: ProxyConfig,
    pub(crate) certs: CertStore,
    pub(crate) inspector: Box<dyn Inspector>,
}

/// The accept loop and its shared state.
pub struct ProxyServer {
    context: Arc<ProxyContext>,
}

impl ProxyServer {
    /// Builds a server that logs each exchange to the console.
    ///
    /// Loads the CA material named by the configuration; a missing or
    /// malformed key or certificate is a fatal configuration error.
    pub fn new(config: ProxyConfig) -> Result<Self, ProxyError> {
        Self::with_inspector(config, Box::new(LogInspector))
    }

    /// Builds a server with a custom [`Inspector`].
    pub fn with_inspector(
        config: ProxyConfig,
        inspector: Box<dyn Inspector>,
    ) -> Result<Self, ProxyError> {
        let authority = CertAuthority::load(&config.private_key_path, &config.cacert_path)?;
        let certs = CertStore::new(authority, config.timeout);
        Ok(Self::with_certificates(config, certs, inspector))
    }

    /// Builds a server around an existing certificate store. Useful when
    /// the probe leg needs a non-default trust configuration.
    pub fn with_certificates(
        config: ProxyConfig,
        certs: CertStore,
        inspector: Box<dyn Inspector>,
    ) -> Self {
        Self {
            context: Arc::new(ProxyContext {
                config,
                certs,
                inspector,
            }),
        }
    }

    /// Binds the configured address and serves until the process exits.
    pub fn start(&self) -> Result<(), ProxyError> {
        let config = &self.context.config;
        let listener = TcpListener::bind((config.host.as_str(), config.port))?;
        info!("Serving on {}:{}", config.host, config.port);
        self.serve(listener)
    }

    /// Serves connections from an already-bound listener, spawning one
    /// worker thread per accepted socket. The loop never blocks on a
    /// connection and never observes a worker failure.
    pub fn serve(&self, listener: TcpListener) -> Result<(), ProxyError> {
        for stream in listener.incoming() {
            match stream {
                Ok(socket) => {
                    let context = Arc::clone(&self.context);
                    thread::spawn(move || handler::run(socket, context));
                }
                Err(e) => warn!("accept failed: {e}"),
            }
        }
        Ok(())
    }
}
