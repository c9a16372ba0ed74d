//! Byte-level socket transport with optional TLS and HTTP/1.1 framing.
//!
//! A [`Tube`] wraps one TCP connection in any of three states: plaintext,
//! TLS client (origin-facing), or TLS server (the intercepted client-facing
//! leg after a CONNECT). `recv_request`/`recv_response` read exactly one
//! HTTP message off the wire, returning the raw bytes with the body still
//! framed as received; de-framing is the message layer's job.

use crate::proxy::errors::ProxyError;
use crate::proxy::message::encoding::chunked_body_end;
use rustls::{ClientConfig, ClientConnection, RootCertStore, ServerConnection, StreamOwned};
use rustls_pki_types::ServerName;
use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

const READ_CHUNK: usize = 8192;

/// Which side of the HTTP exchange this tube is reading.
enum Role {
    /// Reading a request from a client.
    Server,
    /// Reading a response from an origin; responses to HEAD carry no body.
    Client { head_request: bool },
}

enum TubeStream {
    Plain(TcpStream),
    ClientTls(Box<StreamOwned<ClientConnection, TcpStream>>),
    ServerTls(Box<StreamOwned<ServerConnection, TcpStream>>),
}

impl TubeStream {
    fn socket(&self) -> &TcpStream {
        match self {
            TubeStream::Plain(sock) => sock,
            TubeStream::ClientTls(stream) => &stream.sock,
            TubeStream::ServerTls(stream) => &stream.sock,
        }
    }
}

impl Read for TubeStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            TubeStream::Plain(sock) => sock.read(buf),
            TubeStream::ClientTls(stream) => stream.read(buf),
            TubeStream::ServerTls(stream) => stream.read(buf),
        }
    }
}

impl Write for TubeStream {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            TubeStream::Plain(sock) => sock.write(buf),
            TubeStream::ClientTls(stream) => stream.write(buf),
            TubeStream::ServerTls(stream) => stream.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            TubeStream::Plain(sock) => sock.flush(),
            TubeStream::ClientTls(stream) => stream.flush(),
            TubeStream::ServerTls(stream) => stream.flush(),
        }
    }
}

pub struct Tube {
    stream: Option<TubeStream>,
}

impl Tube {
    /// Connects to `(host, port)` with the given receive deadline and, for
    /// `tls`, wraps the socket as a TLS client with SNI set to `host`.
    ///
    /// With `verify` unset the origin certificate is accepted blindly: the
    /// proxy re-signs whatever the origin presented, so trust rests with the
    /// local CA rather than with the origin.
    pub fn open(
        host: &str,
        port: u16,
        tls: bool,
        verify: bool,
        timeout: Duration,
    ) -> Result<Self, ProxyError> {
        let socket = TcpStream::connect((host, port))?;
        socket.set_read_timeout(Some(timeout))?;
        socket.set_write_timeout(Some(timeout))?;

        if !tls {
            return Ok(Self {
                stream: Some(TubeStream::Plain(socket)),
            });
        }

        let config = if verify {
            verifying_client_config()
        } else {
            unverified_client_config()
        };
        let server_name = ServerName::try_from(host.to_string())
            .map_err(|_| rustls::Error::General(format!("invalid server name {host:?}")))?;
        let connection = ClientConnection::new(config, server_name)?;

        Ok(Self {
            stream: Some(TubeStream::ClientTls(Box::new(StreamOwned::new(
                connection, socket,
            )))),
        })
    }

    /// Wraps a socket handed over by the accept loop.
    pub fn accepted(socket: TcpStream, timeout: Duration) -> Result<Self, ProxyError> {
        socket.set_read_timeout(Some(timeout))?;
        socket.set_write_timeout(Some(timeout))?;
        Ok(Self {
            stream: Some(TubeStream::Plain(socket)),
        })
    }

    /// Writes the whole buffer, surfacing resets as [`ProxyError::Io`].
    pub fn send(&mut self, bytes: &[u8]) -> Result<(), ProxyError> {
        let stream = self.stream_mut()?;
        stream.write_all(bytes)?;
        stream.flush()?;
        Ok(())
    }

    /// Reads one HTTP request (header block plus framed body).
    pub fn recv_request(&mut self) -> Result<Vec<u8>, ProxyError> {
        self.recv_message(Role::Server)
    }

    /// Reads one HTTP response. `head_request` marks responses that carry
    /// no body regardless of their headers.
    pub fn recv_response(&mut self, head_request: bool) -> Result<Vec<u8>, ProxyError> {
        self.recv_message(Role::Client { head_request })
    }

    /// Performs the server side of a TLS handshake over the accepted socket,
    /// presenting `config`'s certificate chain.
    pub fn upgrade_server(&mut self, config: Arc<rustls::ServerConfig>) -> Result<(), ProxyError> {
        match self.stream.take() {
            Some(TubeStream::Plain(mut socket)) => {
                let mut connection = ServerConnection::new(config)?;
                while connection.is_handshaking() {
                    connection.complete_io(&mut socket)?;
                }
                self.stream = Some(TubeStream::ServerTls(Box::new(StreamOwned::new(
                    connection, socket,
                ))));
                Ok(())
            }
            other => {
                self.stream = other;
                Err(rustls::Error::General("connection is already TLS".to_string()).into())
            }
        }
    }

    /// Shuts the connection down; any read or write still in flight on the
    /// socket fails from this point on.
    pub fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.socket().shutdown(Shutdown::Both);
        }
    }

    fn stream_mut(&mut self) -> Result<&mut TubeStream, ProxyError> {
        self.stream.as_mut().ok_or_else(|| {
            ProxyError::Io(std::io::Error::new(
                ErrorKind::NotConnected,
                "tube is closed",
            ))
        })
    }

    /// Reads until the CRLFCRLF header terminator, then reads the body per
    /// the framing rules: explicit zero-body responses, chunked framing,
    /// `Content-Length`, and (for responses only) read-until-close.
    fn recv_message(&mut self, role: Role) -> Result<Vec<u8>, ProxyError> {
        let mut buffer = Vec::with_capacity(READ_CHUNK);
        let headers_end = self.read_header_block(&mut buffer)?;
        let header_text = String::from_utf8_lossy(&buffer[..headers_end]).into_owned();

        if zero_length_body(&role, &header_text) {
            buffer.truncate(headers_end);
            return Ok(buffer);
        }

        if header_value(&header_text, "transfer-encoding")
            .map(|v| v.to_ascii_lowercase().contains("chunked"))
            .unwrap_or(false)
        {
            self.read_chunked_body(&mut buffer, headers_end)?;
            return Ok(buffer);
        }

        if let Some(length) = header_value(&header_text, "content-length")
            .and_then(|v| v.trim().parse::<usize>().ok())
        {
            self.read_sized_body(&mut buffer, headers_end + length)?;
            return Ok(buffer);
        }

        match role {
            // A request without framing headers has no body.
            Role::Server => buffer.truncate(headers_end),
            Role::Client { .. } => self.read_until_close(&mut buffer)?,
        }
        Ok(buffer)
    }

    /// Fills `buffer` until it contains the header terminator; returns the
    /// offset just past it.
    fn read_header_block(&mut self, buffer: &mut Vec<u8>) -> Result<usize, ProxyError> {
        let stream = self.stream_mut()?;
        let mut chunk = [0u8; READ_CHUNK];

        loop {
            if let Some(pos) = find(buffer, b"\r\n\r\n") {
                return Ok(pos + 4);
            }
            match stream.read(&mut chunk) {
                Ok(0) => {
                    return Err(ProxyError::Io(std::io::Error::new(
                        ErrorKind::ConnectionReset,
                        "peer closed before completing the header block",
                    )));
                }
                Ok(n) => buffer.extend_from_slice(&chunk[..n]),
                Err(e) if is_timeout(&e) => return Err(ProxyError::Timeout),
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Reads until the chunked framing is complete (terminating zero chunk
    /// seen), truncating anything past it. A peer that closes mid-frame
    /// ends the body at whatever arrived.
    fn read_chunked_body(
        &mut self,
        buffer: &mut Vec<u8>,
        headers_end: usize,
    ) -> Result<(), ProxyError> {
        let stream = self.stream_mut()?;
        let mut chunk = [0u8; READ_CHUNK];

        loop {
            if let Some(end) = chunked_body_end(&buffer[headers_end..]) {
                buffer.truncate(headers_end + end);
                return Ok(());
            }
            match stream.read(&mut chunk) {
                Ok(0) => return Ok(()),
                Ok(n) => buffer.extend_from_slice(&chunk[..n]),
                Err(e) if is_timeout(&e) => return Err(ProxyError::Timeout),
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Reads until the buffer holds `total` bytes, truncating any overshoot.
    fn read_sized_body(&mut self, buffer: &mut Vec<u8>, total: usize) -> Result<(), ProxyError> {
        let stream = self.stream_mut()?;
        let mut chunk = [0u8; READ_CHUNK];

        while buffer.len() < total {
            match stream.read(&mut chunk) {
                Ok(0) => return Ok(()),
                Ok(n) => buffer.extend_from_slice(&chunk[..n]),
                Err(e) if is_timeout(&e) => return Err(ProxyError::Timeout),
                Err(e) => return Err(e.into()),
            }
        }
        buffer.truncate(total);
        Ok(())
    }

    /// Reads until the peer closes; the idle deadline also ends the body.
    fn read_until_close(&mut self, buffer: &mut Vec<u8>) -> Result<(), ProxyError> {
        let stream = self.stream_mut()?;
        let mut chunk = [0u8; READ_CHUNK];

        loop {
            match stream.read(&mut chunk) {
                Ok(0) => return Ok(()),
                Ok(n) => buffer.extend_from_slice(&chunk[..n]),
                Err(e) if is_timeout(&e) => return Ok(()),
                Err(e) => return Err(e.into()),
            }
        }
    }
}

impl Drop for Tube {
    fn drop(&mut self) {
        self.close();
    }
}

fn is_timeout(e: &std::io::Error) -> bool {
    matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut)
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// `true` when the message cannot carry a body: responses to HEAD and the
/// 1xx/204/304 statuses.
fn zero_length_body(role: &Role, header_text: &str) -> bool {
    let Role::Client { head_request } = role else {
        return false;
    };
    if *head_request {
        return true;
    }
    let status = header_text
        .split("\r\n")
        .next()
        .and_then(|line| line.split(' ').nth(1))
        .and_then(|code| code.parse::<u16>().ok())
        .unwrap_or(0);
    matches!(status, 100..=199 | 204 | 304)
}

/// First value of `name` in a raw header block, matched case-insensitively.
fn header_value(header_text: &str, name: &str) -> Option<String> {
    for line in header_text.split("\r\n").skip(1) {
        if let Some((key, value)) = line.split_once(':') {
            if key.trim().eq_ignore_ascii_case(name) {
                return Some(value.trim().to_string());
            }
        }
    }
    None
}

/// TLS client config that validates origins against the native root store.
/// Used by the certificate forge's probe leg and the opt-in verifying mode.
pub(crate) fn verifying_client_config() -> Arc<ClientConfig> {
    static CONFIG: OnceLock<Arc<ClientConfig>> = OnceLock::new();

    CONFIG
        .get_or_init(|| {
            let mut root_store = RootCertStore::empty();
            for cert in rustls_native_certs::load_native_certs().certs {
                let _ = root_store.add(cert);
            }
            Arc::new(
                ClientConfig::builder()
                    .with_root_certificates(root_store)
                    .with_no_client_auth(),
            )
        })
        .clone()
}

/// TLS client config that accepts any origin certificate.
pub(crate) fn unverified_client_config() -> Arc<ClientConfig> {
    static CONFIG: OnceLock<Arc<ClientConfig>> = OnceLock::new();

    CONFIG
        .get_or_init(|| {
            Arc::new(
                ClientConfig::builder()
                    .dangerous()
                    .with_custom_certificate_verifier(Arc::new(danger::NoVerifier))
                    .with_no_client_auth(),
            )
        })
        .clone()
}

mod danger {
    use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
    use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
    use rustls::{DigitallySignedStruct, Error, SignatureScheme};

    #[derive(Debug)]
    pub(super) struct NoVerifier;

    impl ServerCertVerifier for NoVerifier {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> Result<ServerCertVerified, Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn verify_tls13_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            rustls::crypto::aws_lc_rs::default_provider()
                .signature_verification_algorithms
                .supported_schemes()
        }
    }
}
