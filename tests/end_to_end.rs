//! End-to-end exercises against live loopback sockets: plain relay, body
//! normalization, CONNECT interception with a throwaway CA, downgrade
//! behavior, and the silent-close paths.

use rcgen::{BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, KeyPair, SanType};
use rustls::{ClientConnection, RootCertStore, ServerConnection, StreamOwned};
use rustls_pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use spyglass::proxy::ProxyServer;
use spyglass::proxy::cert::{CertAuthority, CertStore};
use spyglass::proxy::config::ProxyConfig;
use spyglass::proxy::inspect::{Inspector, SilentInspector};
use spyglass::proxy::request::{PreparedRequest, Response};
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

/// CA material on disk, the way the proxy expects to load it.
struct CaFixture {
    key_file: tempfile::NamedTempFile,
    cert_file: tempfile::NamedTempFile,
    cert_der: CertificateDer<'static>,
}

fn make_ca(common_name: &str) -> (KeyPair, rcgen::Certificate) {
    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, common_name);
    params.distinguished_name = dn;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);

    let key = KeyPair::generate().unwrap();
    let cert = params.self_signed(&key).unwrap();
    (key, cert)
}

fn ca_fixture() -> CaFixture {
    let (key, cert) = make_ca("spyglass test CA");

    let mut key_file = tempfile::NamedTempFile::new().unwrap();
    key_file.write_all(key.serialize_pem().as_bytes()).unwrap();
    let mut cert_file = tempfile::NamedTempFile::new().unwrap();
    cert_file.write_all(cert.pem().as_bytes()).unwrap();

    CaFixture {
        key_file,
        cert_file,
        cert_der: cert.der().clone(),
    }
}

fn test_config(ca: &CaFixture) -> ProxyConfig {
    ProxyConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        private_key_path: PathBuf::from(ca.key_file.path()),
        cacert_path: PathBuf::from(ca.cert_file.path()),
        auth_basic: None,
        timeout: Duration::from_secs(2),
        verify_origin: false,
    }
}

/// Binds the proxy on an ephemeral port and serves it from a background
/// thread.
fn spawn_proxy(server: ProxyServer) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    thread::spawn(move || server.serve(listener));
    addr
}

fn spawn_default_proxy(inspector: Box<dyn Inspector>) -> SocketAddr {
    let ca = ca_fixture();
    let server = ProxyServer::with_inspector(test_config(&ca), inspector).unwrap();
    spawn_proxy(server)
}

/// A plain-HTTP origin answering `accepts` connections with fixed bytes.
/// Each request received is reported through the channel.
fn spawn_origin(response: Vec<u8>, accepts: usize) -> (SocketAddr, mpsc::Receiver<Vec<u8>>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = mpsc::channel();

    thread::spawn(move || {
        for _ in 0..accepts {
            let Ok((mut socket, _)) = listener.accept() else {
                return;
            };
            let mut request = vec![0u8; 8192];
            let n = socket.read(&mut request).unwrap_or(0);
            request.truncate(n);
            let _ = tx.send(request);
            let _ = socket.write_all(&response);
        }
    });

    (addr, rx)
}

fn send_through_proxy(proxy: SocketAddr, request: &[u8]) -> Vec<u8> {
    let mut client = TcpStream::connect(proxy).unwrap();
    client
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    client.write_all(request).unwrap();

    let mut response = Vec::new();
    let _ = client.read_to_end(&mut response);
    response
}

struct CountingInspector {
    requests: Arc<AtomicUsize>,
    responses: Arc<AtomicUsize>,
}

impl Inspector for CountingInspector {
    fn on_request(&self, request: &mut PreparedRequest) {
        self.requests.fetch_add(1, Ordering::SeqCst);
        request.message.headers.add("X-Inspected", "1");
    }

    fn on_response(&self, _response: &mut Response<'_>) {
        self.responses.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn plain_get_is_relayed_byte_for_byte() {
    let requests = Arc::new(AtomicUsize::new(0));
    let responses = Arc::new(AtomicUsize::new(0));
    let proxy = spawn_default_proxy(Box::new(CountingInspector {
        requests: requests.clone(),
        responses: responses.clone(),
    }));

    let origin_payload = b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok".to_vec();
    let (origin, seen) = spawn_origin(origin_payload.clone(), 1);

    let request = format!(
        "GET http://{origin}/ HTTP/1.1\r\nHost: {origin}\r\n\r\n",
        origin = origin
    );
    let received = send_through_proxy(proxy, request.as_bytes());

    assert_eq!(received, origin_payload);
    assert_eq!(requests.load(Ordering::SeqCst), 1);
    assert_eq!(responses.load(Ordering::SeqCst), 1);

    // The on_request mutation made it onto the origin leg.
    let origin_saw = String::from_utf8(seen.recv().unwrap()).unwrap();
    assert!(origin_saw.contains("X-Inspected: 1\r\n"), "{origin_saw}");
}

#[test]
fn gzip_response_reaches_the_client_decoded() {
    use flate2::Compression;
    use flate2::write::GzEncoder;

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(b"hello").unwrap();
    let encoded = encoder.finish().unwrap();

    let mut origin_payload = format!(
        "HTTP/1.1 200 OK\r\nContent-Encoding: gzip\r\nContent-Length: {}\r\n\r\n",
        encoded.len()
    )
    .into_bytes();
    origin_payload.extend_from_slice(&encoded);

    let proxy = spawn_default_proxy(Box::new(SilentInspector));
    let (origin, _seen) = spawn_origin(origin_payload, 1);

    let request = format!("GET http://{origin}/ HTTP/1.1\r\nHost: {origin}\r\n\r\n");
    let received = String::from_utf8(send_through_proxy(proxy, request.as_bytes())).unwrap();

    assert!(received.contains("Content-Length: 5\r\n"), "{received}");
    assert!(!received.contains("Content-Encoding"), "{received}");
    assert!(received.ends_with("\r\n\r\nhello"), "{received}");
}

#[test]
fn chunked_response_reaches_the_client_deframed() {
    let origin_payload =
        b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n0\r\n\r\n".to_vec();

    let proxy = spawn_default_proxy(Box::new(SilentInspector));
    let (origin, _seen) = spawn_origin(origin_payload, 1);

    let request = format!("GET http://{origin}/ HTTP/1.1\r\nHost: {origin}\r\n\r\n");
    let received = String::from_utf8(send_through_proxy(proxy, request.as_bytes())).unwrap();

    assert!(received.contains("Content-Length: 5\r\n"), "{received}");
    assert!(!received.contains("Transfer-Encoding"), "{received}");
    assert!(received.ends_with("\r\n\r\nhello"), "{received}");
}

#[test]
fn http2_request_is_downgraded_on_the_origin_leg() {
    let proxy = spawn_default_proxy(Box::new(SilentInspector));
    let (origin, seen) = spawn_origin(
        b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n".to_vec(),
        1,
    );

    let request = format!("GET http://{origin}/ HTTP/2\r\nHost: {origin}\r\n\r\n");
    let _ = send_through_proxy(proxy, request.as_bytes());

    let origin_saw = String::from_utf8(seen.recv().unwrap()).unwrap();
    assert!(origin_saw.starts_with("GET "), "{origin_saw}");
    assert!(origin_saw.contains(" HTTP/1.1\r\n"), "{origin_saw}");
    assert!(!origin_saw.contains("HTTP/2"), "{origin_saw}");
    assert!(origin_saw.contains("Host: "), "{origin_saw}");
}

#[test]
fn garbage_gets_nothing_back() {
    let proxy = spawn_default_proxy(Box::new(SilentInspector));
    let received = send_through_proxy(proxy, b"GARBAGE\r\n\r\n");
    assert!(received.is_empty());
}

#[test]
fn missing_host_header_gets_nothing_back() {
    let proxy = spawn_default_proxy(Box::new(SilentInspector));
    let received = send_through_proxy(proxy, b"GET / HTTP/1.1\r\n\r\n");
    assert!(received.is_empty());
}

#[test]
fn identical_parallel_requests_yield_identical_bodies() {
    let proxy = spawn_default_proxy(Box::new(SilentInspector));
    let origin_payload = b"HTTP/1.1 200 OK\r\nContent-Length: 4\r\n\r\nsame".to_vec();
    let (origin, _seen) = spawn_origin(origin_payload.clone(), 4);

    let workers: Vec<_> = (0..4)
        .map(|_| {
            let request = format!("GET http://{origin}/ HTTP/1.1\r\nHost: {origin}\r\n\r\n");
            thread::spawn(move || send_through_proxy(proxy, request.as_bytes()))
        })
        .collect();

    for worker in workers {
        assert_eq!(worker.join().unwrap(), origin_payload);
    }
}

// ---- TLS interception ----

/// A TLS origin with its own root CA, serving `accepts` exchanges.
struct TlsOrigin {
    addr: SocketAddr,
    ca_der: CertificateDer<'static>,
    leaf_der: CertificateDer<'static>,
}

fn spawn_tls_origin(response: Vec<u8>, accepts: usize) -> TlsOrigin {
    let (ca_key, ca_cert) = make_ca("origin root");

    let mut leaf_params = CertificateParams::new(Vec::new()).unwrap();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, "origin.test");
    dn.push(DnType::OrganizationName, "Origin Test Org");
    leaf_params.distinguished_name = dn;
    leaf_params
        .subject_alt_names
        .push(SanType::IpAddress("127.0.0.1".parse().unwrap()));

    let leaf_key = KeyPair::generate().unwrap();
    let leaf = leaf_params.signed_by(&leaf_key, &ca_cert, &ca_key).unwrap();

    let server_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(
            vec![leaf.der().clone(), ca_cert.der().clone()],
            PrivateKeyDer::try_from(leaf_key.serialize_der()).unwrap(),
        )
        .unwrap();
    let server_config = Arc::new(server_config);

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let accept_config = server_config.clone();
    thread::spawn(move || {
        for _ in 0..accepts {
            let Ok((mut socket, _)) = listener.accept() else {
                return;
            };
            let mut connection = ServerConnection::new(accept_config.clone()).unwrap();
            while connection.is_handshaking() {
                if connection.complete_io(&mut socket).is_err() {
                    break;
                }
            }
            // The certificate-forge probe hangs up right after the
            // handshake; full exchanges continue with a request.
            let mut stream = StreamOwned::new(connection, socket);
            let mut request = [0u8; 4096];
            match stream.read(&mut request) {
                Ok(n) if n > 0 => {
                    let _ = stream.write_all(&response);
                }
                _ => {}
            }
        }
    });

    TlsOrigin {
        addr,
        ca_der: ca_cert.der().clone(),
        leaf_der: leaf.der().clone(),
    }
}

/// Client config trusting exactly one root.
fn client_config_trusting(root: &CertificateDer<'static>) -> Arc<rustls::ClientConfig> {
    let mut roots = RootCertStore::empty();
    roots.add(root.clone()).unwrap();
    Arc::new(
        rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth(),
    )
}

fn intercepting_proxy(origin_ca: &CertificateDer<'static>) -> (SocketAddr, CaFixture) {
    let ca = ca_fixture();
    let config = test_config(&ca);
    let authority = CertAuthority::load(&config.private_key_path, &config.cacert_path).unwrap();
    let certs = CertStore::with_probe_config(
        authority,
        config.timeout,
        client_config_trusting(origin_ca),
    );
    let server = ProxyServer::with_certificates(config, certs, Box::new(SilentInspector));
    (spawn_proxy(server), ca)
}

#[test]
fn connect_tunnel_is_intercepted_with_a_forged_leaf() {
    let origin = spawn_tls_origin(
        b"HTTP/1.1 200 OK\r\nContent-Length: 6\r\n\r\nsecret".to_vec(),
        2, // one accept for the probe, one for the relayed exchange
    );
    let (proxy, proxy_ca) = intercepting_proxy(&origin.ca_der);

    let mut client = TcpStream::connect(proxy).unwrap();
    client
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    let connect = format!(
        "CONNECT {addr} HTTP/1.1\r\nHost: {addr}\r\n\r\n",
        addr = origin.addr
    );
    client.write_all(connect.as_bytes()).unwrap();

    let mut established = Vec::new();
    let mut byte = [0u8; 1];
    while !established.ends_with(b"\r\n\r\n") {
        client.read_exact(&mut byte).unwrap();
        established.push(byte[0]);
    }
    assert_eq!(established, b"HTTP/1.0 200 Connection established\r\n\r\n");

    // Handshake against the tunnel, trusting only the proxy CA: success
    // means the presented chain was re-signed by it.
    let server_name = ServerName::try_from("127.0.0.1".to_string()).unwrap();
    let connection =
        ClientConnection::new(client_config_trusting(&proxy_ca.cert_der), server_name).unwrap();
    let mut tls = StreamOwned::new(connection, client);

    tls.write_all(b"GET /secret HTTP/1.1\r\nHost: origin.test\r\n\r\n")
        .unwrap();
    let mut response = Vec::new();
    let _ = tls.read_to_end(&mut response);
    let response = String::from_utf8(response).unwrap();
    assert!(response.ends_with("\r\n\r\nsecret"), "{response}");

    // The tunnel presented a forged leaf, not the origin's own.
    let presented = tls.conn.peer_certificates().unwrap();
    assert_ne!(presented[0], origin.leaf_der);
    assert_eq!(presented[1], proxy_ca.cert_der);
}

#[test]
fn forged_certificates_are_cached_per_destination() {
    let origin = spawn_tls_origin(Vec::new(), 1);
    let ca = ca_fixture();
    let authority = CertAuthority::load(ca.key_file.path(), ca.cert_file.path()).unwrap();
    let store = Arc::new(CertStore::with_probe_config(
        authority,
        Duration::from_secs(2),
        client_config_trusting(&origin.ca_der),
    ));

    let first = store
        .entry("127.0.0.1", origin.addr.port())
        .expect("first forge");
    assert_eq!(store.cached(), 1);
    assert_eq!(first.host, "127.0.0.1");
    assert_eq!(first.port, origin.addr.port());
    assert!(first.leaf_cert_pem.contains("BEGIN CERTIFICATE"));

    // Origin only accepts once; a cache hit needs no second probe.
    let second = store
        .entry("127.0.0.1", origin.addr.port())
        .expect("cache hit");
    assert_eq!(second.leaf_cert_pem, first.leaf_cert_pem);
    assert_eq!(store.cached(), 1);
}

#[test]
fn proxy_auth_challenges_and_rejects() {
    let ca = ca_fixture();
    let mut config = test_config(&ca);
    config.auth_basic = Some("dXNlcjpzZWNyZXQ=".to_string()); // user:secret
    let server = ProxyServer::with_inspector(config, Box::new(SilentInspector)).unwrap();
    let proxy = spawn_proxy(server);

    let bare = send_through_proxy(proxy, b"GET http://x/ HTTP/1.1\r\nHost: x\r\n\r\n");
    assert!(
        String::from_utf8_lossy(&bare).starts_with("HTTP/1.0 407"),
        "{bare:?}"
    );

    let wrong = send_through_proxy(
        proxy,
        b"GET http://x/ HTTP/1.1\r\nHost: x\r\nProxy-Authorization: Basic bm9wZTpub3Bl\r\n\r\n",
    );
    assert!(
        String::from_utf8_lossy(&wrong).starts_with("HTTP/1.0 403"),
        "{wrong:?}"
    );

    let (origin, _seen) = spawn_origin(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n".to_vec(), 1);
    let authed = format!(
        "GET http://{origin}/ HTTP/1.1\r\nHost: {origin}\r\n\
         Proxy-Authorization: Basic dXNlcjpzZWNyZXQ=\r\n\r\n"
    );
    let accepted = send_through_proxy(proxy, authed.as_bytes());
    assert!(
        String::from_utf8_lossy(&accepted).starts_with("HTTP/1.1 200"),
        "{accepted:?}"
    );
}
