//! On-demand certificate forging for the intercepted TLS leg.
//!
//! For every `(host, port)` the proxy tunnels to, the forge opens a
//! verifying TLS session to the real origin, copies the identifying fields
//! of its leaf certificate (subject DN and subjectAltName), and signs a
//! fresh leaf under the local CA. Forged leaves reuse the CA keypair as
//! their own key; regenerating the CA is the way to rotate them all.

use crate::proxy::errors::ProxyError;
use crate::proxy::tube::verifying_client_config;
use log::debug;
use rcgen::{
    CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair, SanType,
    SerialNumber,
};
use rustls::{ClientConfig, ClientConnection};
use rustls_pki_types::pem::PemObject;
use rustls_pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use std::collections::HashMap;
use std::net::TcpStream;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Days a forged leaf stays valid.
const LEAF_VALIDITY_DAYS: i64 = 365;

/// The CA material loaded once at startup and shared read-only afterwards.
pub struct CertAuthority {
    /// CA private key; doubles as the key of every forged leaf.
    key: KeyPair,
    /// The CA certificate rebuilt in rcgen form so it can act as issuer.
    issuer: rcgen::Certificate,
    /// The on-disk CA certificate, sent to clients as the second chain link.
    ca_cert_der: CertificateDer<'static>,
    /// The CA key in rustls form, used as the server-side private key.
    key_der: PrivateKeyDer<'static>,
}

impl CertAuthority {
    /// Loads the CA keypair and certificate from PEM files. Failures here
    /// are configuration errors and fatal at startup.
    pub fn load(private_key_path: &std::path::Path, cacert_path: &std::path::Path) -> Result<Self, ProxyError> {
        let key_pem = std::fs::read_to_string(private_key_path).map_err(|e| {
            ProxyError::Config(format!("cannot read {}: {e}", private_key_path.display()))
        })?;
        let ca_pem = std::fs::read_to_string(cacert_path)
            .map_err(|e| ProxyError::Config(format!("cannot read {}: {e}", cacert_path.display())))?;

        let key = KeyPair::from_pem(&key_pem)
            .map_err(|e| ProxyError::Config(format!("cannot load private key: {e}")))?;
        let issuer = CertificateParams::from_ca_cert_pem(&ca_pem)
            .and_then(|params| params.self_signed(&key))
            .map_err(|e| ProxyError::Config(format!("cannot load cacert: {e}")))?;

        let ca_cert_der = CertificateDer::from_pem_slice(ca_pem.as_bytes())
            .map_err(|e| ProxyError::Config(format!("cannot parse cacert PEM: {e}")))?;
        let key_der = PrivateKeyDer::from_pem_slice(key_pem.as_bytes())
            .map_err(|e| ProxyError::Config(format!("cannot parse private key PEM: {e}")))?;

        Ok(Self {
            key,
            issuer,
            ca_cert_der,
            key_der,
        })
    }
}

/// A forged leaf cached for one destination. Its private key is always the
/// CA key, so the entry only needs to carry the certificate.
#[derive(Clone, Debug)]
pub struct CertEntry {
    pub host: String,
    pub port: u16,
    pub leaf_cert_pem: String,
}

/// Forged-certificate cache keyed by `(host, port)`.
///
/// The lock only covers map access; probing and signing run outside it.
/// Two workers racing on a cold key both forge and the last insert wins,
/// which is fine: forged leaves for one destination are interchangeable.
pub struct CertStore {
    authority: CertAuthority,
    probe_config: Arc<ClientConfig>,
    probe_timeout: Duration,
    cache: Mutex<HashMap<(String, u16), CertEntry>>,
}

impl CertStore {
    /// A store whose probe leg validates origins against the native roots.
    pub fn new(authority: CertAuthority, probe_timeout: Duration) -> Self {
        Self::with_probe_config(authority, probe_timeout, verifying_client_config())
    }

    /// A store probing with a caller-supplied trust configuration (e.g. a
    /// private root store).
    pub fn with_probe_config(
        authority: CertAuthority,
        probe_timeout: Duration,
        probe_config: Arc<ClientConfig>,
    ) -> Self {
        Self {
            authority,
            probe_config,
            probe_timeout,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// The forged leaf for `(host, port)`, minted on first use.
    pub fn entry(&self, host: &str, port: u16) -> Result<CertEntry, ProxyError> {
        let key = (host.to_string(), port);

        if let Some(entry) = self.cache.lock().unwrap().get(&key) {
            return Ok(entry.clone());
        }

        let entry = self.forge(host, port)?;
        debug!("forged certificate for {host}:{port}");
        self.cache.lock().unwrap().insert(key, entry.clone());
        Ok(entry)
    }

    /// A rustls server config presenting `[forged leaf, CA cert]` with the
    /// CA key, ready for the client-facing TLS upgrade.
    pub fn server_config(&self, host: &str, port: u16) -> Result<Arc<rustls::ServerConfig>, ProxyError> {
        let entry = self.entry(host, port)?;
        let leaf = CertificateDer::from_pem_slice(entry.leaf_cert_pem.as_bytes())
            .map_err(|e| ProxyError::CertForge(format!("forged leaf PEM did not parse: {e}")))?;

        let chain = vec![leaf, self.authority.ca_cert_der.clone()];
        let config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(chain, self.authority.key_der.clone_key())?;

        Ok(Arc::new(config))
    }

    /// Number of cached entries.
    pub fn cached(&self) -> usize {
        self.cache.lock().unwrap().len()
    }

    fn forge(&self, host: &str, port: u16) -> Result<CertEntry, ProxyError> {
        let origin_leaf = self.probe_origin(host, port)?;
        let (subject, subject_alt_names) = clone_identity(&origin_leaf, host)?;

        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        for (dn_type, value) in subject {
            dn.push(dn_type, value);
        }
        params.distinguished_name = dn;
        params.subject_alt_names = subject_alt_names;
        params.serial_number = Some(SerialNumber::from(rand::random::<u64>()));
        params.not_before = time::OffsetDateTime::now_utc();
        params.not_after = params.not_before + time::Duration::days(LEAF_VALIDITY_DAYS);
        params.is_ca = IsCa::ExplicitNoCa;
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

        let leaf = params
            .signed_by(&self.authority.key, &self.authority.issuer, &self.authority.key)
            .map_err(|e| ProxyError::CertForge(format!("signing leaf for {host}:{port}: {e}")))?;

        Ok(CertEntry {
            host: host.to_string(),
            port,
            leaf_cert_pem: leaf.pem(),
        })
    }

    /// Completes a verifying TLS handshake with the origin and returns its
    /// leaf certificate in DER form.
    fn probe_origin(&self, host: &str, port: u16) -> Result<CertificateDer<'static>, ProxyError> {
        let forge_err =
            |e: String| ProxyError::CertForge(format!("probing {host}:{port} failed: {e}"));

        let mut socket = TcpStream::connect((host, port)).map_err(|e| forge_err(e.to_string()))?;
        socket
            .set_read_timeout(Some(self.probe_timeout))
            .map_err(|e| forge_err(e.to_string()))?;
        socket
            .set_write_timeout(Some(self.probe_timeout))
            .map_err(|e| forge_err(e.to_string()))?;

        let server_name = ServerName::try_from(host.to_string())
            .map_err(|_| forge_err("invalid server name".to_string()))?;
        let mut connection = ClientConnection::new(self.probe_config.clone(), server_name)
            .map_err(|e| forge_err(e.to_string()))?;

        while connection.is_handshaking() {
            connection
                .complete_io(&mut socket)
                .map_err(|e| forge_err(e.to_string()))?;
        }

        connection
            .peer_certificates()
            .and_then(|certs| certs.first())
            .map(|leaf| leaf.clone().into_owned())
            .ok_or_else(|| forge_err("origin presented no certificate".to_string()))
    }
}

/// Pulls the subject DN fields (the ones present) and the subjectAltName
/// entries out of the origin leaf. When the origin has no usable SAN, the
/// literal host becomes a DNS SAN.
fn clone_identity(
    leaf: &CertificateDer<'static>,
    host: &str,
) -> Result<(Vec<(DnType, String)>, Vec<SanType>), ProxyError> {
    use x509_parser::prelude::*;

    let (_, cert) = X509Certificate::from_der(leaf.as_ref())
        .map_err(|e| ProxyError::CertForge(format!("origin certificate did not parse: {e}")))?;

    let mut subject = Vec::new();
    let name = cert.subject();
    let fields = [
        (DnType::CommonName, name.iter_common_name().next()),
        (DnType::CountryName, name.iter_country().next()),
        (DnType::StateOrProvinceName, name.iter_state_or_province().next()),
        (DnType::LocalityName, name.iter_locality().next()),
        (DnType::OrganizationName, name.iter_organization().next()),
        (DnType::OrganizationalUnitName, name.iter_organizational_unit().next()),
    ];
    for (dn_type, attribute) in fields {
        if let Some(value) = attribute.and_then(|attr| attr.as_str().ok()) {
            subject.push((dn_type, value.to_string()));
        }
    }

    let mut subject_alt_names = Vec::new();
    if let Ok(Some(san)) = cert.subject_alternative_name() {
        for general_name in &san.value.general_names {
            match general_name {
                GeneralName::DNSName(dns) => subject_alt_names.push(dns_san(*dns)?),
                GeneralName::IPAddress(raw) => {
                    if let Some(ip) = ip_from_der(raw) {
                        subject_alt_names.push(SanType::IpAddress(ip));
                    }
                }
                _ => {}
            }
        }
    }
    if subject_alt_names.is_empty() {
        subject_alt_names.push(dns_san(host)?);
    }

    Ok((subject, subject_alt_names))
}

fn dns_san(name: &str) -> Result<SanType, ProxyError> {
    let name = name
        .try_into()
        .map_err(|e: rcgen::Error| ProxyError::CertForge(format!("invalid SAN {name:?}: {e}")))?;
    Ok(SanType::DnsName(name))
}

fn ip_from_der(raw: &[u8]) -> Option<std::net::IpAddr> {
    match raw.len() {
        4 => {
            let octets: [u8; 4] = raw.try_into().ok()?;
            Some(std::net::IpAddr::from(octets))
        }
        16 => {
            let octets: [u8; 16] = raw.try_into().ok()?;
            Some(std::net::IpAddr::from(octets))
        }
        _ => None,
    }
}
