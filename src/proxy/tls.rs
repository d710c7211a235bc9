//! TLS certificate handling for HTTPS interception
//!
//! A single root CA is loaded (or generated) at startup, then per-host leaf
//! certificates are issued on demand and cached for the life of the process.

use parking_lot::Mutex;
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose, SanType,
};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::ServerConfig;
use rustls_pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::OnceCell;

use crate::error::{GleipError, Result};

const CA_COMMON_NAME: &str = "Gleip Proxy CA";

/// Certificate Authority for generating site certificates
pub struct CertificateAuthority {
    /// CA certificate used as issuer
    cert: Certificate,

    /// CA key pair
    key: KeyPair,

    /// CA certificate PEM, as exported to clients
    cert_pem: String,
}

fn ca_params() -> CertificateParams {
    let mut params = CertificateParams::default();
    params.is_ca = IsCa::Ca(BasicConstraints::Constrained(0));
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
    ];

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, CA_COMMON_NAME);
    dn.push(DnType::OrganizationName, "Gleip");
    params.distinguished_name = dn;
    params
}

impl CertificateAuthority {
    /// Generate a fresh in-memory CA
    pub fn new() -> Result<Self> {
        let key = KeyPair::generate().map_err(|e| GleipError::tls(CA_COMMON_NAME, e))?;
        let cert = ca_params()
            .self_signed(&key)
            .map_err(|e| GleipError::tls(CA_COMMON_NAME, e))?;
        let cert_pem = cert.pem();

        Ok(Self { cert, key, cert_pem })
    }

    /// Load the persisted CA, or generate one and write it out
    pub fn load_or_create(cert_path: &Path, key_path: &Path) -> Result<Self> {
        if cert_path.exists() && key_path.exists() {
            let cert_pem = fs::read_to_string(cert_path)?;
            let key_pem = fs::read_to_string(key_path)?;
            let key = KeyPair::from_pem(&key_pem)
                .map_err(|e| GleipError::tls(CA_COMMON_NAME, format!("invalid CA key: {}", e)))?;

            // Recreate the issuer with the persisted key: same subject and key
            // identifier, so leaves chain to the exported certificate.
            let cert = ca_params()
                .self_signed(&key)
                .map_err(|e| GleipError::tls(CA_COMMON_NAME, e))?;

            tracing::info!(path = %cert_path.display(), "Loaded CA certificate");
            return Ok(Self { cert, key, cert_pem });
        }

        let ca = Self::new()?;
        for path in [cert_path, key_path] {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(cert_path, ca.cert_pem.as_bytes())?;
        fs::write(key_path, ca.key.serialize_pem().as_bytes())?;

        tracing::info!(path = %cert_path.display(), "Generated new CA certificate");
        Ok(ca)
    }

    /// Get CA certificate PEM
    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    /// DER of the issuing certificate, suitable for a client root store
    pub fn cert_der(&self) -> CertificateDer<'static> {
        self.cert.der().clone()
    }

    /// Issue a leaf certificate for `hostname`
    fn issue(&self, hostname: &str) -> std::result::Result<LeafCertificate, String> {
        let mut params = CertificateParams::default();

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, hostname);
        params.distinguished_name = dn;
        params.subject_alt_names = subject_alt_names(hostname).map_err(|e| e.to_string())?;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        params.use_authority_key_identifier_extension = true;

        // Generate key pair for this certificate
        let key = KeyPair::generate().map_err(|e| e.to_string())?;
        let cert = params
            .signed_by(&key, &self.cert, &self.key)
            .map_err(|e| e.to_string())?;

        let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key.serialize_der()));
        let signing_key = rustls::crypto::ring::sign::any_supported_type(&key_der)
            .map_err(|e| e.to_string())?;

        Ok(LeafCertificate {
            hostname: hostname.to_string(),
            cert_pem: cert.pem(),
            key_pem: key.serialize_pem(),
            certified_key: Arc::new(CertifiedKey::new(vec![cert.der().clone()], signing_key)),
        })
    }
}

/// SANs for a leaf: IPs get an IP SAN; names also cover their bare or wildcard sibling
fn subject_alt_names(hostname: &str) -> std::result::Result<Vec<SanType>, rcgen::Error> {
    if let Ok(ip) = hostname.parse::<IpAddr>() {
        return Ok(vec![SanType::IpAddress(ip)]);
    }

    let mut names = vec![hostname.to_string()];
    if let Some(bare) = hostname.strip_prefix("*.") {
        names.push(bare.to_string());
    } else {
        let labels: Vec<&str> = hostname.split('.').collect();
        match labels.len() {
            0 | 1 => {}
            2 => names.push(format!("*.{}", hostname)),
            n => names.push(labels[n - 2..].join(".")),
        }
    }

    names
        .into_iter()
        .map(|n| Ok(SanType::DnsName(n.try_into()?)))
        .collect()
}

/// An issued leaf, immutable once cached
pub struct LeafCertificate {
    pub hostname: String,
    pub cert_pem: String,
    pub key_pem: String,
    /// Chain and signing key in the form rustls serves
    pub certified_key: Arc<CertifiedKey>,
}

impl fmt::Debug for LeafCertificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeafCertificate")
            .field("hostname", &self.hostname)
            .finish_non_exhaustive()
    }
}

type CacheSlot = Arc<OnceCell<Arc<LeafCertificate>>>;

/// Issues and caches per-host leaf certificates under one CA
///
/// Concurrent requests for the same host share a single generation; a
/// failed generation leaves the slot empty so the next request retries.
pub struct CertificateProvider {
    ca: CertificateAuthority,
    ca_path: PathBuf,
    default_hostname: String,
    cache: Mutex<HashMap<String, CacheSlot>>,
    issued: AtomicU64,
}

impl CertificateProvider {
    /// The CA must already exist; construct it first with [`CertificateAuthority::load_or_create`]
    pub fn new(ca: CertificateAuthority, ca_path: impl Into<PathBuf>, default_hostname: &str) -> Self {
        Self {
            ca,
            ca_path: ca_path.into(),
            default_hostname: normalize(default_hostname),
            cache: Mutex::new(HashMap::new()),
            issued: AtomicU64::new(0),
        }
    }

    /// Leaf for `hostname`, issuing it on first use
    pub async fn generate_certificate(&self, hostname: &str) -> Result<Arc<LeafCertificate>> {
        let host = normalize(hostname);
        if host.is_empty() {
            return Err(GleipError::tls(hostname, "empty hostname"));
        }

        let slot = self.cache.lock().entry(host.clone()).or_default().clone();

        let leaf = slot
            .get_or_try_init(|| async {
                let leaf = self.ca.issue(&host).map_err(|reason| {
                    tracing::warn!(host = %host, "Certificate generation failed: {}", reason);
                    GleipError::tls(&host, reason)
                })?;
                self.issued.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(host = %host, "Issued leaf certificate");
                Ok::<_, GleipError>(Arc::new(leaf))
            })
            .await?;

        Ok(leaf.clone())
    }

    /// Leaf for the server name a client asked for, or the default identity
    pub async fn certificate_for_conn(&self, server_name: Option<&str>) -> Result<Arc<LeafCertificate>> {
        let host = self.identity_for(server_name);
        self.generate_certificate(&host).await
    }

    /// Location of the exported root certificate
    pub fn ca_path(&self) -> &Path {
        &self.ca_path
    }

    pub fn ca(&self) -> &CertificateAuthority {
        &self.ca
    }

    /// Number of leaves generated so far (cache hits excluded)
    pub fn issued_count(&self) -> u64 {
        self.issued.load(Ordering::Relaxed)
    }

    /// One server config for every intercepted host, resolved by SNI
    pub fn server_config(self: &Arc<Self>) -> Result<Arc<ServerConfig>> {
        self.build_config(self.clone())
    }

    /// Server config pinned to one host's leaf, for clients that send no SNI
    /// (typically HTTPS to an IP literal)
    pub async fn server_config_for_host(&self, hostname: &str) -> Result<Arc<ServerConfig>> {
        let leaf = self.generate_certificate(hostname).await?;
        self.build_config(Arc::new(PinnedLeaf(leaf)))
    }

    fn build_config(&self, resolver: Arc<dyn ResolvesServerCert>) -> Result<Arc<ServerConfig>> {
        let mut config = ServerConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
            .with_safe_default_protocol_versions()
            .map_err(|e| GleipError::tls(&self.default_hostname, e))?
            .with_no_client_auth()
            .with_cert_resolver(resolver);
        config.alpn_protocols = vec![b"http/1.1".to_vec()];
        Ok(Arc::new(config))
    }

    fn identity_for(&self, server_name: Option<&str>) -> String {
        match server_name.map(normalize) {
            Some(name) if !name.is_empty() => name,
            _ => self.default_hostname.clone(),
        }
    }
}

impl fmt::Debug for CertificateProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateProvider")
            .field("ca_path", &self.ca_path)
            .field("default_hostname", &self.default_hostname)
            .field("issued", &self.issued_count())
            .finish()
    }
}

/// Serves only already-issued leaves; the proxy issues before handshaking
impl ResolvesServerCert for CertificateProvider {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let host = self.identity_for(client_hello.server_name());
        let slot = self.cache.lock().get(&host).cloned()?;
        slot.get().map(|leaf| leaf.certified_key.clone())
    }
}

/// Always serves the same leaf, whatever the client hello says
#[derive(Debug)]
struct PinnedLeaf(Arc<LeafCertificate>);

impl ResolvesServerCert for PinnedLeaf {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        Some(self.0.certified_key.clone())
    }
}

fn normalize(hostname: &str) -> String {
    hostname.trim().trim_end_matches('.').to_lowercase()
}
