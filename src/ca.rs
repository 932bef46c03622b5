//! Certificate Authority (spec component C3): an on-demand CA that mints
//! per-host leaf certificates signed by a locally generated, persisted
//! root. Grounded in the teacher's `CaAuthority`, generalized to persist
//! under the user's config directory (rather than a hardcoded container
//! path) and to resolve leaves through a single shared `ResolvesServerCert`
//! instead of rebuilding a `ServerConfig` per connection.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, KeyPair, KeyUsagePurpose,
};
use rustls::crypto::aws_lc_rs as crypto_provider;
use rustls::pki_types::PrivatePkcs8KeyDer;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::ServerConfig;

use crate::error::{BoundaryError, Result};
use crate::user::{chown_to_invoking_user, InvokingUser};

const CA_CERT_FILE: &str = "ca-cert.pem";
const CA_KEY_FILE: &str = "ca-key.pem";
/// Recommended upper bound from spec section 3.
const LEAF_VALIDITY_DAYS: i64 = 825;
const ROOT_VALIDITY_DAYS: i64 = 365 * 10;

/// `(rootKey, rootCert, leafCache)`, shared by the proxy (per-connection
/// SNI resolution) and the jailer (reads `ca_cert_path` for child env).
pub struct CertificateAuthority {
    root_key: KeyPair,
    root_cert: rcgen::Certificate,
    /// One lock per hostname, held across the entire generate-and-cache
    /// step so a second concurrent `mint` for the same hostname blocks on
    /// the first rather than racing it into duplicate key generation.
    cache: Mutex<HashMap<String, Arc<Mutex<Option<Arc<CertifiedKey>>>>>>,
    ca_cert_path: PathBuf,
    config_dir: PathBuf,
}

/// Return value of [`CertificateAuthority::setup`]: a ready-to-serve TLS
/// config plus where the root lives on disk.
pub struct CaSetup {
    pub tls_config: Arc<ServerConfig>,
    pub ca_cert_path: PathBuf,
    pub config_dir: PathBuf,
    pub ca: Arc<CertificateAuthority>,
}

impl CertificateAuthority {
    /// Load the root from `config_dir` if present, otherwise generate and
    /// persist a fresh one owned by `who`. Builds the TLS server config
    /// with ALPN forced to `http/1.1` and a certificate resolver that
    /// mints leaves on demand.
    pub fn setup(config_dir: &Path, who: &InvokingUser) -> Result<CaSetup> {
        // Installing the crypto provider is idempotent at the process
        // level but `install_default` only succeeds once; ignore the
        // "already installed" case so repeated setup() calls in tests and
        // hot-reload paths don't error out.
        let _ = crypto_provider::default_provider().install_default();

        fs::create_dir_all(config_dir).map_err(|source| BoundaryError::CaIoError {
            path: config_dir.to_path_buf(),
            source,
        })?;
        // `create_dir_all` runs as whatever privilege this process holds
        // (root, under the jailers' usual `sudo` invocation); hand the
        // directory itself back to the invoking user so they can still
        // traverse into it, not just read the two files inside it.
        chown_to_invoking_user(config_dir, who);

        let cert_path = config_dir.join(CA_CERT_FILE);
        let key_path = config_dir.join(CA_KEY_FILE);

        let (root_key, root_cert) = if cert_path.exists() && key_path.exists() {
            load_root(&cert_path, &key_path)?
        } else {
            let (key, cert) = generate_root()?;
            persist_root(&cert_path, &key_path, &key, &cert, who)?;
            (key, cert)
        };

        let ca = Arc::new(Self {
            root_key,
            root_cert,
            cache: Mutex::new(HashMap::new()),
            ca_cert_path: cert_path.clone(),
            config_dir: config_dir.to_path_buf(),
        });

        let mut tls_config = ServerConfig::builder()
            .with_no_client_auth()
            .with_cert_resolver(ca.clone());
        tls_config.alpn_protocols = vec![b"http/1.1".to_vec()];

        Ok(CaSetup {
            tls_config: Arc::new(tls_config),
            ca_cert_path: cert_path,
            config_dir: ca.config_dir.clone(),
            ca,
        })
    }

    pub fn ca_cert_path(&self) -> &Path {
        &self.ca_cert_path
    }

    /// `mint(hostname) -> leafCert`. Thread-safe, at-most-one *concurrent*
    /// mint per hostname: each hostname gets its own `Mutex`, held across
    /// the whole generate-and-cache step, so a second caller racing the
    /// first for the same hostname blocks until the first finishes and
    /// then simply reads the cached result rather than also generating a
    /// key. Distinct hostnames have distinct per-hostname locks and mint
    /// fully in parallel.
    pub fn mint(&self, hostname: &str) -> Result<Arc<CertifiedKey>> {
        let slot = {
            let mut cache = self.cache.lock().expect("leaf cache mutex poisoned");
            cache
                .entry(hostname.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(None)))
                .clone()
        };
        let mut slot = slot.lock().expect("per-hostname leaf lock poisoned");
        if let Some(existing) = slot.as_ref() {
            return Ok(existing.clone());
        }
        let leaf = generate_leaf(hostname, &self.root_cert, &self.root_key)?;
        *slot = Some(leaf.clone());
        Ok(leaf)
    }
}

impl ResolvesServerCert for CertificateAuthority {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let sni = client_hello.server_name()?;
        self.mint(sni).ok()
    }
}

fn generate_root() -> Result<(KeyPair, rcgen::Certificate)> {
    let mut params = CertificateParams::default();
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, "Boundary Local CA");
    dn.push(DnType::OrganizationName, "Boundary");
    params.distinguished_name = dn;
    params.not_before = time::OffsetDateTime::now_utc();
    params.not_after = time::OffsetDateTime::now_utc() + time::Duration::days(ROOT_VALIDITY_DAYS);

    let key_pair = KeyPair::generate().map_err(|source| BoundaryError::CaCryptoError {
        subject: "root CA key".into(),
        source,
    })?;
    let cert = params
        .self_signed(&key_pair)
        .map_err(|source| BoundaryError::CaCryptoError {
            subject: "root CA cert".into(),
            source,
        })?;
    Ok((key_pair, cert))
}

fn persist_root(
    cert_path: &Path,
    key_path: &Path,
    key: &KeyPair,
    cert: &rcgen::Certificate,
    who: &InvokingUser,
) -> Result<()> {
    write_with_mode(cert_path, cert.pem().as_bytes(), 0o644)?;
    write_with_mode(key_path, key.serialize_pem().as_bytes(), 0o600)?;
    chown_to_invoking_user(cert_path, who);
    chown_to_invoking_user(key_path, who);
    Ok(())
}

fn write_with_mode(path: &Path, contents: &[u8], mode: u32) -> Result<()> {
    fs::write(path, contents).map_err(|source| BoundaryError::CaIoError {
        path: path.to_path_buf(),
        source,
    })?;
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode)).map_err(|source| {
        BoundaryError::CaIoError {
            path: path.to_path_buf(),
            source,
        }
    })?;
    Ok(())
}

fn load_root(cert_path: &Path, key_path: &Path) -> Result<(KeyPair, rcgen::Certificate)> {
    let cert_pem = fs::read_to_string(cert_path).map_err(|source| BoundaryError::CaIoError {
        path: cert_path.to_path_buf(),
        source,
    })?;
    let key_pem = fs::read_to_string(key_path).map_err(|source| BoundaryError::CaIoError {
        path: key_path.to_path_buf(),
        source,
    })?;
    let key_pair = KeyPair::from_pem(&key_pem).map_err(|source| BoundaryError::CaCryptoError {
        subject: "root CA key (reload)".into(),
        source,
    })?;
    let params = CertificateParams::from_ca_cert_pem(&cert_pem).map_err(|source| {
        BoundaryError::CaCryptoError {
            subject: "root CA cert (reload)".into(),
            source,
        }
    })?;
    let cert = params
        .self_signed(&key_pair)
        .map_err(|source| BoundaryError::CaCryptoError {
            subject: "root CA cert (reconstruct)".into(),
            source,
        })?;
    Ok((key_pair, cert))
}

fn generate_leaf(
    hostname: &str,
    root_cert: &rcgen::Certificate,
    root_key: &KeyPair,
) -> Result<Arc<CertifiedKey>> {
    let mut params = CertificateParams::new(vec![hostname.to_string()]).map_err(|source| {
        BoundaryError::CaCryptoError {
            subject: hostname.to_string(),
            source,
        }
    })?;
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, hostname);
    params.distinguished_name = dn;
    params.not_before = time::OffsetDateTime::now_utc() - time::Duration::minutes(5);
    params.not_after = time::OffsetDateTime::now_utc() + time::Duration::days(LEAF_VALIDITY_DAYS);

    let key_pair = KeyPair::generate().map_err(|source| BoundaryError::CaCryptoError {
        subject: hostname.to_string(),
        source,
    })?;
    let cert = params
        .signed_by(&key_pair, root_cert, root_key)
        .map_err(|source| BoundaryError::CaCryptoError {
            subject: hostname.to_string(),
            source,
        })?;

    let cert_der = cert.der().clone();
    let key_der = PrivatePkcs8KeyDer::from(key_pair.serialize_der());
    let signing_key = crypto_provider::sign::any_supported_type(&key_der.into()).map_err(|err| {
        BoundaryError::TlsHandshakeError(format!(
            "failed to build signing key for {hostname}: {err}"
        ))
    })?;
    Ok(Arc::new(CertifiedKey::new(vec![cert_der], signing_key)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn setup_persists_and_reloads_root() {
        let dir = tempfile::tempdir().unwrap();
        let who = InvokingUser::resolve();

        let first = CertificateAuthority::setup(dir.path(), &who).unwrap();
        assert!(first.ca_cert_path.exists());

        let metadata = fs::metadata(&first.ca_cert_path).unwrap();
        use std::os::unix::fs::PermissionsExt;
        assert_eq!(metadata.permissions().mode() & 0o777, 0o644);

        let key_metadata = fs::metadata(dir.path().join(CA_KEY_FILE)).unwrap();
        assert_eq!(key_metadata.permissions().mode() & 0o777, 0o600);

        // Second setup() call against the same directory reloads rather
        // than regenerating: the cert bytes on disk are unchanged.
        let before = fs::read(&first.ca_cert_path).unwrap();
        let _second = CertificateAuthority::setup(dir.path(), &who).unwrap();
        let after = fs::read(&first.ca_cert_path).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn mint_is_idempotent_per_hostname() {
        let dir = tempfile::tempdir().unwrap();
        let who = InvokingUser::resolve();
        let setup = CertificateAuthority::setup(dir.path(), &who).unwrap();

        let a = setup.ca.mint("example.com").unwrap();
        let b = setup.ca.mint("example.com").unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        let other = setup.ca.mint("other.example.com").unwrap();
        assert!(!Arc::ptr_eq(&a, &other));
    }

    #[test]
    fn concurrent_mint_converges_on_one_certificate() {
        let dir = tempfile::tempdir().unwrap();
        let who = InvokingUser::resolve();
        let setup = CertificateAuthority::setup(dir.path(), &who).unwrap();
        let ca = setup.ca.clone();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let ca = ca.clone();
                std::thread::spawn(move || ca.mint("race.example.com").unwrap())
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        for pair in results.windows(2) {
            assert!(Arc::ptr_eq(&pair[0], &pair[1]));
        }
    }
}
