//! Identity Store: certificate/key lifecycle, fingerprint computation, and
//! the persistent trust store.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair, SerialNumber};
use rand::rngs::OsRng;
use rsa::pkcs8::EncodePrivateKey;
use rsa::RsaPrivateKey;
use rustls::pki_types::{CertificateDer, PrivatePkcs8KeyDer};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Result, WarpDeckError};
use crate::model::TrustedPeerRecord;

const RSA_KEY_BITS: usize = 2048;
const CERT_VALIDITY_DAYS: i64 = 365;

/// Holds the local certificate/key and the persistent trust store, each
/// behind a single lock.
pub struct IdentityStore {
    config_dir: PathBuf,
    cert_path: PathBuf,
    key_path: PathBuf,
    trust_store_path: PathBuf,
    device_id: String,
    inner: RwLock<Inner>,
}

struct Inner {
    cert_der: CertificateDer<'static>,
    cert_pem: String,
    key_pem: String,
    fingerprint: String,
    trusted: Vec<TrustedPeerRecord>,
}

impl IdentityStore {
    /// `initialize(config_dir)` — creates the directory if absent and
    /// generates or loads the certificate, then loads the trust store.
    /// Certificate failure is fatal (propagated); trust-store load failure
    /// is non-fatal (starts empty).
    pub fn initialize(config_dir: impl AsRef<Path>) -> Result<Arc<Self>> {
        let config_dir = config_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&config_dir)?;
        set_dir_owner_only(&config_dir)?;

        let cert_path = config_dir.join("cert.pem");
        let key_path = config_dir.join("key.pem");
        let trust_store_path = config_dir.join("trust_store.json");
        let device_id_path = config_dir.join("device_id");

        let (cert_der, cert_pem, key_pem) = ensure_certificate(&cert_path, &key_path)?;
        let fingerprint = fingerprint_of_der(&cert_der);
        let device_id = ensure_device_id(&device_id_path)?;

        let trusted = match load_trust_store(&trust_store_path) {
            Ok(t) => t,
            Err(e) => {
                warn!("trust store unreadable, starting empty: {e}");
                Vec::new()
            }
        };

        info!(fingerprint = %fingerprint, "identity ready");

        Ok(Arc::new(Self {
            config_dir,
            cert_path,
            key_path,
            trust_store_path,
            device_id,
            inner: RwLock::new(Inner {
                cert_der,
                cert_pem,
                key_pem,
                fingerprint,
                trusted,
            }),
        }))
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    /// A random identifier persisted independently of the certificate, so a
    /// device keeps the same id across a future re-keying.
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn cert_path(&self) -> &Path {
        &self.cert_path
    }

    pub fn key_path(&self) -> &Path {
        &self.key_path
    }

    pub fn fingerprint(&self) -> String {
        self.inner.read().fingerprint.clone()
    }

    pub fn cert_pem(&self) -> String {
        self.inner.read().cert_pem.clone()
    }

    pub fn key_pem(&self) -> String {
        self.inner.read().key_pem.clone()
    }

    pub fn cert_der(&self) -> CertificateDer<'static> {
        self.inner.read().cert_der.clone()
    }

    /// True iff the stored trust entry for `device_id` has exactly this
    /// fingerprint.
    pub fn is_trusted(&self, device_id: &str, fingerprint: &str) -> bool {
        self.inner
            .read()
            .trusted
            .iter()
            .any(|p| p.device_id == device_id && p.fingerprint == fingerprint)
    }

    pub fn add_trusted(&self, device_id: &str, fingerprint: &str, name: &str) -> Result<()> {
        let mut inner = self.inner.write();
        inner.trusted.retain(|p| p.device_id != device_id);
        inner.trusted.push(TrustedPeerRecord {
            device_id: device_id.to_string(),
            fingerprint: fingerprint.to_string(),
            name: name.to_string(),
        });
        save_trust_store(&self.trust_store_path, &inner.trusted)
    }

    pub fn remove_trusted(&self, device_id: &str) -> Result<()> {
        let mut inner = self.inner.write();
        inner.trusted.retain(|p| p.device_id != device_id);
        save_trust_store(&self.trust_store_path, &inner.trusted)
    }

    pub fn list_trusted(&self) -> Vec<TrustedPeerRecord> {
        self.inner.read().trusted.clone()
    }

    /// Utility for verifying a peer certificate presented at the TLS
    /// handshake: parses a PEM certificate and returns its hex fingerprint.
    pub fn fingerprint_of(cert_pem: &str) -> Result<String> {
        let der = pem_to_der(cert_pem)?;
        Ok(fingerprint_of_der(&der))
    }
}

/// The lowercase hex encoding of `SHA-256(DER(certificate))`. Must be
/// bit-identical across nodes that compute it from the same certificate.
pub fn fingerprint_of_der(der: &CertificateDer<'_>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(der.as_ref());
    format!("{:x}", hasher.finalize())
}

fn pem_to_der(cert_pem: &str) -> Result<CertificateDer<'static>> {
    let mut reader = std::io::BufReader::new(cert_pem.as_bytes());
    let mut certs = rustls_pemfile::certs(&mut reader);
    match certs.next() {
        Some(Ok(der)) => Ok(der),
        Some(Err(e)) => Err(WarpDeckError::Identity(format!("invalid PEM: {e}"))),
        None => Err(WarpDeckError::Identity("no certificate in PEM".to_string())),
    }
}

fn ensure_device_id(path: &Path) -> Result<String> {
    if path.exists() {
        let id = std::fs::read_to_string(path)?.trim().to_string();
        if !id.is_empty() {
            return Ok(id);
        }
    }
    let id = Uuid::new_v4().to_string();
    write_atomic_owner_only(path, id.as_bytes())?;
    Ok(id)
}

/// Loads an existing cert/key pair, or generates a fresh RSA-2048
/// self-signed certificate.
fn ensure_certificate(
    cert_path: &Path,
    key_path: &Path,
) -> Result<(CertificateDer<'static>, String, String)> {
    if cert_path.exists() && key_path.exists() {
        debug!("loading existing identity from {}", cert_path.display());
        let cert_pem = std::fs::read_to_string(cert_path)?;
        let key_pem = std::fs::read_to_string(key_path)?;
        let der = pem_to_der(&cert_pem)?;
        return Ok((der, cert_pem, key_pem));
    }

    info!("generating new RSA-2048 identity");
    let (cert_der, cert_pem, key_pem) = generate_identity()?;

    write_atomic_owner_only(key_path, key_pem.as_bytes())?;
    write_atomic_owner_only(cert_path, cert_pem.as_bytes())?;

    Ok((cert_der, cert_pem, key_pem))
}

/// Generates a 2048-bit RSA key and a self-signed X.509 certificate with
/// `C=US, O=WarpDeck, CN=WarpDeck Device`, serial 1, one year's validity and
/// a SHA-256 signature. The key is generated with the `rsa` crate and fed
/// into `rcgen` via its PKCS#8-DER keypair constructor.
fn generate_identity() -> Result<(CertificateDer<'static>, String, String)> {
    let private_key = RsaPrivateKey::new(&mut OsRng, RSA_KEY_BITS)
        .map_err(|e| WarpDeckError::RsaKey(e.to_string()))?;
    let pkcs8_der = private_key
        .to_pkcs8_der()
        .map_err(|e| WarpDeckError::RsaKey(e.to_string()))?;

    let key_pair = KeyPair::from_pkcs8_der_and_sign_algo(
        &PrivatePkcs8KeyDer::from(pkcs8_der.as_bytes().to_vec()),
        &rcgen::PKCS_RSA_SHA256,
    )?;

    let mut params = CertificateParams::new(Vec::<String>::new())?;
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CountryName, "US");
    dn.push(DnType::OrganizationName, "WarpDeck");
    dn.push(DnType::CommonName, "WarpDeck Device");
    params.distinguished_name = dn;
    params.serial_number = Some(SerialNumber::from(vec![1u8]));
    params.not_before = time::OffsetDateTime::now_utc();
    params.not_after = params.not_before + time::Duration::days(CERT_VALIDITY_DAYS);

    let cert = params.self_signed(&key_pair)?;
    let cert_pem = cert.pem();
    let key_pem = key_pair.serialize_pem();
    let cert_der = cert.der().clone();

    Ok((cert_der, cert_pem, key_pem))
}

/// Writes `contents` to `path` via write-temp, set-owner-only-permissions,
/// `fsync`, then atomic rename.
fn write_atomic_owner_only(path: &Path, contents: &[u8]) -> Result<()> {
    let tmp_path = path.with_extension("tmp");
    {
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)?;
        file.write_all(contents)?;
        set_file_owner_only(&tmp_path)?;
        file.sync_all()?;
    }
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

#[cfg(unix)]
fn set_file_owner_only(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    Ok(())
}

#[cfg(not(unix))]
fn set_file_owner_only(_path: &Path) -> Result<()> {
    Ok(())
}

#[cfg(unix)]
fn set_dir_owner_only(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))?;
    Ok(())
}

#[cfg(not(unix))]
fn set_dir_owner_only(_path: &Path) -> Result<()> {
    Ok(())
}

/// A JSON array of `{device_id, fingerprint, name}`. An unparseable file is
/// treated as empty but not overwritten until the next successful save.
fn load_trust_store(path: &Path) -> Result<Vec<TrustedPeerRecord>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let contents = std::fs::read_to_string(path)?;
    let trusted: Vec<TrustedPeerRecord> = serde_json::from_str(&contents)?;
    Ok(trusted)
}

fn save_trust_store(path: &Path, trusted: &[TrustedPeerRecord]) -> Result<()> {
    let contents = serde_json::to_vec_pretty(trusted)?;
    write_atomic_owner_only(path, &contents)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_identity_store_has_empty_trust_list() {
        let dir = tempfile::tempdir().unwrap();
        let store = IdentityStore::initialize(dir.path()).unwrap();
        assert!(store.list_trusted().is_empty());
    }

    #[test]
    fn identity_reloads_same_fingerprint_across_restarts() {
        let dir = tempfile::tempdir().unwrap();
        let first = IdentityStore::initialize(dir.path()).unwrap();
        let fp1 = first.fingerprint();
        drop(first);

        let second = IdentityStore::initialize(dir.path()).unwrap();
        assert_eq!(fp1, second.fingerprint());
    }

    #[test]
    fn device_id_is_stable_across_restarts() {
        let dir = tempfile::tempdir().unwrap();
        let first = IdentityStore::initialize(dir.path()).unwrap();
        let id1 = first.device_id().to_string();
        drop(first);

        let second = IdentityStore::initialize(dir.path()).unwrap();
        assert_eq!(id1, second.device_id());
    }

    #[test]
    fn fingerprint_of_round_trips_through_pem() {
        let dir = tempfile::tempdir().unwrap();
        let store = IdentityStore::initialize(dir.path()).unwrap();
        let pem = store.cert_pem();
        let recomputed = IdentityStore::fingerprint_of(&pem).unwrap();
        assert_eq!(recomputed, store.fingerprint());
    }

    #[test]
    fn trust_store_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = IdentityStore::initialize(dir.path()).unwrap();

        store.add_trusted("device-a", "abcd1234", "Alice's Laptop").unwrap();
        assert!(store.is_trusted("device-a", "abcd1234"));
        assert!(!store.is_trusted("device-a", "wrong-fingerprint"));

        let reloaded = IdentityStore::initialize(dir.path()).unwrap();
        assert_eq!(reloaded.list_trusted(), store.list_trusted());
    }

    #[test]
    fn removing_untrusted_peer_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let store = IdentityStore::initialize(dir.path()).unwrap();
        store.remove_trusted("does-not-exist").unwrap();
        assert!(store.list_trusted().is_empty());
    }

    #[test]
    fn corrupt_trust_store_file_is_treated_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("trust_store.json"), b"not json").unwrap();
        let store = IdentityStore::initialize(dir.path()).unwrap();
        assert!(store.list_trusted().is_empty());
    }
}
