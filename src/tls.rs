//! Shared TLS plumbing used by both the protocol server and protocol client:
//! one-time crypto-provider installation and PEM/DER key conversion.

use std::sync::OnceLock;

use rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};

use crate::error::{Result, WarpDeckError};

static RUSTLS_PROVIDER_INIT: OnceLock<()> = OnceLock::new();

/// Installs the `ring` crypto provider as the process default, if nothing
/// else has installed one yet. Both outcomes (freshly installed or already
/// installed by a prior call) are success cases.
pub fn ensure_crypto_provider() {
    RUSTLS_PROVIDER_INIT.get_or_init(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

pub fn load_private_key_pem(pem: &str) -> Result<PrivateKeyDer<'static>> {
    let mut reader = std::io::BufReader::new(pem.as_bytes());
    let mut keys = rustls_pemfile::pkcs8_private_keys(&mut reader);
    match keys.next() {
        Some(Ok(key)) => Ok(PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(
            key.secret_pkcs8_der().to_vec(),
        ))),
        Some(Err(e)) => Err(WarpDeckError::Identity(format!("invalid private key PEM: {e}"))),
        None => Err(WarpDeckError::Identity("no private key in PEM".to_string())),
    }
}
