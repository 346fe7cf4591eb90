//! TLS server context: PEM loading and development certificates.

use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use sigrelay_core::{SignalError, SignalResult};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Load TLS certificate chain and key from PEM files, returning a rustls ServerConfig.
pub fn load_tls_config(cert_path: &Path, key_path: &Path) -> SignalResult<rustls::ServerConfig> {
    let cert_pem = std::fs::read(cert_path).map_err(|e| {
        SignalError::Tls(format!("cannot read cert {}: {e}", cert_path.display()))
    })?;
    let key_pem = std::fs::read(key_path)
        .map_err(|e| SignalError::Tls(format!("cannot read key {}: {e}", key_path.display())))?;

    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut &cert_pem[..])
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| SignalError::Tls(format!("bad certificate PEM: {e}")))?;
    if certs.is_empty() {
        return Err(SignalError::Tls(format!(
            "no certificates found in {}",
            cert_path.display()
        )));
    }

    let key = rustls_pemfile::private_key(&mut &key_pem[..])
        .map_err(|e| SignalError::Tls(format!("bad key PEM: {e}")))?
        .ok_or_else(|| SignalError::Tls("no private key found in PEM".into()))?;

    build_tls_config(certs, key)
}

/// Build a server config from an already-decoded chain and key.
pub fn build_tls_config(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> SignalResult<rustls::ServerConfig> {
    let mut tls_config = rustls::ServerConfig::builder_with_provider(crypto_provider())
        .with_safe_default_protocol_versions()
        .map_err(|e| SignalError::Tls(e.to_string()))?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| SignalError::Tls(e.to_string()))?;

    // WebSocket upgrade runs over HTTP/1.1
    tls_config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(tls_config)
}

/// Crypto provider for every TLS config built by this crate (ring).
pub fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Generate a self-signed certificate for development use, writing
/// `cert.pem` and `key.pem` into `dir`.
pub fn generate_self_signed_cert(dir: &Path) -> SignalResult<(PathBuf, PathBuf)> {
    std::fs::create_dir_all(dir)?;

    let cert_path = dir.join("cert.pem");
    let key_path = dir.join("key.pem");

    let tls_err = |e: rcgen::Error| SignalError::Tls(format!("certificate generation failed: {e}"));

    let mut params = rcgen::CertificateParams::new(vec![
        "localhost".to_string(),
        "127.0.0.1".to_string(),
        "::1".to_string(),
    ])
    .map_err(tls_err)?;
    params.distinguished_name = rcgen::DistinguishedName::new();
    params
        .distinguished_name
        .push(rcgen::DnType::CommonName, "sigrelay dev cert");

    let key_pair = rcgen::KeyPair::generate().map_err(tls_err)?;
    let cert = params.self_signed(&key_pair).map_err(tls_err)?;

    std::fs::write(&cert_path, cert.pem())?;
    std::fs::write(&key_path, key_pair.serialize_pem())?;

    Ok((cert_path, key_path))
}
