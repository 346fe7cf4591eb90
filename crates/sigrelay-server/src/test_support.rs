//! Shared fixtures for TLS-backed tests.

use crate::tls::{build_tls_config, crypto_provider};
use rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer, ServerName};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tokio_tungstenite::WebSocketStream;

pub type Client = WebSocketStream<TlsStream<TcpStream>>;

/// A server config for a fresh self-signed `localhost` certificate, and a
/// connector that trusts it.
pub fn tls_pair() -> (Arc<rustls::ServerConfig>, TlsConnector) {
    let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let cert_der = certified.cert.der().clone();
    let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(
        certified.key_pair.serialize_der(),
    ));
    let server_tls = build_tls_config(vec![cert_der.clone()], key_der).unwrap();

    let mut roots = rustls::RootCertStore::empty();
    roots.add(cert_der).unwrap();
    let client_tls = rustls::ClientConfig::builder_with_provider(crypto_provider())
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_root_certificates(roots)
        .with_no_client_auth();

    (Arc::new(server_tls), TlsConnector::from(Arc::new(client_tls)))
}

/// TLS + WebSocket client handshake over an open TCP stream.
pub async fn ws_client(connector: &TlsConnector, tcp: TcpStream) -> Client {
    let name = ServerName::try_from("localhost").unwrap();
    let tls = connector.connect(name, tcp).await.unwrap();
    let (ws, _) = tokio_tungstenite::client_async("wss://localhost/", tls)
        .await
        .unwrap();
    ws
}
