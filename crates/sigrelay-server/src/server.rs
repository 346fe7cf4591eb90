//! Core server: accepts TCP connections and hands each one to a session.
//!
//! Owns the listening socket, the TLS acceptor and the shared registry.
//! Accept errors are logged and the loop keeps going; only a failure to
//! bind is fatal, and that happens before the loop starts.

use crate::config::ServerConfig;
use crate::registry::Registry;
use crate::session;
use sigrelay_core::{SignalError, SignalResult};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info};

/// Pause after a failed accept (e.g. fd exhaustion).
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// The relay server instance.
pub struct RelayServer {
    listener: TcpListener,
    tls: TlsAcceptor,
    registry: Arc<Registry>,
    handshake_timeout: Duration,
}

impl RelayServer {
    /// Create the registry and bind the listening socket.
    pub async fn bind(
        config: ServerConfig,
        tls_config: Arc<rustls::ServerConfig>,
    ) -> SignalResult<Self> {
        let listener = TcpListener::bind(config.bind_addr).await.map_err(|e| {
            SignalError::Transport(format!("bind {} failed: {e}", config.bind_addr))
        })?;

        let registry = Arc::new(Registry::new(config.doc_root, config.max_connections));

        info!(
            addr = %listener.local_addr()?,
            max_connections = config.max_connections,
            "listening"
        );

        Ok(Self {
            listener,
            tls: TlsAcceptor::from(tls_config),
            registry,
            handshake_timeout: config.handshake_timeout,
        })
    }

    /// Address the server is actually bound to.
    pub fn local_addr(&self) -> SignalResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Access the session registry.
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Accept connections until `shutdown` resolves.
    ///
    /// Stopping only ends the accept loop; sessions already handed off keep
    /// running until their clients disconnect.
    pub async fn run_until<F>(self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("accept loop stopped");
                    break;
                }

                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((tcp, remote)) => {
                            debug!(remote = %remote, "TCP connection accepted");
                            if let Err(e) = tcp.set_nodelay(true) {
                                debug!(remote = %remote, error = %e, "could not set TCP_NODELAY");
                            }
                            session::spawn(
                                tcp,
                                remote,
                                self.tls.clone(),
                                self.registry.clone(),
                                self.handshake_timeout,
                            );
                        }
                        Err(e) => {
                            error!(error = %e, "TCP accept failed");
                            tokio::time::sleep(ACCEPT_BACKOFF).await;
                        }
                    }
                }
            }
        }
    }
}
