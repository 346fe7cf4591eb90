//! sigrelay-server: TLS WebSocket signaling relay.
//!
//! Accepts `wss://` connections, lets clients sign in with a self-chosen
//! identity, and relays JSON messages between them by identity.

use clap::Parser;
use sigrelay_server::config::{CliOverrides, ServerConfig};
use sigrelay_server::tls::{generate_self_signed_cert, load_tls_config};
use sigrelay_server::RelayServer;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

/// sigrelay-server — TLS WebSocket signaling relay
#[derive(Parser, Debug)]
#[command(name = "sigrelay-server", version, about = "TLS WebSocket signaling relay")]
struct Cli {
    /// Listen address
    #[arg(short, long)]
    address: Option<String>,

    /// Listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// TLS certificate chain (PEM)
    #[arg(long)]
    cert: Option<String>,

    /// TLS private key (PEM)
    #[arg(long)]
    key: Option<String>,

    /// Maximum concurrent connections
    #[arg(long)]
    max_connections: Option<u32>,

    /// Document root (reserved for static files)
    #[arg(long)]
    doc_root: Option<String>,

    /// Deadline for the TLS + WebSocket handshake, in seconds
    #[arg(long)]
    handshake_timeout: Option<u64>,

    /// Config file path
    #[arg(long, default_value = "~/.sigrelay/config.toml")]
    config: String,

    /// Generate self-signed certificate for development
    #[arg(long)]
    generate_cert: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    use tracing_subscriber::EnvFilter;
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting sigrelay-server");

    // Resolve cert/key paths
    let (cert, key) = if cli.generate_cert {
        let dir = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join(".sigrelay");
        match generate_self_signed_cert(&dir) {
            Ok((c, k)) => {
                info!(cert = %c.display(), key = %k.display(), "generated self-signed certificate");
                (
                    Some(c.to_string_lossy().into_owned()),
                    Some(k.to_string_lossy().into_owned()),
                )
            }
            Err(e) => {
                error!(error = %e, "failed to generate self-signed certificate");
                std::process::exit(1);
            }
        }
    } else {
        (cli.cert.clone(), cli.key.clone())
    };

    // Load server config (file + CLI overrides)
    let overrides = CliOverrides {
        address: cli.address.clone(),
        port: cli.port,
        cert,
        key,
        max_connections: cli.max_connections,
        doc_root: cli.doc_root.clone(),
        handshake_timeout: cli.handshake_timeout,
    };
    let config_path = PathBuf::from(&cli.config);
    let server_config = match ServerConfig::load(Some(&config_path), overrides) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    // Load TLS config
    let tls_config = match load_tls_config(&server_config.cert_path, &server_config.key_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load TLS config");
            std::process::exit(1);
        }
    };

    let server = match RelayServer::bind(server_config, Arc::new(tls_config)).await {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "failed to start server");
            std::process::exit(1);
        }
    };

    // Accept until a shutdown signal arrives
    server.run_until(shutdown_signal()).await;

    info!("sigrelay-server stopped");
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }

    info!("received shutdown signal");
}
