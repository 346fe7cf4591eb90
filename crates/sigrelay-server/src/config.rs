//! Server configuration: TOML file + CLI overrides.

use serde::Deserialize;
use sigrelay_core::{SignalError, SignalResult};
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_address")]
    pub address: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_cert_path")]
    pub cert: String,
    #[serde(default = "default_key_path")]
    pub key: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_doc_root")]
    pub doc_root: String,
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout: u64,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            address: default_address(),
            port: default_port(),
            cert: default_cert_path(),
            key: default_key_path(),
            max_connections: default_max_connections(),
            doc_root: default_doc_root(),
            handshake_timeout: default_handshake_timeout(),
        }
    }
}

fn default_address() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8080
}
fn default_cert_path() -> String {
    "~/.sigrelay/cert.pem".to_string()
}
fn default_key_path() -> String {
    "~/.sigrelay/key.pem".to_string()
}
fn default_max_connections() -> u32 {
    100
}
fn default_doc_root() -> String {
    ".".to_string()
}
fn default_handshake_timeout() -> u64 {
    30
}

/// Values supplied on the command line. `None` means "use the file/default".
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub address: Option<String>,
    pub port: Option<u16>,
    pub cert: Option<String>,
    pub key: Option<String>,
    pub max_connections: Option<u32>,
    pub doc_root: Option<String>,
    pub handshake_timeout: Option<u64>,
}

/// Resolved server configuration (paths expanded, CLI overrides applied).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    pub max_connections: u32,
    pub doc_root: PathBuf,
    pub handshake_timeout: Duration,
}

impl ServerConfig {
    /// Load config from a TOML file, then apply CLI overrides.
    pub fn load(config_path: Option<&Path>, cli: CliOverrides) -> SignalResult<Self> {
        let file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded)?;
                    parse_config_file(&content)?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };

        Self::resolve(file_config, cli)
    }

    /// Merge a parsed config file with CLI overrides and validate the result.
    pub fn resolve(file_config: ConfigFile, cli: CliOverrides) -> SignalResult<Self> {
        let server = file_config.server;

        let address = cli.address.unwrap_or(server.address);
        let port = cli.port.unwrap_or(server.port);
        let ip: IpAddr = address
            .parse()
            .map_err(|e| SignalError::Config(format!("invalid address {address:?}: {e}")))?;

        let max_connections = cli.max_connections.unwrap_or(server.max_connections);
        if max_connections == 0 {
            return Err(SignalError::Config(
                "max_connections must be at least 1".into(),
            ));
        }

        let cert_str = cli.cert.unwrap_or(server.cert);
        let key_str = cli.key.unwrap_or(server.key);
        let doc_root = cli.doc_root.unwrap_or(server.doc_root);
        let handshake_timeout = cli.handshake_timeout.unwrap_or(server.handshake_timeout);

        Ok(Self {
            bind_addr: SocketAddr::new(ip, port),
            cert_path: expand_tilde_str(&cert_str),
            key_path: expand_tilde_str(&key_str),
            max_connections,
            doc_root: expand_tilde_str(&doc_root),
            handshake_timeout: Duration::from_secs(handshake_timeout),
        })
    }
}

/// Parse the contents of a config TOML file.
pub fn parse_config_file(content: &str) -> SignalResult<ConfigFile> {
    toml::from_str::<ConfigFile>(content)
        .map_err(|e| SignalError::Config(format!("config parse error: {e}")))
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    expand_tilde_str(&s)
}

fn expand_tilde_str(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_without_file() {
        let cfg = ServerConfig::resolve(ConfigFile::default(), CliOverrides::default()).unwrap();
        assert_eq!(cfg.bind_addr, "0.0.0.0:8080".parse().unwrap());
        assert_eq!(cfg.max_connections, 100);
        assert_eq!(cfg.doc_root, PathBuf::from("."));
        assert_eq!(cfg.handshake_timeout, Duration::from_secs(30));
    }

    #[test]
    fn parse_toml_config() {
        let file = parse_config_file(
            r#"
            [server]
            address = "127.0.0.1"
            port = 9443
            max_connections = 4
            cert = "/etc/sigrelay/cert.pem"
            "#,
        )
        .unwrap();
        let cfg = ServerConfig::resolve(file, CliOverrides::default()).unwrap();
        assert_eq!(cfg.bind_addr, "127.0.0.1:9443".parse().unwrap());
        assert_eq!(cfg.max_connections, 4);
        assert_eq!(cfg.cert_path, PathBuf::from("/etc/sigrelay/cert.pem"));
    }

    #[test]
    fn cli_overrides_file() {
        let file = parse_config_file("[server]\nport = 9443\nmax_connections = 4\n").unwrap();
        let cli = CliOverrides {
            port: Some(7000),
            max_connections: Some(2),
            ..Default::default()
        };
        let cfg = ServerConfig::resolve(file, cli).unwrap();
        assert_eq!(cfg.bind_addr.port(), 7000);
        assert_eq!(cfg.max_connections, 2);
    }

    #[test]
    fn zero_max_connections_rejected() {
        let cli = CliOverrides {
            max_connections: Some(0),
            ..Default::default()
        };
        assert!(ServerConfig::resolve(ConfigFile::default(), cli).is_err());
    }

    #[test]
    fn bad_address_rejected() {
        let cli = CliOverrides {
            address: Some("not an ip".into()),
            ..Default::default()
        };
        assert!(ServerConfig::resolve(ConfigFile::default(), cli).is_err());
    }

    #[test]
    fn malformed_toml_rejected() {
        assert!(parse_config_file("[server\nport = ").is_err());
    }

    #[test]
    fn missing_file_uses_defaults() {
        let path = Path::new("/nonexistent/sigrelay/config.toml");
        let cfg = ServerConfig::load(Some(path), CliOverrides::default()).unwrap();
        assert_eq!(cfg.bind_addr.port(), 8080);
    }
}
