//! sigrelay-server: TLS WebSocket signaling relay.
//!
//! Clients connect over `wss://`, optionally sign in with an identity, and
//! exchange JSON messages routed by identity rather than by address.

pub mod config;
pub mod registry;
pub mod server;
pub mod session;
pub mod tls;

#[cfg(test)]
mod test_support;

pub use config::{CliOverrides, ServerConfig};
pub use registry::Registry;
pub use server::RelayServer;
pub use session::{Session, SessionId, SessionState};
