//! sigrelay-core: wire protocol for the sigrelay signaling server.
//!
//! Provides the command and response types, the JSON codec that turns
//! inbound frames into [`Command`]s and outcomes into response frames,
//! and the shared error type.

pub mod codec;
pub mod error;
pub mod messages;

// Re-export commonly used items at crate root.
pub use codec::{encode_chat, encode_error, encode_nop, encode_ok, encode_sign_in_ok, parse};
pub use error::{SignalError, SignalResult};
pub use messages::{Command, ErrorKind, MessageId, ResultCode};
