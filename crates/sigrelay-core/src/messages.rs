//! Signaling protocol message types.
//!
//! Inbound frames are `{"cmd": <int>, "data": {...}}` objects; outbound
//! replies are `{"res": 0|1, ...}` objects and relayed chat payloads are
//! `{"from": ..., "msg": ...}`.

use serde::Serialize;

/// Numeric command tags carried in the `cmd` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i64)]
pub enum MessageId {
    Nop = 0,
    SignIn = 1,
    SignOut = 2,
    SendMessage = 3,
}

impl From<MessageId> for i64 {
    fn from(m: MessageId) -> i64 {
        m as i64
    }
}

impl TryFrom<i64> for MessageId {
    type Error = i64;
    fn try_from(v: i64) -> Result<Self, i64> {
        match v {
            0 => Ok(Self::Nop),
            1 => Ok(Self::SignIn),
            2 => Ok(Self::SignOut),
            3 => Ok(Self::SendMessage),
            other => Err(other),
        }
    }
}

/// Value of the `res` field in a direct reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(into = "u8")]
#[repr(u8)]
pub enum ResultCode {
    Ok = 0,
    Error = 1,
}

impl From<ResultCode> for u8 {
    fn from(r: ResultCode) -> u8 {
        r as u8
    }
}

/// Reasons a request is refused. Each maps to a fixed `error` string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidRequest,
    InternalError,
    RecipientNotFound,
    IdIsEmpty,
    IdIsAlreadyConnected,
    AlreadySignedIn,
}

impl ErrorKind {
    /// Text placed in the `error` field of the reply.
    pub fn message(self) -> &'static str {
        match self {
            Self::InvalidRequest => "Invalid message",
            Self::InternalError => "Internal error",
            Self::RecipientNotFound => "Recipient not Found",
            Self::IdIsEmpty => "Id is empty",
            Self::IdIsAlreadyConnected => "Id is already connected",
            Self::AlreadySignedIn => "Already signed in",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.message())
    }
}

/// A decoded inbound frame.
///
/// Missing string fields decode as empty strings; consumers treat empty
/// and absent the same way.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Nop,
    SignIn { id: String },
    SignOut,
    SendMessage { to: String, msg: String },
    Unknown,
}

impl Command {
    /// The wire tag for this command, if it has one.
    pub fn message_id(&self) -> Option<MessageId> {
        match self {
            Self::Nop => Some(MessageId::Nop),
            Self::SignIn { .. } => Some(MessageId::SignIn),
            Self::SignOut => Some(MessageId::SignOut),
            Self::SendMessage { .. } => Some(MessageId::SendMessage),
            Self::Unknown => None,
        }
    }
}

// ── Outbound payloads ─────────────────────────────────────────────────

/// Direct reply to the sender of a frame.
#[derive(Debug, Clone, Serialize)]
pub struct Response<'a> {
    pub res: ResultCode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<&'a str>,
}

/// Reply to a successful sign-in. The key is the literal string `data.cmd`.
#[derive(Debug, Clone, Serialize)]
pub struct SignInResponse {
    pub res: ResultCode,
    #[serde(rename = "data.cmd")]
    pub cmd: i64,
}

/// Payload relayed to the recipient of a `SEND_MESSAGE`.
#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage<'a> {
    pub from: &'a str,
    pub msg: &'a str,
}
