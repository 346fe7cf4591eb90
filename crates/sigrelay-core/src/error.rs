use thiserror::Error;

/// Errors produced by the sigrelay protocol and transport layers.
#[derive(Debug, Error)]
pub enum SignalError {
    #[error("codec error: {0}")]
    Codec(String),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("tls error: {0}")]
    Tls(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("timed out")]
    Timeout,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for SignalError {
    fn from(e: serde_json::Error) -> Self {
        SignalError::Codec(e.to_string())
    }
}

pub type SignalResult<T> = Result<T, SignalError>;
