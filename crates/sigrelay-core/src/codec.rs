//! JSON codec for the signaling protocol.
//!
//! Inbound: one JSON object per WebSocket text frame, decoded into a
//! [`Command`]. Outbound: compact JSON strings built from the typed
//! payloads in [`crate::messages`].

use crate::error::{SignalError, SignalResult};
use crate::messages::{ChatMessage, Command, ErrorKind, MessageId, Response, ResultCode, SignInResponse};
use serde::Serialize;
use serde_json::Value;

/// Literal payload carried by the reply to a `NOP`.
pub const NOP_PAYLOAD: &str = "NOP";

/// Pre-encoded internal error, used if serialization ever fails.
const INTERNAL_ERROR_FRAME: &str = r#"{"res":1,"error":"Internal error"}"#;

/// Decode one inbound frame.
///
/// Malformed JSON and non-object top levels are errors. A missing,
/// non-integer or out-of-range `cmd` yields [`Command::Unknown`].
/// Missing `data` fields decode as empty strings.
pub fn parse(frame: &str) -> SignalResult<Command> {
    let value: Value = serde_json::from_str(frame)?;
    let root = value
        .as_object()
        .ok_or_else(|| SignalError::InvalidMessage("top-level value is not an object".into()))?;

    let message_id = match root.get("cmd").and_then(command_tag).map(MessageId::try_from) {
        Some(Ok(id)) => id,
        _ => return Ok(Command::Unknown),
    };

    let data = root.get("data");
    let command = match message_id {
        MessageId::Nop => Command::Nop,
        MessageId::SignIn => Command::SignIn {
            id: data_field(data, "id")?,
        },
        MessageId::SignOut => Command::SignOut,
        MessageId::SendMessage => Command::SendMessage {
            to: data_field(data, "to")?,
            msg: data_field(data, "msg")?,
        },
    };
    Ok(command)
}

/// Integer tags may arrive as JSON numbers or as numeric strings.
fn command_tag(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Read `data.<key>` as a string. Scalars are stringified; objects and
/// arrays are rejected.
fn data_field(data: Option<&Value>, key: &str) -> SignalResult<String> {
    match data.and_then(|d| d.get(key)) {
        // null reads as absent, so `{"id":null}` is an empty id
        None | Some(Value::Null) => Ok(String::new()),
        Some(Value::String(s)) => Ok(s.clone()),
        Some(v @ (Value::Number(_) | Value::Bool(_))) => Ok(v.to_string()),
        Some(_) => Err(SignalError::InvalidMessage(format!(
            "data.{key} must be a string"
        ))),
    }
}

fn to_json<T: Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| INTERNAL_ERROR_FRAME.to_string())
}

/// `{"res":1,"error":"<message>"}`
pub fn encode_error(kind: ErrorKind) -> String {
    to_json(&Response {
        res: ResultCode::Error,
        data: None,
        error: Some(kind.message()),
    })
}

/// `{"res":0}` or `{"res":0,"data":"<payload>"}`
pub fn encode_ok(payload: Option<&str>) -> String {
    to_json(&Response {
        res: ResultCode::Ok,
        data: payload,
        error: None,
    })
}

/// `{"res":0,"data":"NOP"}`
pub fn encode_nop() -> String {
    encode_ok(Some(NOP_PAYLOAD))
}

/// `{"res":0,"data.cmd":1}`
pub fn encode_sign_in_ok() -> String {
    to_json(&SignInResponse {
        res: ResultCode::Ok,
        cmd: MessageId::SignIn.into(),
    })
}

/// `{"from":"<from>","msg":"<msg>"}`, relayed to the recipient only.
pub fn encode_chat(from: &str, msg: &str) -> String {
    to_json(&ChatMessage { from, msg })
}
