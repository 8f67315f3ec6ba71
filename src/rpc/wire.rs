//! RPC wire format
//!
//! **Request**: one part, the compact JSON encoding of
//! `[command, [args...], {kwargs...}]`.
//!
//! **Reply**: two parts, a type tag then a payload:
//!
//! | tag | payload |
//! |-----|---------|
//! | `value` | JSON value |
//! | `error` | JSON error payload (usually a string) |
//! | `bindata` | raw bytes |
//!
//! Each part travels as one ZeroMQ message frame.

use bytes::Bytes;
use serde_json::{Map, Value};

use crate::error::{AppResult, ScopeError};

/// A message made of one or more byte parts.
pub type Multipart = Vec<Bytes>;

/// Keyword arguments of a call.
pub type Kwargs = Map<String, Value>;

/// Command returning the server's procedure catalog.
pub const DESCRIBE_COMMAND: &str = "__DESCRIBE__";

/// Payload pushed on the interrupt channel.
pub const INTERRUPT_PAYLOAD: &[u8] = b"interrupt";

/// Reply tag for a JSON value.
pub const TAG_VALUE: &str = "value";
/// Reply tag for a remote error.
pub const TAG_ERROR: &str = "error";
/// Reply tag for raw binary data.
pub const TAG_BINDATA: &str = "bindata";

/// A successful reply.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// A JSON value (`value` tag).
    Value(Value),
    /// Raw bytes (`bindata` tag).
    Binary(Bytes),
}

impl Reply {
    /// The JSON value, or a protocol error for binary replies.
    pub fn into_value(self) -> AppResult<Value> {
        match self {
            Reply::Value(v) => Ok(v),
            Reply::Binary(b) => Err(ScopeError::Protocol(format!(
                "expected a JSON value, got {} bytes of binary data",
                b.len()
            ))),
        }
    }

    /// The raw bytes, or a protocol error for JSON replies.
    pub fn into_binary(self) -> AppResult<Bytes> {
        match self {
            Reply::Binary(b) => Ok(b),
            Reply::Value(v) => Err(ScopeError::Protocol(format!(
                "expected binary data, got JSON value {v}"
            ))),
        }
    }

    /// Borrow the JSON value, if this is one.
    pub fn as_value(&self) -> Option<&Value> {
        match self {
            Reply::Value(v) => Some(v),
            Reply::Binary(_) => None,
        }
    }
}

impl From<Value> for Reply {
    fn from(value: Value) -> Self {
        Reply::Value(value)
    }
}

/// Encode `(command, args, kwargs)` as the request payload.
pub fn encode_request(command: &str, args: &[Value], kwargs: &Kwargs) -> AppResult<Bytes> {
    Ok(Bytes::from(serde_json::to_vec(&(command, args, kwargs))?))
}

/// Decode a request payload; the server-side counterpart of [`encode_request`].
pub fn decode_request(payload: &[u8]) -> AppResult<(String, Vec<Value>, Kwargs)> {
    Ok(serde_json::from_slice(payload)?)
}

/// Decode a reply frame. `error` replies become [`ScopeError::Remote`].
pub fn decode_reply(parts: Multipart) -> AppResult<Reply> {
    let mut parts = parts.into_iter();
    let (Some(tag), Some(payload)) = (parts.next(), parts.next()) else {
        return Err(ScopeError::Protocol("reply must have a type tag and a payload".into()));
    };
    match std::str::from_utf8(&tag) {
        Ok(TAG_VALUE) => Ok(Reply::Value(serde_json::from_slice(&payload)?)),
        Ok(TAG_BINDATA) => Ok(Reply::Binary(payload)),
        Ok(TAG_ERROR) => {
            let error = serde_json::from_slice(&payload)
                .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&payload).into_owned()));
            Err(ScopeError::remote(error))
        }
        _ => Err(ScopeError::Protocol(format!(
            "unknown reply type {:?}",
            String::from_utf8_lossy(&tag)
        ))),
    }
}

/// Build a `value` reply frame.
pub fn value_reply(value: &Value) -> AppResult<Multipart> {
    Ok(vec![
        Bytes::from_static(TAG_VALUE.as_bytes()),
        Bytes::from(serde_json::to_vec(value)?),
    ])
}

/// Build an `error` reply frame.
pub fn error_reply(error: &Value) -> AppResult<Multipart> {
    Ok(vec![
        Bytes::from_static(TAG_ERROR.as_bytes()),
        Bytes::from(serde_json::to_vec(error)?),
    ])
}

/// Build a `bindata` reply frame.
pub fn binary_reply(data: Bytes) -> Multipart {
    vec![Bytes::from_static(TAG_BINDATA.as_bytes()), data]
}
