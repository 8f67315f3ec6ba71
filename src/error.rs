//! Custom error types for the library.
//!
//! This module defines the primary error type, `ScopeError`, shared by the serial
//! messaging layer and the RPC client. Using the `thiserror` crate, it provides a
//! single place where every failure a caller may need to distinguish is named.
//!
//! ## Error Hierarchy
//!
//! - **`Configuration`**: an invalid combination of options (for example a
//!   persistent, non-coalescing callback, or a procedure catalog with duplicate
//!   names). Always raised before any I/O happens.
//! - **`Remote`**: the server answered with an `error` reply. The payload is kept
//!   verbatim.
//! - **`Timeout`**: no reply arrived before the call deadline. Carries no server
//!   payload.
//! - **`HeartbeatLost`**: the heartbeat monitor has flagged the server as dead, so
//!   the call was abandoned without waiting out the deadline.
//! - **`WriteProtected`**: assignment to a namespace attribute that is not a remote
//!   property. Raised locally; nothing is sent.
//! - **`Io`**, **`Json`**, **`ConfigLoad`**, **`Serial`**, **`Transport`**,
//!   **`Protocol`**: plumbing failures from the layers underneath.
//!
//! By using `#[from]`, `ScopeError` can be created from the underlying error types
//! with the `?` operator.

use std::time::Duration;

use thiserror::Error;

/// Convenience alias for results using the library error type.
pub type AppResult<T> = std::result::Result<T, ScopeError>;

/// Every failure the library reports.
#[derive(Error, Debug)]
pub enum ScopeError {
    /// Invalid option combination, raised before any I/O.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Figment could not load or extract the configuration.
    #[error("Configuration load error: {0}")]
    ConfigLoad(#[from] figment::Error),

    /// Underlying I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding or decoding failure.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Serial port could not be opened or written.
    #[error("Serial port error: {0}")]
    Serial(String),

    /// Socket-level failure talking to the server.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Malformed message from a device or the server.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The instrument reported an error or did not answer.
    #[error("Instrument error: {0}")]
    Instrument(String),

    /// The server replied with an error; `message` is its payload rendered as text.
    #[error("Remote error: {message}")]
    Remote {
        /// Payload rendered as text.
        message: String,
        /// Payload as sent.
        payload: serde_json::Value,
    },

    /// No reply before the deadline.
    #[error("Timed out after {0:?} waiting for reply from server (is it running?)")]
    Timeout(Duration),

    /// The heartbeat monitor flagged the server as dead.
    #[error("No heartbeat signal detected from server (is it still running?)")]
    HeartbeatLost,

    /// Assignment to something that is not a remote property.
    #[error("Attribute \"{name}\" {reason}")]
    WriteProtected {
        /// Attribute name.
        name: String,
        /// Why it cannot be written.
        reason: String,
    },

    /// Read of a write-only property.
    #[error("Attribute \"{0}\" is not readable")]
    NotReadable(String),

    /// No such function, property, namespace or buffer.
    #[error("Unknown attribute: {0}")]
    UnknownAttribute(String),

    /// Call rejected by the local argument check.
    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),
}

impl ScopeError {
    /// Build a remote error from the JSON payload of an `error` reply.
    pub fn remote(payload: serde_json::Value) -> Self {
        let message = match &payload {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        ScopeError::Remote { message, payload }
    }

    /// True for failures after which `reconnect()` is the sensible next step.
    pub fn is_connection_failure(&self) -> bool {
        matches!(
            self,
            ScopeError::Timeout(_) | ScopeError::HeartbeatLost | ScopeError::Transport(_)
        )
    }
}

#[cfg(feature = "serial")]
impl From<serialport::Error> for ScopeError {
    fn from(err: serialport::Error) -> Self {
        ScopeError::Serial(err.to_string())
    }
}
