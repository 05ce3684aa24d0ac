//! Error types for the wirelink runtime.

use std::time::Duration;

use serde_json::Value;
use thiserror::Error;

use crate::types::codes;

/// Main error type for wirelink operations.
///
/// Distinct from application `error` envelopes: these are the conditions the
/// runtime itself signals. A peer's error envelope surfaces as [`Error::Peer`]
/// so callers can reach the application code/message without re-parsing.
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// Frame has no `type` field.
    #[error("missing required 'type' field")]
    MissingType,

    /// Frame has a `type` field that is not one of the four envelope kinds.
    #[error("invalid message type: {value:?}")]
    InvalidType {
        /// The offending discriminant as found on the wire.
        value: String,
    },

    /// Frame has no `action` field.
    #[error("missing required 'action' field")]
    MissingAction,

    /// Request frame has no `request_id` field.
    #[error("missing required 'request_id' field")]
    MissingRequestId,

    /// Response or error frame has no `reply_to` field.
    #[error("missing required 'reply_to' field")]
    MissingReplyTo,

    /// Error frame has no nested `error` object.
    #[error("missing required 'error' field")]
    MissingError,

    /// Frame could not be decoded into an envelope.
    #[error("decode error: {message}")]
    Decode {
        /// What went wrong while decoding.
        message: String,
    },

    /// Envelope could not be encoded for the wire.
    #[error("encode error: {message}")]
    Encode {
        /// What went wrong while encoding.
        message: String,
    },

    /// The endpoint has been closed; no further sends are possible.
    #[error("endpoint is closed")]
    EndpointClosed,

    /// The transport reports no live connection.
    #[error("transport is not connected")]
    NotConnected,

    /// A transport write failed for a reason other than connection loss.
    #[error("transport error: {message}")]
    Transport {
        /// Transport-reported failure description.
        message: String,
    },

    /// A reply did not arrive within the caller's deadline.
    #[error("timed out after {timeout:?} waiting for reply")]
    Timeout {
        /// The deadline that elapsed.
        timeout: Duration,
    },

    /// The envelope kind cannot be handled by the invoked operation.
    #[error("unsupported message kind: {kind}")]
    UnsupportedMessage {
        /// Kind of the offending envelope.
        kind: String,
    },

    /// No handler is registered for the action.
    #[error("no handler registered for action '{action}'")]
    HandlerNotFound {
        /// The unrouteable action.
        action: String,
    },

    /// The peer answered a request with an error envelope.
    #[error("peer error {code}: {message}")]
    Peer {
        /// Application error code (see [`crate::types::codes`]).
        code: String,
        /// Human-readable description from the peer.
        message: String,
        /// Optional structured details from the peer.
        details: Option<Value>,
    },

    /// A handler failed with an application-level error.
    #[error("handler error {code}: {message}")]
    Handler {
        /// Application error code to place on the outgoing error envelope.
        code: String,
        /// Human-readable description.
        message: String,
    },
}

/// Result type alias for wirelink operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a decode error with a message.
    #[must_use]
    pub fn decode(message: impl Into<String>) -> Self {
        Self::Decode { message: message.into() }
    }

    /// Create an encode error with a message.
    #[must_use]
    pub fn encode(message: impl Into<String>) -> Self {
        Self::Encode { message: message.into() }
    }

    /// Create a transport error with a message.
    #[must_use]
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport { message: message.into() }
    }

    /// Create a handler error carrying an application error code.
    #[must_use]
    pub fn handler(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Handler { code: code.into(), message: message.into() }
    }

    /// Check whether a failed send may be replayed once the transport
    /// recovers. Only connection-down conditions qualify; encode errors and
    /// other transport faults are surfaced to the caller unqueued.
    #[must_use]
    pub const fn is_queueable(&self) -> bool {
        matches!(self, Self::EndpointClosed | Self::NotConnected)
    }

    /// Application error code to use when synthesizing an error envelope
    /// from this error.
    #[must_use]
    pub fn error_code(&self) -> &str {
        match self {
            Self::Peer { code, .. } | Self::Handler { code, .. } => code,
            Self::Timeout { .. } => codes::TIMEOUT,
            Self::HandlerNotFound { .. } => codes::HANDLER_NOT_FOUND,
            Self::EndpointClosed | Self::NotConnected => codes::SERVICE_UNAVAILABLE,
            _ => codes::INTERNAL_ERROR,
        }
    }

    /// Human-readable message to place on a synthesized error envelope.
    /// Peer and handler errors contribute their bare message; other kinds
    /// use their display form.
    #[must_use]
    pub fn error_message(&self) -> String {
        match self {
            Self::Peer { message, .. } | Self::Handler { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Decode { message: err.to_string() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queueable_classification() {
        assert!(Error::EndpointClosed.is_queueable());
        assert!(Error::NotConnected.is_queueable());
        assert!(!Error::encode("boom").is_queueable());
        assert!(!Error::transport("reset by peer").is_queueable());
        assert!(!Error::Timeout { timeout: Duration::from_secs(1) }.is_queueable());
    }

    #[test]
    fn test_error_code_mapping() {
        assert_eq!(
            Error::handler("NOT_FOUND", "no such camera").error_code(),
            "NOT_FOUND"
        );
        assert_eq!(
            Error::HandlerNotFound { action: "a.b".into() }.error_code(),
            codes::HANDLER_NOT_FOUND
        );
        assert_eq!(
            Error::Timeout { timeout: Duration::from_millis(5) }.error_code(),
            codes::TIMEOUT
        );
        assert_eq!(Error::decode("bad frame").error_code(), codes::INTERNAL_ERROR);
    }
}
