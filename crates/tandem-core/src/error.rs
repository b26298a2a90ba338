//! Error types for the Tandem bridge.
//!
//! `BridgeError` covers both the RPC failure taxonomy surfaced to callers of
//! `call` and the ambient transport failures (I/O, JSON, protocol).

use crate::protocol::ErrorPayload;
use std::time::Duration;
use thiserror::Error;

/// Main error type for the bridge.
#[derive(Debug, Error)]
pub enum BridgeError {
    // RPC taxonomy
    #[error("Session not connected: {session_id}")]
    NotConnected { session_id: String },

    #[error("No response within {0:?}")]
    Timeout(Duration),

    #[error("Method not found: {method}")]
    MethodNotFound { method: String },

    #[error("Handler error ({code}): {message}")]
    Handler { code: i32, message: String },

    #[error("Session lost: {session_id}")]
    SessionLost { session_id: String },

    #[error("Connection lost")]
    ConnectionLost,

    // Bridge lifecycle
    #[error("Blocking call issued from the bridge I/O thread; use fire() or call_async()")]
    WouldDeadlock,

    #[error("Bridge is shut down")]
    Shutdown,

    // Transport errors
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    #[error("IO error: {message}")]
    Io {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    // Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },
}

/// Result type alias for bridge operations.
pub type Result<T> = std::result::Result<T, BridgeError>;

impl From<std::io::Error> for BridgeError {
    fn from(err: std::io::Error) -> Self {
        BridgeError::Io {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for BridgeError {
    fn from(err: serde_json::Error) -> Self {
        BridgeError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl BridgeError {
    /// Build a handler failure with an application-defined code.
    pub fn handler(code: i32, message: impl Into<String>) -> Self {
        BridgeError::Handler {
            code,
            message: message.into(),
        }
    }

    /// Convert to a JSON-RPC error code.
    ///
    /// Standard JSON-RPC error codes:
    /// - -32700: Parse error
    /// - -32600: Invalid Request
    /// - -32601: Method not found
    /// - -32603: Internal error
    ///
    /// Bridge error codes (-32000 to -32099):
    /// - -32001: Session not connected
    /// - -32002: Timed out waiting for a response
    /// - -32003: Session or connection lost
    /// - -32004: Blocking call would deadlock
    /// - -32005: Bridge shut down
    ///
    /// Handler errors carry the code the handler chose.
    pub fn to_rpc_error_code(&self) -> i32 {
        match self {
            BridgeError::NotConnected { .. } => -32001,
            BridgeError::Timeout(_) => -32002,
            BridgeError::SessionLost { .. } | BridgeError::ConnectionLost => -32003,
            BridgeError::WouldDeadlock => -32004,
            BridgeError::Shutdown => -32005,
            BridgeError::MethodNotFound { .. } => ErrorPayload::METHOD_NOT_FOUND,
            BridgeError::Handler { code, .. } => *code,
            BridgeError::Protocol { .. } => -32600,
            BridgeError::Json { .. } => -32700,
            BridgeError::Io { .. } | BridgeError::Config { .. } => ErrorPayload::INTERNAL_ERROR,
        }
    }

    /// Wire representation used when this error answers a command.
    pub fn to_payload(&self) -> ErrorPayload {
        match self {
            BridgeError::Handler { code, message } => ErrorPayload::new(*code, message.clone()),
            other => ErrorPayload::new(other.to_rpc_error_code(), other.to_string()),
        }
    }

    /// Rebuild a caller-facing error from a remote `error` envelope.
    pub fn from_payload(method: &str, payload: ErrorPayload) -> Self {
        if payload.code == ErrorPayload::METHOD_NOT_FOUND {
            BridgeError::MethodNotFound {
                method: method.to_string(),
            }
        } else {
            BridgeError::Handler {
                code: payload.code,
                message: payload.message,
            }
        }
    }

    /// True for failures caused by losing the peer rather than by the call itself.
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            BridgeError::NotConnected { .. }
                | BridgeError::SessionLost { .. }
                | BridgeError::ConnectionLost
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = BridgeError::MethodNotFound {
            method: "missing".into(),
        };
        assert_eq!(err.to_string(), "Method not found: missing");
    }

    #[test]
    fn test_rpc_error_codes() {
        assert_eq!(
            BridgeError::MethodNotFound {
                method: "x".into()
            }
            .to_rpc_error_code(),
            -32601
        );
        assert_eq!(BridgeError::handler(42, "boom").to_rpc_error_code(), 42);
        assert_eq!(
            BridgeError::Timeout(Duration::from_secs(1)).to_rpc_error_code(),
            -32002
        );
    }

    #[test]
    fn test_payload_roundtrip_preserves_handler_code() {
        let payload = BridgeError::handler(7, "bad input").to_payload();
        assert_eq!(payload.code, 7);
        assert_eq!(payload.message, "bad input");

        match BridgeError::from_payload("resize", payload) {
            BridgeError::Handler { code, message } => {
                assert_eq!(code, 7);
                assert_eq!(message, "bad input");
            }
            other => panic!("Expected Handler, got: {:?}", other),
        }
    }

    #[test]
    fn test_method_not_found_payload_maps_back() {
        let payload = ErrorPayload::method_not_found("missing");
        match BridgeError::from_payload("missing", payload) {
            BridgeError::MethodNotFound { method } => assert_eq!(method, "missing"),
            other => panic!("Expected MethodNotFound, got: {:?}", other),
        }
    }

    #[test]
    fn test_disconnect_classification() {
        assert!(BridgeError::ConnectionLost.is_disconnect());
        assert!(BridgeError::SessionLost {
            session_id: "s1".into()
        }
        .is_disconnect());
        assert!(!BridgeError::Timeout(Duration::from_secs(1)).is_disconnect());
    }
}
