//! Error types for grouprpc.
//!
//! Two layers are kept apart here:
//! - [`RpcError`] is what API calls return directly (bad destination, shutdown
//!   in progress, malformed frames, transport setup failures).
//! - [`Fault`] is what a [`FutureMessage`](crate::FutureMessage) resolves to
//!   when a request fails after it has been sent. It is `Clone` because every
//!   waiter on the same future observes the same fault.

use std::time::Duration;
use thiserror::Error;

use crate::future::FutureState;

/// A failure attached to a single in-flight request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Fault {
    /// The remote operation raised; carried back as an Exception message.
    #[error("operation '{operation}' failed remotely: {message}")]
    Dispatch { operation: String, message: String },

    /// The peer became unreachable or the local agent stopped before a reply.
    #[error("transport fault with peer '{peer}': {message}")]
    Transport { peer: String, message: String },

    /// No reply arrived within the configured RPC timeout.
    #[error("no reply after {after:?}")]
    Timeout { after: Duration },
}

/// Main error type for grouprpc.
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("Unknown destination: {name}")]
    UnknownDestination { name: String },

    #[error("Agent is shutting down; new RPCs are rejected")]
    ShuttingDown,

    #[error(transparent)]
    Fault(#[from] Fault),

    /// `set_result`/`set_error` on a future that already resolved.
    #[error("Future already resolved ({state:?})")]
    AlreadyCompleted { state: FutureState },

    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    #[error("Codec error: {message}")]
    Codec { message: String },

    #[error("Transport error: {message}")]
    Transport { message: String },

    /// Raised when an agent is built outside a tokio runtime.
    #[error("Runtime error: {message}")]
    Runtime { message: String },

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
}

/// Result type alias for grouprpc operations.
pub type Result<T> = std::result::Result<T, RpcError>;

impl From<std::io::Error> for RpcError {
    fn from(err: std::io::Error) -> Self {
        RpcError::Io {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for RpcError {
    fn from(err: serde_json::Error) -> Self {
        RpcError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl RpcError {
    pub(crate) fn codec(message: impl Into<String>) -> Self {
        RpcError::Codec {
            message: message.into(),
        }
    }

    pub(crate) fn invalid_config(message: impl Into<String>) -> Self {
        RpcError::InvalidConfig {
            message: message.into(),
        }
    }

    /// The fault carried by this error, if it came out of a resolved future.
    pub fn as_fault(&self) -> Option<&Fault> {
        match self {
            RpcError::Fault(fault) => Some(fault),
            _ => None,
        }
    }

    /// Whether this error was raised synchronously at call time, before any
    /// request reached the transport.
    pub fn is_call_time(&self) -> bool {
        matches!(
            self,
            RpcError::UnknownDestination { .. } | RpcError::ShuttingDown
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fault_display() {
        let fault = Fault::Dispatch {
            operation: "add".to_string(),
            message: "bad payload".to_string(),
        };
        assert_eq!(
            fault.to_string(),
            "operation 'add' failed remotely: bad payload"
        );

        let fault = Fault::Transport {
            peer: "worker1".to_string(),
            message: "connection reset".to_string(),
        };
        assert!(fault.to_string().contains("worker1"));
    }

    #[test]
    fn test_fault_converts_into_rpc_error() {
        let fault = Fault::Timeout {
            after: Duration::from_millis(250),
        };
        let err: RpcError = fault.clone().into();
        assert_eq!(err.as_fault(), Some(&fault));
        assert!(!err.is_call_time());
    }

    #[test]
    fn test_call_time_errors() {
        let err = RpcError::UnknownDestination {
            name: "Z".to_string(),
        };
        assert!(err.is_call_time());
        assert!(err.as_fault().is_none());
        assert!(RpcError::ShuttingDown.is_call_time());
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err: RpcError = io.into();
        match err {
            RpcError::Io { message, source } => {
                assert!(message.contains("refused"));
                assert!(source.is_some());
            }
            other => panic!("Expected Io, got: {:?}", other),
        }
    }
}
