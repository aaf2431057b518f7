//! Error types for the orchestration core.
//!
//! Each layer has its own enum; only `CallError` is seen by callers issuing
//! requests, and it has exactly four variants.

use std::time::Duration;

use thiserror::Error;

use crate::connection::ConnectionState;
use crate::transport::protocol::ErrorObject;
use crate::transport::ExitReason;

/// Malformed frame or message.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("unsupported jsonrpc version: {0}")]
    UnsupportedVersion(String),

    #[error("empty batch")]
    EmptyBatch,

    #[error("frame exceeds max size: {len} > {max}")]
    FrameTooLarge { len: usize, max: usize },

    #[error("frame is not valid UTF-8")]
    NotUtf8,
}

/// Failure of a transport instance.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to spawn '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("transport is closed")]
    Closed,

    #[error("peer process exited: {0}")]
    Exited(ExitReason),

    #[error("{} error(s) during shutdown: {}", .0.len(), .0.join("; "))]
    Shutdown(Vec<String>),
}

impl TransportError {
    /// Whether the transport instance is unusable after this error.
    ///
    /// A malformed frame is dropped and reading continues; everything else
    /// ends the instance.
    pub const fn is_terminal(&self) -> bool {
        !matches!(self, Self::Protocol(_))
    }
}

/// Illegal connection lifecycle transition.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid transition from {from} to {to}")]
pub struct StateError {
    pub from: ConnectionState,
    pub to: ConnectionState,
}

/// The caller-visible outcomes of a request other than success.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CallError {
    /// The peer answered with a JSON-RPC error.
    #[error("peer error {}: {}", .0.code, .0.message)]
    Remote(ErrorObject),

    #[error("request '{method}' timed out after {timeout:?}")]
    Timeout { method: String, timeout: Duration },

    #[error("connection '{connection}' is not ready (state: {state})")]
    NotReady {
        connection: String,
        state: ConnectionState,
    },

    #[error("connection '{connection}' closed: {reason}")]
    Closed { connection: String, reason: String },
}

/// Errors returned by the manager API.
#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("connection '{0}' already exists")]
    Duplicate(String),

    #[error("connection '{0}' not found")]
    NotFound(String),

    #[error("invalid configuration for '{name}': {reason}")]
    InvalidConfig { name: String, reason: String },

    #[error("transport kind '{kind}' is not supported (connection '{name}')")]
    UnsupportedTransport { name: String, kind: String },

    #[error("transport error on '{name}': {source}")]
    Transport {
        name: String,
        #[source]
        source: TransportError,
    },

    #[error("handshake with '{name}' failed: {source}")]
    Handshake {
        name: String,
        #[source]
        source: CallError,
    },

    #[error(transparent)]
    State(#[from] StateError),

    #[error("{} error(s) during shutdown: {}", .0.len(), .0.join("; "))]
    Shutdown(Vec<String>),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_errors_are_not_terminal() {
        let err = TransportError::from(ProtocolError::EmptyBatch);
        assert!(!err.is_terminal());
        assert!(TransportError::Closed.is_terminal());
    }

    #[test]
    fn test_shutdown_error_lists_every_failure() {
        let err = ManagerError::Shutdown(vec!["a: broken pipe".into(), "b: timeout".into()]);
        assert_eq!(
            err.to_string(),
            "2 error(s) during shutdown: a: broken pipe; b: timeout"
        );
    }

    #[test]
    fn test_not_ready_mentions_state() {
        let err = CallError::NotReady {
            connection: "files".into(),
            state: ConnectionState::Initializing,
        };
        assert_eq!(
            err.to_string(),
            "connection 'files' is not ready (state: initializing)"
        );
    }
}
