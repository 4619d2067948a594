//! Error types for serialized access, task handles and callback bridges.
//!
//! One taxonomy covers all three components:
//! - store operations: operation_failed, panicked, store_closed
//! - tasks: cancelled, task_failed, timeout
//! - bridges: protocol_violation, abandoned, upstream

use std::time::Duration;
use thiserror::Error;

/// Errors that can occur while using the serialized access core.
#[derive(Debug, Error)]
pub enum SerialError {
    /// A store mutation's function returned an error; the value is unchanged.
    #[error("operation failed: {0}")]
    OperationFailed(String),

    /// A closure panicked while holding the serialization point.
    #[error("operation panicked: {0}")]
    Panicked(String),

    /// The store no longer accepts operations.
    #[error("store closed: {0}")]
    StoreClosed(String),

    /// Cooperative cancellation was observed.
    #[error("task cancelled")]
    Cancelled,

    /// A task body ended with an unhandled error.
    #[error("task failed: {0}")]
    TaskFailed(String),

    /// Waiting for an outcome took longer than the caller allowed.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// A collaborator broke the exactly-once / emit-then-finish contract.
    #[error("bridge protocol violation: {0}")]
    BridgeProtocolViolation(String),

    /// The producing side went away without a terminal signal.
    #[error("abandoned: {0}")]
    Abandoned(String),

    /// Failure reported by an underlying collaborator.
    #[error("upstream error: {0}")]
    Upstream(String),

    /// Serialization or deserialization error.
    #[error("serialization error: {0}")]
    SerializationError(String),

    /// I/O error.
    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Result type alias for serialized access operations.
pub type Result<T> = std::result::Result<T, SerialError>;

impl SerialError {
    /// Wrap any displayable collaborator error.
    pub fn upstream(err: impl std::fmt::Display) -> Self {
        SerialError::Upstream(err.to_string())
    }

    /// Returns true if this error is the normal cancellation terminal state.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, SerialError::Cancelled)
    }

    /// Returns true if a collaborator misused a bridge.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(self, SerialError::BridgeProtocolViolation(_))
    }
}

impl From<serde_json::Error> for SerialError {
    fn from(err: serde_json::Error) -> Self {
        SerialError::SerializationError(err.to_string())
    }
}

/// Best-effort text for a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SerialError::OperationFailed("negative balance".to_string());
        assert!(err.to_string().contains("operation failed"));
        assert!(err.to_string().contains("negative balance"));
    }

    #[test]
    fn test_timeout_display() {
        let err = SerialError::Timeout(Duration::from_millis(250));
        assert!(err.to_string().contains("250ms"));
    }

    #[test]
    fn test_classification() {
        assert!(SerialError::Cancelled.is_cancellation());
        assert!(!SerialError::TaskFailed("x".to_string()).is_cancellation());
        assert!(SerialError::BridgeProtocolViolation("twice".to_string()).is_protocol_violation());
        assert!(!SerialError::Abandoned("gone".to_string()).is_protocol_violation());
    }

    #[test]
    fn test_upstream_from_display() {
        let err = SerialError::upstream("bad url");
        assert!(matches!(err, SerialError::Upstream(ref m) if m == "bad url"));
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn std::any::Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");
        let payload: Box<dyn std::any::Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(payload.as_ref()), "bang");
        let payload: Box<dyn std::any::Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(payload.as_ref()), "unknown panic payload");
    }
}
