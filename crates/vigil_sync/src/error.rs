//! Error types for the sync engine.

use thiserror::Error;
use vigil_protocol::{CodecError, Message};
use vigil_storage::StorageError;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during sync operations.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Network or transport failure.
    #[error("network error: {message}")]
    Network {
        /// Error message.
        message: String,
    },

    /// A backend call exceeded the request timeout.
    #[error("operation timed out")]
    Timeout,

    /// The engine is offline.
    #[error("not connected to server")]
    NotConnected,

    /// Input rejected before anything was queued.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The idempotency key already exists on the server.
    #[error("idempotency key already used")]
    Conflict {
        /// The existing server record, when the backend returned it.
        existing: Option<Box<Message>>,
    },

    /// The target does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The cache budget is exceeded by conversations that cannot be evicted.
    #[error("cache quota exceeded: {cached} messages cached, budget {budget}")]
    QuotaExceeded {
        /// Messages currently cached.
        cached: usize,
        /// Configured total budget.
        budget: usize,
    },

    /// No user is signed in.
    #[error("not authenticated")]
    NotAuthenticated,

    /// The server failed to process the request.
    #[error("server error: {0}")]
    Server(String),

    /// Durable storage failure.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Snapshot encoding failure.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// The operation was cancelled by shutdown.
    #[error("sync cancelled")]
    Cancelled,
}

impl SyncError {
    /// Creates a network error.
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    /// Creates a conflict error carrying the existing record.
    pub fn conflict(existing: Message) -> Self {
        Self::Conflict {
            existing: Some(Box::new(existing)),
        }
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::Network { .. }
                | SyncError::Timeout
                | SyncError::NotConnected
                | SyncError::Server(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errors() {
        assert!(SyncError::network("connection reset").is_retryable());
        assert!(SyncError::Timeout.is_retryable());
        assert!(SyncError::NotConnected.is_retryable());
        assert!(SyncError::Server("internal error".into()).is_retryable());

        assert!(!SyncError::Validation("empty".into()).is_retryable());
        assert!(!SyncError::NotFound("c-1".into()).is_retryable());
        assert!(!SyncError::Conflict { existing: None }.is_retryable());
        assert!(!SyncError::NotAuthenticated.is_retryable());
        assert!(!SyncError::Cancelled.is_retryable());
    }

    #[test]
    fn error_display() {
        assert_eq!(SyncError::NotConnected.to_string(), "not connected to server");
        let err = SyncError::QuotaExceeded {
            cached: 120,
            budget: 100,
        };
        assert!(err.to_string().contains("120"));
        assert!(err.to_string().contains("100"));
    }

    #[test]
    fn storage_errors_convert() {
        let err: SyncError = StorageError::Locked.into();
        assert!(matches!(err, SyncError::Storage(_)));
        assert!(!err.is_retryable());
    }
}
