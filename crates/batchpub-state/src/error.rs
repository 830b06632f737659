//! Error types for batchpub-state

use thiserror::Error;

use crate::state::BatchState;

/// Errors that can occur in the persistence layer
#[derive(Error, Debug)]
pub enum StorageError {
    /// No batch row exists for the id
    #[error("Batch not found: {batch_id}")]
    BatchNotFound { batch_id: String },

    /// No site row exists for the id
    #[error("Site not found: {site_id}")]
    SiteNotFound { site_id: String },

    /// Blob storage has no object at the path
    #[error("Blob not found: {path}")]
    BlobNotFound { path: String },

    /// The pair is not in the batch transition table
    #[error("Illegal batch transition: {from} -> {to}")]
    IllegalTransition { from: BatchState, to: BatchState },

    /// A storage path escapes the blob root or is otherwise unusable
    #[error("Invalid storage path {path:?}: {reason}")]
    InvalidPath { path: String, reason: String },

    /// The backend answered with a non-success status
    #[error("Backend request failed (status {status:?}): {message}")]
    Http {
        status: Option<u16>,
        message: String,
    },

    /// The backend did not answer within the configured timeout
    #[error("Backend request timed out during {operation}")]
    Timeout { operation: String },

    /// A row could not be encoded or decoded
    #[error("Serialization failed: {0}")]
    Serialization(String),

    /// Local filesystem error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl StorageError {
    /// Whether the error was caused by a timeout rather than a rejection.
    pub fn is_timeout(&self) -> bool {
        matches!(self, StorageError::Timeout { .. })
    }

    pub(crate) fn from_reqwest(operation: &str, err: reqwest::Error) -> Self {
        if err.is_timeout() {
            StorageError::Timeout {
                operation: operation.to_string(),
            }
        } else {
            StorageError::Http {
                status: err.status().map(|s| s.as_u16()),
                message: format!("{operation}: {err}"),
            }
        }
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn illegal_transition_names_both_states() {
        let err = StorageError::IllegalTransition {
            from: BatchState::Complete,
            to: BatchState::Open,
        };
        let msg = err.to_string();
        assert!(msg.contains("complete"));
        assert!(msg.contains("open"));
    }

    #[test]
    fn timeout_is_distinguishable() {
        let err = StorageError::Timeout {
            operation: "load batch".to_string(),
        };
        assert!(err.is_timeout());
        assert!(!StorageError::Serialization("x".into()).is_timeout());
    }
}
