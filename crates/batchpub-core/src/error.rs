//! Error taxonomy for the commit path.

use batchpub_github::GitHubError;
use batchpub_state::{BatchId, BatchState, ErrorDetail, StorageError};

/// Errors surfaced by [`crate::Orchestrator::commit`].
///
/// `Validation`, `NotOpen` and `TransitionLost` are raised before the batch
/// is claimed and leave every row untouched. Everything else is raised while
/// the batch is `committing` and is recorded on the batch via
/// [`CommitError::detail`], except `Internal` with a commit SHA, which is a
/// reconciliation condition.
#[derive(Debug, thiserror::Error)]
pub enum CommitError {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("Batch is not open (current state: {state})")]
    NotOpen { batch_id: BatchId, state: BatchState },

    #[error("Batch {batch_id} was claimed by a concurrent commit request")]
    TransitionLost { batch_id: BatchId },

    #[error("could not mint a token for installation {installation_id}: {source}")]
    Credential {
        installation_id: u64,
        #[source]
        source: GitHubError,
    },

    #[error("asset integrity: {reason}{}", at_path(.path))]
    AssetIntegrity { path: Option<String>, reason: String },

    #[error("branch {branch} kept moving; gave up after {attempts} attempt(s)")]
    ConcurrentUpdate {
        branch: String,
        attempts: u32,
        expected_head: String,
    },

    #[error("internal error: {message}")]
    Internal {
        message: String,
        commit_sha: Option<String>,
    },

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("git host error: {0}")]
    Remote(#[from] GitHubError),
}

fn at_path(path: &Option<String>) -> String {
    path.as_ref().map(|p| format!(" ({p})")).unwrap_or_default()
}

/// Result type for the commit path.
pub type CommitResult<T> = std::result::Result<T, CommitError>;

impl CommitError {
    pub fn asset_integrity(path: Option<&str>, reason: impl Into<String>) -> Self {
        CommitError::AssetIntegrity {
            path: path.map(str::to_string),
            reason: reason.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        CommitError::Internal {
            message: message.into(),
            commit_sha: None,
        }
    }

    /// Batch not open, or claimed by someone else.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            CommitError::NotOpen { .. } | CommitError::TransitionLost { .. }
        )
    }

    /// The batch itself does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, CommitError::Storage(StorageError::BatchNotFound { .. }))
    }

    /// A GitHub or storage call that ran out of time.
    pub fn is_timeout(&self) -> bool {
        match self {
            CommitError::Remote(e) => e.is_timeout(),
            CommitError::Storage(e) => e.is_timeout(),
            _ => false,
        }
    }

    pub(crate) fn with_attempts(self, n: u32) -> Self {
        match self {
            CommitError::ConcurrentUpdate {
                branch,
                expected_head,
                ..
            } => CommitError::ConcurrentUpdate {
                branch,
                attempts: n,
                expected_head,
            },
            other => other,
        }
    }

    /// Stable discriminator used in logs and response bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            CommitError::Validation(_) => "validation",
            CommitError::NotOpen { .. } | CommitError::TransitionLost { .. } => "conflict",
            CommitError::Credential { .. } => "credential",
            CommitError::AssetIntegrity { .. } => "asset_integrity",
            CommitError::ConcurrentUpdate { .. } => "concurrent_update",
            CommitError::Internal { .. } => "internal",
            CommitError::Storage(StorageError::BlobNotFound { .. }) => "asset_integrity",
            CommitError::Storage(_) | CommitError::Remote(_) => "transport",
        }
    }

    /// Typed diagnostic to store in the batch metadata.
    pub fn detail(&self) -> ErrorDetail {
        match self {
            CommitError::Credential {
                installation_id,
                source,
            } => ErrorDetail::Credential {
                installation_id: *installation_id,
                status: source.status(),
                message: source.to_string(),
            },
            CommitError::AssetIntegrity { path, reason } => ErrorDetail::AssetIntegrity {
                path: path.clone(),
                reason: reason.clone(),
            },
            CommitError::ConcurrentUpdate {
                branch,
                attempts,
                expected_head,
            } => ErrorDetail::ConcurrentUpdate {
                branch: branch.clone(),
                attempts: *attempts,
                expected_head: expected_head.clone(),
            },
            CommitError::Storage(StorageError::BlobNotFound { path }) => {
                ErrorDetail::AssetIntegrity {
                    path: Some(path.clone()),
                    reason: "staged content is missing from blob storage".to_string(),
                }
            }
            CommitError::Storage(e) => ErrorDetail::Transport {
                operation: "storage".to_string(),
                status: match e {
                    StorageError::Http { status, .. } => *status,
                    _ => None,
                },
                message: e.to_string(),
                timed_out: e.is_timeout(),
            },
            CommitError::Remote(e) => ErrorDetail::Transport {
                operation: "git host".to_string(),
                status: e.status(),
                message: e.to_string(),
                timed_out: e.is_timeout(),
            },
            CommitError::Internal {
                message,
                commit_sha,
            } => ErrorDetail::Internal {
                message: message.clone(),
                commit_sha: commit_sha.clone(),
            },
            other => ErrorDetail::Internal {
                message: other.to_string(),
                commit_sha: None,
            },
        }
    }
}

/// Errors surfaced by [`crate::InstallationSync::sync`].
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("could not mint a token for installation {installation_id}: {source}")]
    Credential {
        installation_id: u64,
        #[source]
        source: GitHubError,
    },

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_open_message_names_state() {
        let err = CommitError::NotOpen {
            batch_id: BatchId::new(),
            state: BatchState::Complete,
        };
        assert_eq!(
            err.to_string(),
            "Batch is not open (current state: complete)"
        );
        assert!(err.is_conflict());
    }

    #[test]
    fn credential_detail_keeps_host_status() {
        let err = CommitError::Credential {
            installation_id: 7,
            source: GitHubError::Http {
                status: Some(404),
                message: "Not Found".into(),
            },
        };
        match err.detail() {
            ErrorDetail::Credential {
                installation_id,
                status,
                message,
            } => {
                assert_eq!(installation_id, 7);
                assert_eq!(status, Some(404));
                assert!(message.contains("Not Found"));
            }
            other => panic!("unexpected detail {other:?}"),
        }
    }

    #[test]
    fn missing_blob_is_reported_as_asset_integrity() {
        let err = CommitError::from(StorageError::BlobNotFound {
            path: "s/1/a.txt".into(),
        });
        assert_eq!(err.kind(), "asset_integrity");
        assert_eq!(err.detail().kind(), "asset_integrity");
    }

    #[test]
    fn timeouts_are_recognised_across_sources() {
        assert!(CommitError::Remote(GitHubError::Timeout {
            operation: "create blob".into()
        })
        .is_timeout());
        assert!(!CommitError::ConcurrentUpdate {
            branch: "main".into(),
            attempts: 1,
            expected_head: "a".repeat(40),
        }
        .is_timeout());
        assert!(!CommitError::asset_integrity(None, "empty").is_timeout());
        assert!(!CommitError::Remote(GitHubError::Http {
            status: Some(500),
            message: "boom".into()
        })
        .is_timeout());
    }

    #[test]
    fn with_attempts_only_touches_concurrent_update() {
        let err = CommitError::ConcurrentUpdate {
            branch: "main".into(),
            attempts: 1,
            expected_head: "a".repeat(40),
        }
        .with_attempts(3);
        assert!(matches!(err, CommitError::ConcurrentUpdate { attempts: 3, .. }));
    }
}
