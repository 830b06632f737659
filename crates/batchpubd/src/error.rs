//! HTTP error responses.
//!
//! The commit trigger answers `{status: "error", message, batchId?, details?}`;
//! installation sync answers `{error, details?}`. Neither shape ever carries
//! a token, key or signed JWT: `details` is built from the typed
//! [`ErrorDetail`](batchpub_state::ErrorDetail) or from error messages that
//! only quote the remote host's response body.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use batchpub_core::{CommitError, SyncError};
use batchpub_state::{BatchId, StorageError};
use serde::Serialize;
use serde_json::Value;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct CommitBody {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<BatchId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commit_sha: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

/// Failure of `POST /batches/:batch_id/commit`.
#[derive(Debug)]
pub enum CommitFailure {
    BadRequest(String),
    MethodNotAllowed,
    Commit {
        batch_id: BatchId,
        error: CommitError,
    },
}

impl CommitFailure {
    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            Self::Commit { error, .. } => {
                if error.is_conflict() {
                    StatusCode::CONFLICT
                } else if error.is_not_found() {
                    StatusCode::NOT_FOUND
                } else if matches!(error, CommitError::Validation(_)) {
                    StatusCode::BAD_REQUEST
                } else {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            }
        }
    }
}

impl IntoResponse for CommitFailure {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = match self {
            Self::BadRequest(message) => CommitBody {
                status: "error",
                message: Some(message),
                batch_id: None,
                commit_sha: None,
                details: None,
            },
            Self::MethodNotAllowed => CommitBody {
                status: "error",
                message: Some("Method not allowed".to_string()),
                batch_id: None,
                commit_sha: None,
                details: None,
            },
            Self::Commit { batch_id, error } => {
                let details = (status == StatusCode::INTERNAL_SERVER_ERROR)
                    .then(|| serde_json::to_value(error.detail()).ok())
                    .flatten();
                let message = if error.is_not_found() {
                    "Batch not found".to_string()
                } else {
                    error.to_string()
                };
                CommitBody {
                    status: "error",
                    message: Some(message),
                    batch_id: Some(batch_id),
                    commit_sha: None,
                    details,
                }
            }
        };
        (status, Json(body)).into_response()
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct SyncBody {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

/// Failure of `POST /sites/:site_id/installation-sync`.
#[derive(Debug)]
pub enum SyncFailure {
    BadRequest(String),
    MethodNotAllowed,
    Sync(SyncError),
}

impl SyncFailure {
    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) | Self::Sync(SyncError::Validation(_)) => StatusCode::BAD_REQUEST,
            Self::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            Self::Sync(SyncError::Storage(StorageError::SiteNotFound { .. })) => {
                StatusCode::NOT_FOUND
            }
            Self::Sync(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<SyncError> for SyncFailure {
    fn from(err: SyncError) -> Self {
        Self::Sync(err)
    }
}

impl IntoResponse for SyncFailure {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = match self {
            Self::BadRequest(error) => SyncBody {
                error,
                details: None,
            },
            Self::MethodNotAllowed => SyncBody {
                error: "Method not allowed".to_string(),
                details: None,
            },
            Self::Sync(SyncError::Validation(error)) => SyncBody {
                error,
                details: None,
            },
            Self::Sync(SyncError::Storage(StorageError::SiteNotFound { .. })) => SyncBody {
                error: "Site not found".to_string(),
                details: None,
            },
            Self::Sync(SyncError::Credential { source, .. }) => SyncBody {
                error: "Failed to validate installation".to_string(),
                details: Some(source.to_string()),
            },
            Self::Sync(SyncError::Storage(e)) => SyncBody {
                error: "Failed to update site".to_string(),
                details: Some(e.to_string()),
            },
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use batchpub_state::BatchState;

    #[test]
    fn commit_status_codes() {
        let batch_id = BatchId::new();
        assert_eq!(
            CommitFailure::BadRequest("x".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            CommitFailure::Commit {
                batch_id,
                error: CommitError::NotOpen {
                    batch_id,
                    state: BatchState::Complete
                },
            }
            .status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            CommitFailure::Commit {
                batch_id,
                error: CommitError::Storage(StorageError::BatchNotFound {
                    batch_id: batch_id.to_string()
                }),
            }
            .status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            CommitFailure::Commit {
                batch_id,
                error: CommitError::internal("boom"),
            }
            .status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn sync_status_codes() {
        assert_eq!(
            SyncFailure::from(SyncError::Validation("x".into())).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            SyncFailure::MethodNotAllowed.status_code(),
            StatusCode::METHOD_NOT_ALLOWED
        );
    }
}
