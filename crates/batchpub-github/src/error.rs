//! Error types for batchpub-github

use thiserror::Error;

/// Errors produced while talking to the Git host.
#[derive(Error, Debug)]
pub enum GitHubError {
    /// A constructor argument was empty or malformed
    #[error("invalid {field}: {reason}")]
    InvalidInput { field: String, reason: String },

    /// The app assertion could not be signed (usually a malformed key)
    #[error("failed to sign app assertion: {message}")]
    Jwt { message: String },

    /// The host answered with a non-success status; `message` is its body
    #[error("GitHub request failed (status {status:?}): {message}")]
    Http {
        status: Option<u16>,
        message: String,
    },

    /// The host did not answer within the client timeout
    #[error("GitHub request timed out during {operation}")]
    Timeout { operation: String },

    /// The branch does not exist (or the repository is empty)
    #[error("branch not found: {branch}")]
    BranchNotFound { branch: String },

    /// The branch no longer points at the expected head
    #[error("branch {branch} moved: expected {expected}, found {actual}")]
    RefConflict {
        branch: String,
        expected: String,
        actual: String,
    },

    /// An object id was not 40 or 64 hex characters
    #[error("invalid object id: {0}")]
    InvalidObjectId(String),

    /// A response body did not have the expected shape
    #[error("unexpected response during {operation}: {message}")]
    Decode { operation: String, message: String },
}

impl GitHubError {
    /// HTTP status reported by the host, when there was one.
    pub fn status(&self) -> Option<u16> {
        match self {
            GitHubError::Http { status, .. } => *status,
            _ => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, GitHubError::Timeout { .. })
    }

    pub(crate) fn from_reqwest(operation: &str, err: reqwest::Error) -> Self {
        if err.is_timeout() {
            GitHubError::Timeout {
                operation: operation.to_string(),
            }
        } else {
            GitHubError::Http {
                status: err.status().map(|s| s.as_u16()),
                message: format!("{operation}: {err}"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ref_conflict_displays_both_heads() {
        let err = GitHubError::RefConflict {
            branch: "main".to_string(),
            expected: "aaa".to_string(),
            actual: "bbb".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("main"));
        assert!(msg.contains("aaa"));
        assert!(msg.contains("bbb"));
    }

    #[test]
    fn status_only_for_http_errors() {
        let err = GitHubError::Http {
            status: Some(404),
            message: "Not Found".to_string(),
        };
        assert_eq!(err.status(), Some(404));
        assert_eq!(
            GitHubError::Timeout {
                operation: "mint".into()
            }
            .status(),
            None
        );
    }
}
