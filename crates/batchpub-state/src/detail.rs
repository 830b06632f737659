//! Typed failure payloads stored in `change_batches.metadata`.

use serde::{Deserialize, Serialize};

/// Diagnostic recorded when a batch moves to `failed` (or needs manual
/// reconciliation). Serialized with a `kind` tag so the flexible column
/// stays queryable, e.g. `metadata->error->>kind = 'credential'`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ErrorDetail {
    /// Minting an installation token failed.
    Credential {
        installation_id: u64,
        status: Option<u16>,
        message: String,
    },
    /// Staged content was missing, corrupt or could not be placed in the tree.
    AssetIntegrity {
        path: Option<String>,
        reason: String,
    },
    /// The branch kept moving while the commit was being built.
    ConcurrentUpdate {
        branch: String,
        attempts: u32,
        expected_head: String,
    },
    /// A network call to the row store, blob store or Git host failed.
    Transport {
        operation: String,
        status: Option<u16>,
        message: String,
        timed_out: bool,
    },
    /// Bookkeeping failed; `commit_sha` is set when the commit already landed.
    Internal {
        message: String,
        commit_sha: Option<String>,
    },
}

impl ErrorDetail {
    /// The `kind` tag as written to the column.
    pub fn kind(&self) -> &'static str {
        match self {
            ErrorDetail::Credential { .. } => "credential",
            ErrorDetail::AssetIntegrity { .. } => "asset_integrity",
            ErrorDetail::ConcurrentUpdate { .. } => "concurrent_update",
            ErrorDetail::Transport { .. } => "transport",
            ErrorDetail::Internal { .. } => "internal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn serializes_with_kind_tag() {
        let detail = ErrorDetail::Credential {
            installation_id: 99,
            status: Some(404),
            message: "Not Found".to_string(),
        };
        let value = serde_json::to_value(&detail).unwrap();
        assert_eq!(
            value,
            json!({
                "kind": "credential",
                "installation_id": 99,
                "status": 404,
                "message": "Not Found"
            })
        );
        assert_eq!(detail.kind(), "credential");
    }

    #[test]
    fn kind_matches_serialized_tag() {
        let details = [
            ErrorDetail::AssetIntegrity {
                path: Some("a.txt".into()),
                reason: "missing".into(),
            },
            ErrorDetail::ConcurrentUpdate {
                branch: "main".into(),
                attempts: 3,
                expected_head: "abc".into(),
            },
            ErrorDetail::Transport {
                operation: "create blob".into(),
                status: None,
                message: "timed out".into(),
                timed_out: true,
            },
            ErrorDetail::Internal {
                message: "final transition lost".into(),
                commit_sha: Some("def".into()),
            },
        ];
        for detail in details {
            let value = serde_json::to_value(&detail).unwrap();
            assert_eq!(value["kind"], detail.kind());
            let back: ErrorDetail = serde_json::from_value(value).unwrap();
            assert_eq!(back, detail);
        }
    }
}
