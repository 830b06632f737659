//! Row types for the tables batchpub reads and writes.
//!
//! Field names follow the row store's column names so the same types
//! decode PostgREST responses and live in the in-memory fakes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::detail::ErrorDetail;
use crate::state::BatchState;

/// Settings key holding the most recent installation token expiry.
pub const TOKEN_EXPIRY_SETTING: &str = "latestInstallationTokenExpiry";

/// Metadata key under which a failure's [`ErrorDetail`] is recorded.
pub const ERROR_METADATA_KEY: &str = "error";

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Generate a new random id
            pub fn new() -> Self {
                $name(Uuid::new_v4())
            }

            /// Parse the canonical hyphenated form.
            pub fn parse(s: &str) -> Result<Self, uuid::Error> {
                Uuid::parse_str(s).map($name)
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

uuid_id!(
    /// Primary key of `change_batches`
    BatchId
);
uuid_id!(
    /// Primary key of `sites`
    SiteId
);
uuid_id!(
    /// Primary key of `asset_versions`
    AssetId
);

/// A tracked repository workspace. Read-only to the commit path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Site {
    pub id: SiteId,
    pub name: String,
    /// `owner/repo`
    pub repo_full_name: String,
    pub default_branch: String,
    pub github_installation_id: u64,
    #[serde(default)]
    pub github_app_slug: Option<String>,
    #[serde(default)]
    pub settings: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Site {
    pub fn new(
        name: impl Into<String>,
        repo_full_name: impl Into<String>,
        default_branch: impl Into<String>,
        github_installation_id: u64,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: SiteId::new(),
            name: name.into(),
            repo_full_name: repo_full_name.into(),
            default_branch: default_branch.into(),
            github_installation_id,
            github_app_slug: None,
            settings: Map::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Best-effort expiry of the last minted installation token.
    ///
    /// Observability only; tokens are re-minted for every commit.
    pub fn token_expiry_hint(&self) -> Option<DateTime<Utc>> {
        self.settings
            .get(TOKEN_EXPIRY_SETTING)
            .and_then(Value::as_str)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|t| t.with_timezone(&Utc))
    }
}

/// Fields written by an installation sync.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiteIntegration {
    pub github_installation_id: u64,
    pub repo_full_name: String,
    pub default_branch: String,
    pub github_app_slug: Option<String>,
}

/// The unit of atomic publication.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeBatch {
    pub id: BatchId,
    pub site_id: SiteId,
    pub creator_user_id: Uuid,
    pub state: BatchState,
    #[serde(default)]
    pub commit_sha: Option<String>,
    #[serde(default)]
    pub commit_message: Option<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ChangeBatch {
    /// A fresh `open` batch for the given site.
    pub fn new(site_id: SiteId, creator_user_id: Uuid) -> Self {
        let now = Utc::now();
        Self {
            id: BatchId::new(),
            site_id,
            creator_user_id,
            state: BatchState::Open,
            commit_sha: None,
            commit_message: None,
            metadata: Map::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.commit_message = Some(message.into());
        self
    }

    /// Decode the failure detail recorded by the last `committing -> failed`
    /// transition, if any.
    pub fn error_detail(&self) -> Option<ErrorDetail> {
        self.metadata
            .get(ERROR_METADATA_KEY)
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok())
    }

    /// Apply a patch the way every store backend must: top-level metadata
    /// merge, commit SHA only when supplied.
    pub fn apply(&mut self, state: BatchState, patch: &BatchPatch) {
        self.state = state;
        merge_metadata(&mut self.metadata, &patch.metadata);
        if let Some(sha) = &patch.commit_sha {
            self.commit_sha = Some(sha.clone());
        }
        self.updated_at = Utc::now();
    }
}

/// Staging status of one asset version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetStatus {
    Pending,
    Staged,
    Committing,
    Committed,
    Failed,
}

impl AssetStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssetStatus::Pending => "pending",
            AssetStatus::Staged => "staged",
            AssetStatus::Committing => "committing",
            AssetStatus::Committed => "committed",
            AssetStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for AssetStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One staged file belonging to a batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssetVersion {
    pub id: AssetId,
    pub site_id: SiteId,
    /// Key in blob storage
    pub storage_path: String,
    /// Destination path inside the repository
    pub repo_path: String,
    pub file_size_bytes: u64,
    /// Lowercase SHA-256 hex of the content, when the uploader recorded one
    #[serde(default)]
    pub checksum: Option<String>,
    pub status: AssetStatus,
    #[serde(default)]
    pub batch_id: Option<BatchId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AssetVersion {
    /// A `staged` asset for `batch` whose checksum and size describe `content`.
    pub fn staged(
        batch: &ChangeBatch,
        storage_path: impl Into<String>,
        repo_path: impl Into<String>,
        content: &[u8],
    ) -> Self {
        use sha2::{Digest, Sha256};
        let now = Utc::now();
        Self {
            id: AssetId::new(),
            site_id: batch.site_id,
            storage_path: storage_path.into(),
            repo_path: repo_path.into(),
            file_size_bytes: content.len() as u64,
            checksum: Some(hex::encode(Sha256::digest(content))),
            status: AssetStatus::Staged,
            batch_id: Some(batch.id),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Update applied together with a state transition.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchPatch {
    /// Merged into the row's metadata at the top level
    pub metadata: Map<String, Value>,
    pub commit_sha: Option<String>,
}

impl BatchPatch {
    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn with_commit_sha(mut self, sha: impl Into<String>) -> Self {
        self.commit_sha = Some(sha.into());
        self
    }

    /// Record `detail` under [`ERROR_METADATA_KEY`] plus a failure timestamp.
    pub fn with_error(self, detail: &ErrorDetail) -> Self {
        let value = serde_json::to_value(detail).unwrap_or(Value::Null);
        self.with_metadata(ERROR_METADATA_KEY, value)
            .with_metadata("failed_at", Value::String(Utc::now().to_rfc3339()))
    }
}

/// Top-level merge: keys in `patch` replace keys in `target`, every other
/// key in `target` is kept.
pub fn merge_metadata(target: &mut Map<String, Value>, patch: &Map<String, Value>) {
    for (key, value) in patch {
        target.insert(key.clone(), value.clone());
    }
}
