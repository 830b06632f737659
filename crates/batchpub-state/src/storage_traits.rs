//! Storage trait definitions for batchpub
//!
//! These traits define the collaborators the commit path consumes:
//! - `BatchStore`: batch rows with compare-and-swap state transitions
//! - `AssetStore`: asset version rows belonging to a batch
//! - `SiteStore`: site rows (read, plus integration bookkeeping)
//! - `BlobStore`: staged asset bytes keyed by storage path
//!
//! All traits are async and backend-agnostic. In-memory fakes are provided
//! for testing via the `fakes` module.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StorageError;
use crate::model::{
    AssetId, AssetStatus, AssetVersion, BatchId, BatchPatch, ChangeBatch, Site, SiteId, SiteIntegration,
};
use crate::state::Transition;

/// Result type for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

// ---------------------------------------------------------------------------
// BatchStore
// ---------------------------------------------------------------------------

/// Change batch persistence.
///
/// Guarantees:
/// - `transition` is an atomic compare-and-swap on the `state` column: the
///   patch is applied only if the row's state equals `transition.from()`.
/// - A lost CAS returns `Ok(false)` and changes nothing.
/// - Metadata patches merge at the top level; unrelated keys survive.
#[async_trait]
pub trait BatchStore: Send + Sync {
    /// Load a batch. Returns `StorageError::BatchNotFound` if absent.
    async fn load(&self, batch_id: &BatchId) -> StorageResult<ChangeBatch>;

    /// Move the batch along `transition`, applying `patch` in the same write.
    async fn transition(
        &self,
        batch_id: &BatchId,
        transition: Transition,
        patch: BatchPatch,
    ) -> StorageResult<bool>;
}

// ---------------------------------------------------------------------------
// AssetStore
// ---------------------------------------------------------------------------

/// Asset version persistence.
#[async_trait]
pub trait AssetStore: Send + Sync {
    /// Assets of `batch_id` currently in `status`, ordered by `repo_path`.
    async fn list_by_batch(
        &self,
        batch_id: &BatchId,
        status: AssetStatus,
    ) -> StorageResult<Vec<AssetVersion>>;

    /// Move the listed assets of `batch_id` from `from` to `to`, returning
    /// how many rows changed. Rows outside `asset_ids`, or not in `from`,
    /// are left alone.
    async fn set_status(
        &self,
        batch_id: &BatchId,
        asset_ids: &[AssetId],
        from: AssetStatus,
        to: AssetStatus,
    ) -> StorageResult<u64>;
}

// ---------------------------------------------------------------------------
// SiteStore
// ---------------------------------------------------------------------------

/// Site persistence.
#[async_trait]
pub trait SiteStore: Send + Sync {
    /// Load a site. Returns `StorageError::SiteNotFound` if absent.
    async fn load_site(&self, site_id: &SiteId) -> StorageResult<Site>;

    /// Point the site at a (possibly new) installation and repository.
    async fn update_integration(
        &self,
        site_id: &SiteId,
        integration: SiteIntegration,
        token_expires_at: DateTime<Utc>,
    ) -> StorageResult<()>;

    /// Refresh the cached token expiry hint in the site's settings.
    async fn record_token_expiry(
        &self,
        site_id: &SiteId,
        expires_at: DateTime<Utc>,
    ) -> StorageResult<()>;
}

// ---------------------------------------------------------------------------
// BlobStore
// ---------------------------------------------------------------------------

/// Staged asset bytes.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Fetch the object at `storage_path`. Returns
    /// `StorageError::BlobNotFound` if absent.
    async fn fetch(&self, storage_path: &str) -> StorageResult<Vec<u8>>;
}
