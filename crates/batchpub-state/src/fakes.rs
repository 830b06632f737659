//! In-memory fakes for storage traits (testing only)
//!
//! Provides `MemoryBatchStore`, `MemoryAssetStore`, `MemorySiteStore` and
//! `MemoryBlobStore` that satisfy the trait contracts without any external
//! dependencies. Each fake counts writes so tests can assert that a code
//! path had no side effects.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::error::StorageError;
use crate::model::*;
use crate::state::{BatchState, Transition};
use crate::storage_traits::*;

// ---------------------------------------------------------------------------
// MemoryBatchStore
// ---------------------------------------------------------------------------

/// In-memory batch table backed by a `HashMap<BatchId, ChangeBatch>`.
#[derive(Debug, Default)]
pub struct MemoryBatchStore {
    batches: Mutex<HashMap<BatchId, ChangeBatch>>,
    /// Target states whose transitions are reported as lost
    rejected: Mutex<HashSet<BatchState>>,
    writes: AtomicUsize,
}

impl MemoryBatchStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a row.
    pub fn insert(&self, batch: ChangeBatch) {
        self.batches.lock().unwrap().insert(batch.id, batch);
    }

    /// Current row, bypassing the trait.
    pub fn get(&self, batch_id: &BatchId) -> Option<ChangeBatch> {
        self.batches.lock().unwrap().get(batch_id).cloned()
    }

    /// Number of successful transitions applied so far.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Make every transition into `state` lose its CAS, as if another
    /// writer had moved the row first.
    pub fn reject_transitions_to(&self, state: BatchState) {
        self.rejected.lock().unwrap().insert(state);
    }
}

#[async_trait]
impl BatchStore for MemoryBatchStore {
    async fn load(&self, batch_id: &BatchId) -> StorageResult<ChangeBatch> {
        self.get(batch_id).ok_or_else(|| StorageError::BatchNotFound {
            batch_id: batch_id.to_string(),
        })
    }

    async fn transition(
        &self,
        batch_id: &BatchId,
        transition: Transition,
        patch: BatchPatch,
    ) -> StorageResult<bool> {
        if self.rejected.lock().unwrap().contains(&transition.to()) {
            return Ok(false);
        }
        let mut batches = self.batches.lock().unwrap();
        let batch = batches
            .get_mut(batch_id)
            .ok_or_else(|| StorageError::BatchNotFound {
                batch_id: batch_id.to_string(),
            })?;
        if batch.state != transition.from() {
            return Ok(false);
        }
        batch.apply(transition.to(), &patch);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(true)
    }
}

// ---------------------------------------------------------------------------
// MemoryAssetStore
// ---------------------------------------------------------------------------

/// In-memory asset table.
#[derive(Debug, Default)]
pub struct MemoryAssetStore {
    assets: Mutex<Vec<AssetVersion>>,
    writes: AtomicUsize,
}

impl MemoryAssetStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, asset: AssetVersion) {
        self.assets.lock().unwrap().push(asset);
    }

    /// Snapshot of every row, in insertion order.
    pub fn all(&self) -> Vec<AssetVersion> {
        self.assets.lock().unwrap().clone()
    }

    /// Number of rows changed by `set_status` so far.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AssetStore for MemoryAssetStore {
    async fn list_by_batch(
        &self,
        batch_id: &BatchId,
        status: AssetStatus,
    ) -> StorageResult<Vec<AssetVersion>> {
        let assets = self.assets.lock().unwrap();
        let mut matching: Vec<AssetVersion> = assets
            .iter()
            .filter(|a| a.batch_id.as_ref() == Some(batch_id) && a.status == status)
            .cloned()
            .collect();
        matching.sort_by(|a, b| a.repo_path.cmp(&b.repo_path));
        Ok(matching)
    }

    async fn set_status(
        &self,
        batch_id: &BatchId,
        asset_ids: &[AssetId],
        from: AssetStatus,
        to: AssetStatus,
    ) -> StorageResult<u64> {
        let mut assets = self.assets.lock().unwrap();
        let now = Utc::now();
        let mut changed = 0;
        for asset in assets.iter_mut().filter(|a| {
            a.batch_id.as_ref() == Some(batch_id)
                && a.status == from
                && asset_ids.contains(&a.id)
        }) {
            asset.status = to;
            asset.updated_at = now;
            changed += 1;
        }
        self.writes.fetch_add(changed as usize, Ordering::SeqCst);
        Ok(changed)
    }
}

// ---------------------------------------------------------------------------
// MemorySiteStore
// ---------------------------------------------------------------------------

/// In-memory site table.
#[derive(Debug, Default)]
pub struct MemorySiteStore {
    sites: Mutex<HashMap<SiteId, Site>>,
}

impl MemorySiteStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, site: Site) {
        self.sites.lock().unwrap().insert(site.id, site);
    }

    pub fn get(&self, site_id: &SiteId) -> Option<Site> {
        self.sites.lock().unwrap().get(site_id).cloned()
    }

    fn with_site<T>(
        &self,
        site_id: &SiteId,
        f: impl FnOnce(&mut Site) -> T,
    ) -> StorageResult<T> {
        let mut sites = self.sites.lock().unwrap();
        let site = sites
            .get_mut(site_id)
            .ok_or_else(|| StorageError::SiteNotFound {
                site_id: site_id.to_string(),
            })?;
        Ok(f(site))
    }
}

#[async_trait]
impl SiteStore for MemorySiteStore {
    async fn load_site(&self, site_id: &SiteId) -> StorageResult<Site> {
        self.get(site_id).ok_or_else(|| StorageError::SiteNotFound {
            site_id: site_id.to_string(),
        })
    }

    async fn update_integration(
        &self,
        site_id: &SiteId,
        integration: SiteIntegration,
        token_expires_at: DateTime<Utc>,
    ) -> StorageResult<()> {
        self.with_site(site_id, |site| {
            site.github_installation_id = integration.github_installation_id;
            site.repo_full_name = integration.repo_full_name;
            site.default_branch = integration.default_branch;
            site.github_app_slug = integration.github_app_slug;
            site.settings.insert(
                TOKEN_EXPIRY_SETTING.to_string(),
                Value::String(token_expires_at.to_rfc3339()),
            );
            site.updated_at = Utc::now();
        })
    }

    async fn record_token_expiry(
        &self,
        site_id: &SiteId,
        expires_at: DateTime<Utc>,
    ) -> StorageResult<()> {
        self.with_site(site_id, |site| {
            site.settings.insert(
                TOKEN_EXPIRY_SETTING.to_string(),
                Value::String(expires_at.to_rfc3339()),
            );
        })
    }
}

// ---------------------------------------------------------------------------
// MemoryBlobStore
// ---------------------------------------------------------------------------

/// In-memory blob store keyed by storage path.
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    objects: Mutex<HashMap<String, Vec<u8>>>,
    fetches: AtomicUsize,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, storage_path: impl Into<String>, data: impl Into<Vec<u8>>) {
        self.objects
            .lock()
            .unwrap()
            .insert(storage_path.into(), data.into());
    }

    /// Number of `fetch` calls so far, hits and misses alike.
    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn fetch(&self, storage_path: &str) -> StorageResult<Vec<u8>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.objects
            .lock()
            .unwrap()
            .get(storage_path)
            .cloned()
            .ok_or_else(|| StorageError::BlobNotFound {
                path: storage_path.to_string(),
            })
    }
}
