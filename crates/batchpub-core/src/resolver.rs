//! Asset resolution: staged rows of a batch plus their verified bytes.

use std::collections::HashSet;
use std::sync::Arc;

use batchpub_state::{
    AssetId, AssetStatus, AssetStore, AssetVersion, BatchId, BlobStore, StorageError,
};
use futures::stream::{self, StreamExt, TryStreamExt};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::{CommitError, CommitResult};
use crate::tree::RepoPath;

/// One file ready to be written to the repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedFile {
    pub asset_id: AssetId,
    pub path: RepoPath,
    pub content: Vec<u8>,
}

pub struct AssetResolver {
    assets: Arc<dyn AssetStore>,
    blobs: Arc<dyn BlobStore>,
    concurrency: usize,
}

impl AssetResolver {
    pub fn new(assets: Arc<dyn AssetStore>, blobs: Arc<dyn BlobStore>) -> Self {
        Self {
            assets,
            blobs,
            concurrency: 4,
        }
    }

    /// Bound on blob fetches in flight.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Staged assets of `batch_id`, ascending by repository path.
    pub async fn list_staged(&self, batch_id: &BatchId) -> CommitResult<Vec<AssetVersion>> {
        let mut staged = self
            .assets
            .list_by_batch(batch_id, AssetStatus::Staged)
            .await?;
        // Stores promise this order; the tree build depends on it.
        staged.sort_by(|a, b| a.repo_path.cmp(&b.repo_path));
        Ok(staged)
    }

    /// Bytes at `storage_path`. A missing object is an integrity failure.
    pub async fn fetch_bytes(&self, storage_path: &str) -> CommitResult<Vec<u8>> {
        match self.blobs.fetch(storage_path).await {
            Ok(bytes) => Ok(bytes),
            Err(StorageError::BlobNotFound { path }) => Err(CommitError::asset_integrity(
                Some(&path),
                "staged content is missing from blob storage",
            )),
            Err(e) => Err(e.into()),
        }
    }

    /// Validate paths and fetch + verify the bytes of every asset. Fails as
    /// a whole: a batch never commits partially.
    pub async fn resolve(&self, assets: &[AssetVersion]) -> CommitResult<Vec<StagedFile>> {
        if assets.is_empty() {
            return Err(CommitError::asset_integrity(
                None,
                "batch has no staged assets",
            ));
        }
        let paths = assets
            .iter()
            .map(|a| RepoPath::parse(&a.repo_path))
            .collect::<CommitResult<Vec<_>>>()?;
        let mut seen = HashSet::new();
        for path in &paths {
            if !seen.insert(path) {
                return Err(CommitError::asset_integrity(
                    Some(path.as_str()),
                    "path is staged more than once in this batch",
                ));
            }
        }

        let contents: Vec<Vec<u8>> = stream::iter(assets)
            .map(|asset| async move {
                let bytes = self.fetch_bytes(&asset.storage_path).await?;
                verify(asset, &bytes)?;
                Ok::<_, CommitError>(bytes)
            })
            .buffered(self.concurrency)
            .boxed()
            .try_collect()
            .await?;

        debug!(files = contents.len(), "staged assets resolved");
        Ok(assets
            .iter()
            .zip(paths)
            .zip(contents)
            .map(|((asset, path), content)| StagedFile {
                asset_id: asset.id,
                path,
                content,
            })
            .collect())
    }
}

fn verify(asset: &AssetVersion, bytes: &[u8]) -> CommitResult<()> {
    if bytes.len() as u64 != asset.file_size_bytes {
        return Err(CommitError::asset_integrity(
            Some(&asset.repo_path),
            format!(
                "corrupt staged content: expected {} bytes, found {}",
                asset.file_size_bytes,
                bytes.len()
            ),
        ));
    }
    if let Some(expected) = asset.checksum.as_deref() {
        let actual = hex::encode(Sha256::digest(bytes));
        if !actual.eq_ignore_ascii_case(expected.trim()) {
            return Err(CommitError::asset_integrity(
                Some(&asset.repo_path),
                "corrupt staged content: checksum mismatch",
            ));
        }
    }
    Ok(())
}
