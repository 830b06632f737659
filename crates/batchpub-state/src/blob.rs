//! Blob store backends: object storage over HTTP and a local directory.

use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use secrecy::{ExposeSecret, SecretString};
use tracing::debug;

use crate::error::StorageError;
use crate::storage_traits::{BlobStore, StorageResult};

/// Object storage bucket reached through `/storage/v1/object/<bucket>/<path>`.
pub struct StorageBlobStore {
    base: Url,
    bucket: String,
    service_key: SecretString,
    http: reqwest::Client,
}

impl StorageBlobStore {
    pub fn new(
        url: &str,
        bucket: impl Into<String>,
        service_key: SecretString,
        timeout: Duration,
    ) -> StorageResult<Self> {
        let base = Url::parse(url).map_err(|e| StorageError::InvalidPath {
            path: url.to_string(),
            reason: e.to_string(),
        })?;
        let http = reqwest::Client::builder()
            .user_agent(concat!("batchpub/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .map_err(|e| StorageError::from_reqwest("build http client", e))?;
        Ok(Self {
            base,
            bucket: bucket.into(),
            service_key,
            http,
        })
    }

    /// Object URL with every path segment percent-encoded.
    fn object_url(&self, storage_path: &str) -> StorageResult<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| StorageError::InvalidPath {
                path: self.base.to_string(),
                reason: "storage URL cannot be a base".to_string(),
            })?
            .pop_if_empty()
            .extend(["storage", "v1", "object", self.bucket.as_str()])
            .extend(storage_path.split('/').filter(|s| !s.is_empty()));
        Ok(url)
    }
}

#[async_trait]
impl BlobStore for StorageBlobStore {
    async fn fetch(&self, storage_path: &str) -> StorageResult<Vec<u8>> {
        let url = self.object_url(storage_path)?;
        debug!(bucket = %self.bucket, path = %storage_path, "fetching staged object");
        let key = self.service_key.expose_secret();
        let response = self
            .http
            .get(url)
            .header("apikey", key)
            .bearer_auth(key)
            .send()
            .await
            .map_err(|e| StorageError::from_reqwest("fetch blob", e))?;

        let status = response.status();
        if status.is_success() {
            let bytes = response
                .bytes()
                .await
                .map_err(|e| StorageError::from_reqwest("read blob", e))?;
            return Ok(bytes.to_vec());
        }

        let body = response.text().await.unwrap_or_default();
        // Storage reports some missing objects as 400 with a not_found body.
        if status == StatusCode::NOT_FOUND
            || (status == StatusCode::BAD_REQUEST && body.contains("not_found"))
        {
            return Err(StorageError::BlobNotFound {
                path: storage_path.to_string(),
            });
        }
        Err(StorageError::Http {
            status: Some(status.as_u16()),
            message: format!("fetch blob: {body}"),
        })
    }
}

/// Blob store rooted at a local directory.
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, storage_path: &str) -> StorageResult<PathBuf> {
        let relative = Path::new(storage_path);
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(StorageError::InvalidPath {
                path: storage_path.to_string(),
                reason: "must be relative without '.' or '..' segments".to_string(),
            });
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn fetch(&self, storage_path: &str) -> StorageResult<Vec<u8>> {
        let path = self.resolve(storage_path)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::BlobNotFound {
                    path: storage_path.to_string(),
                })
            }
            Err(e) => Err(StorageError::Io(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_url_encodes_segments() {
        let store = StorageBlobStore::new(
            "https://project.supabase.co",
            "assets",
            SecretString::from("k"),
            Duration::from_secs(5),
        )
        .unwrap();
        let url = store.object_url("site-1/hero image.png").unwrap();
        assert_eq!(
            url.as_str(),
            "https://project.supabase.co/storage/v1/object/assets/site-1/hero%20image.png"
        );
    }

    #[tokio::test]
    async fn fs_store_reads_nested_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("site/img")).unwrap();
        std::fs::write(dir.path().join("site/img/a.png"), b"png").unwrap();

        let store = FsBlobStore::new(dir.path());
        assert_eq!(store.fetch("site/img/a.png").await.unwrap(), b"png");
    }

    #[tokio::test]
    async fn fs_store_reports_missing_blob() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path());
        let err = store.fetch("nope.txt").await.unwrap_err();
        assert!(matches!(err, StorageError::BlobNotFound { path } if path == "nope.txt"));
    }

    #[tokio::test]
    async fn fs_store_rejects_escaping_paths() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path());
        assert!(matches!(
            store.fetch("../etc/passwd").await.unwrap_err(),
            StorageError::InvalidPath { .. }
        ));
        assert!(matches!(
            store.fetch("/etc/passwd").await.unwrap_err(),
            StorageError::InvalidPath { .. }
        ));
    }
}
