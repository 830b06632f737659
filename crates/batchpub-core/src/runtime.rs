//! Wiring of the production backends from a [`ServiceConfig`].

use std::sync::Arc;

use batchpub_github::{AppCredentials, GitHubAppTokenMinter, GitHubGitHost};
use batchpub_state::{BlobStore, PostgrestConfig, PostgrestStore, StorageBlobStore};

use crate::config::{ConfigError, ServiceConfig};
use crate::installation::InstallationSync;
use crate::orchestrator::{Orchestrator, RetryPolicy, Services};

/// The two entry points a process serves, sharing one set of clients.
#[derive(Clone)]
pub struct Runtime {
    pub orchestrator: Arc<Orchestrator>,
    pub installations: Arc<InstallationSync>,
}

impl Runtime {
    /// Row store over PostgREST, blobs from the storage bucket.
    pub fn from_config(config: &ServiceConfig) -> Result<Self, ConfigError> {
        let blobs = StorageBlobStore::new(
            &config.supabase_url,
            config.asset_bucket.clone(),
            config.service_role_key.clone(),
            config.http_timeout,
        )?;
        Self::from_config_with_blobs(config, Arc::new(blobs))
    }

    /// Like [`Runtime::from_config`], with blobs from a caller-chosen store
    /// (the CLI reads them from a local directory).
    pub fn from_config_with_blobs(
        config: &ServiceConfig,
        blobs: Arc<dyn BlobStore>,
    ) -> Result<Self, ConfigError> {
        let rows = Arc::new(PostgrestStore::new(
            PostgrestConfig::new(config.supabase_url.clone(), config.service_role_key.clone())
                .with_timeout(config.http_timeout),
        )?);
        let minter = Arc::new(GitHubAppTokenMinter::new_with_api_base_url(
            AppCredentials::new(
                config.github_app_id.clone(),
                config.github_app_private_key.clone(),
            ),
            config.github_api_url.clone(),
            config.http_timeout,
        )?);
        let host = Arc::new(GitHubGitHost::new_with_api_base_url(
            config.github_api_url.clone(),
            config.http_timeout,
        )?);

        let orchestrator = Orchestrator::new(Services {
            batches: rows.clone(),
            assets: rows.clone(),
            sites: rows.clone(),
            blobs,
            minter: minter.clone(),
            host,
        })
        .with_retry(RetryPolicy {
            max_attempts: config.max_attempts,
            attempt_timeout: config.attempt_timeout,
        })
        .with_identity(config.bot.clone())
        .with_concurrency(config.blob_concurrency);

        Ok(Self {
            orchestrator: Arc::new(orchestrator),
            installations: Arc::new(InstallationSync::new(rows, minter)),
        })
    }
}
