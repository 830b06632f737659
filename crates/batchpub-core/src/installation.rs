//! Installation sync: point a site at a GitHub App installation.
//!
//! A fresh token is minted first; a revoked or unknown installation is
//! therefore rejected before the site row is touched.

use std::sync::Arc;

use batchpub_github::{RepoName, TokenMinter};
use batchpub_state::{SiteId, SiteIntegration, SiteStore};
use chrono::{DateTime, Utc};
use tracing::{info, instrument};

use crate::error::SyncError;
use crate::obs;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallationSyncRequest {
    pub site_id: SiteId,
    pub installation_id: u64,
    pub repo_full_name: String,
    pub default_branch: String,
    pub github_app_slug: Option<String>,
}

impl InstallationSyncRequest {
    fn validate(&self) -> Result<(), SyncError> {
        if self.installation_id == 0 {
            return Err(SyncError::Validation(
                "installationId must be positive".to_string(),
            ));
        }
        RepoName::parse(&self.repo_full_name)
            .map_err(|e| SyncError::Validation(e.to_string()))?;
        let branch = self.default_branch.trim();
        if branch.is_empty() || branch.starts_with('/') || branch.contains("..") {
            return Err(SyncError::Validation(format!(
                "invalid defaultBranch {:?}",
                self.default_branch
            )));
        }
        Ok(())
    }
}

pub struct InstallationSync {
    sites: Arc<dyn SiteStore>,
    minter: Arc<dyn TokenMinter>,
}

impl InstallationSync {
    pub fn new(sites: Arc<dyn SiteStore>, minter: Arc<dyn TokenMinter>) -> Self {
        Self { sites, minter }
    }

    /// Validate the installation and store it on the site. Returns the
    /// expiry of the token minted for validation.
    #[instrument(skip(self, request), fields(site_id = %request.site_id, installation_id = request.installation_id))]
    pub async fn sync(&self, request: InstallationSyncRequest) -> Result<DateTime<Utc>, SyncError> {
        request.validate()?;

        let token = self
            .minter
            .mint(request.installation_id)
            .await
            .map_err(|source| SyncError::Credential {
                installation_id: request.installation_id,
                source,
            })?;
        obs::emit_token_minted(request.installation_id, &token.expires_at);

        let integration = SiteIntegration {
            github_installation_id: request.installation_id,
            repo_full_name: request.repo_full_name,
            default_branch: request.default_branch.trim().to_string(),
            github_app_slug: request.github_app_slug.filter(|s| !s.trim().is_empty()),
        };
        self.sites
            .update_integration(&request.site_id, integration, token.expires_at)
            .await?;

        info!(expires_at = %token.expires_at, "installation synced");
        Ok(token.expires_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use batchpub_github::fake::FakeTokenMinter;
    use batchpub_state::fakes::MemorySiteStore;
    use batchpub_state::{Site, StorageError, TOKEN_EXPIRY_SETTING};
    use serde_json::json;

    fn setup() -> (Arc<MemorySiteStore>, Arc<FakeTokenMinter>, Site) {
        let sites = Arc::new(MemorySiteStore::new());
        let mut site = Site::new("docs", "acme/old", "master", 1);
        site.settings.insert("theme".to_string(), json!("dark"));
        sites.insert(site.clone());
        (sites, Arc::new(FakeTokenMinter::new()), site)
    }

    fn request(site: &Site, installation_id: u64) -> InstallationSyncRequest {
        InstallationSyncRequest {
            site_id: site.id,
            installation_id,
            repo_full_name: "acme/new".to_string(),
            default_branch: "main".to_string(),
            github_app_slug: Some("batchpub".to_string()),
        }
    }

    #[tokio::test]
    async fn sync_updates_integration_and_merges_settings() {
        let (sites, minter, site) = setup();
        let sync = InstallationSync::new(sites.clone(), minter.clone());

        let expires_at = sync.sync(request(&site, 42)).await.unwrap();

        let stored = sites.get(&site.id).unwrap();
        assert_eq!(stored.github_installation_id, 42);
        assert_eq!(stored.repo_full_name, "acme/new");
        assert_eq!(stored.default_branch, "main");
        assert_eq!(stored.github_app_slug.as_deref(), Some("batchpub"));
        assert_eq!(stored.settings["theme"], "dark");
        assert!(stored.settings.contains_key(TOKEN_EXPIRY_SETTING));
        assert_eq!(
            stored.token_expiry_hint().map(|t| t.timestamp()),
            Some(expires_at.timestamp())
        );
    }

    #[tokio::test]
    async fn revoked_installation_leaves_site_untouched() {
        let (sites, minter, site) = setup();
        minter.revoke(42);
        let sync = InstallationSync::new(sites.clone(), minter.clone());

        let err = sync.sync(request(&site, 42)).await.unwrap_err();
        assert!(matches!(err, SyncError::Credential { installation_id: 42, .. }));
        assert_eq!(sites.get(&site.id).unwrap().repo_full_name, "acme/old");
    }

    #[tokio::test]
    async fn invalid_requests_never_mint() {
        let (sites, minter, site) = setup();
        let sync = InstallationSync::new(sites, minter.clone());

        assert!(matches!(
            sync.sync(request(&site, 0)).await,
            Err(SyncError::Validation(_))
        ));
        let mut bad_repo = request(&site, 42);
        bad_repo.repo_full_name = "not-a-repo".to_string();
        assert!(matches!(
            sync.sync(bad_repo).await,
            Err(SyncError::Validation(_))
        ));
        assert_eq!(minter.mints(), 0);
    }

    #[tokio::test]
    async fn unknown_site_is_a_storage_error() {
        let (sites, minter, site) = setup();
        let sync = InstallationSync::new(sites, minter);
        let mut req = request(&site, 42);
        req.site_id = SiteId::new();
        assert!(matches!(
            sync.sync(req).await,
            Err(SyncError::Storage(StorageError::SiteNotFound { .. }))
        ));
    }
}
