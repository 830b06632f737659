//! PostgREST backend for the batch, asset and site tables.
//!
//! Talks to `/rest/v1/<table>` with the service-role key. The state CAS is a
//! conditional `PATCH ?id=eq.<id>&state=eq.<from>` with
//! `Prefer: return=representation`: zero returned rows means another writer
//! moved the row first.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Method;
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde_json::{json, Map, Value};
use tracing::{debug, instrument};

use crate::error::StorageError;
use crate::model::*;
use crate::state::Transition;
use crate::storage_traits::*;

const BATCHES: &str = "change_batches";
const ASSETS: &str = "asset_versions";
const SITES: &str = "sites";

/// Connection settings for a PostgREST endpoint
#[derive(Debug, Clone)]
pub struct PostgrestConfig {
    /// Project URL, e.g. "https://xyz.supabase.co"
    pub url: String,
    /// Service-role key, sent as both `apikey` and bearer token
    pub service_key: SecretString,
    /// Per-request timeout
    pub timeout: Duration,
}

impl PostgrestConfig {
    pub fn new(url: impl Into<String>, service_key: SecretString) -> Self {
        Self {
            url: url.into(),
            service_key,
            timeout: Duration::from_secs(30),
        }
    }

    /// Set custom request timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Row store over PostgREST implementing `BatchStore`, `AssetStore` and
/// `SiteStore`.
pub struct PostgrestStore {
    rest_url: String,
    service_key: SecretString,
    http: reqwest::Client,
}

fn eq(value: impl std::fmt::Display) -> String {
    format!("eq.{value}")
}

fn in_list<T: std::fmt::Display>(values: &[T]) -> String {
    let joined: Vec<String> = values.iter().map(ToString::to_string).collect();
    format!("in.({})", joined.join(","))
}

impl PostgrestStore {
    pub fn new(config: PostgrestConfig) -> StorageResult<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("batchpub/", env!("CARGO_PKG_VERSION")))
            .timeout(config.timeout)
            .build()
            .map_err(|e| StorageError::from_reqwest("build http client", e))?;
        Ok(Self {
            rest_url: format!("{}/rest/v1", config.url.trim_end_matches('/')),
            service_key: config.service_key,
            http,
        })
    }

    fn request(&self, method: Method, table: &str) -> reqwest::RequestBuilder {
        let key = self.service_key.expose_secret();
        self.http
            .request(method, format!("{}/{}", self.rest_url, table))
            .header("apikey", key)
            .bearer_auth(key)
            .header("Accept", "application/json")
    }

    async fn rows<T: DeserializeOwned>(
        operation: &str,
        request: reqwest::RequestBuilder,
    ) -> StorageResult<Vec<T>> {
        let response = request
            .send()
            .await
            .map_err(|e| StorageError::from_reqwest(operation, e))?;
        let status = response.status();
        if !status.is_success() {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "unable to read response body".to_string());
            return Err(StorageError::Http {
                status: Some(status.as_u16()),
                message: format!("{operation}: {message}"),
            });
        }
        response
            .json()
            .await
            .map_err(|e| StorageError::Serialization(format!("{operation}: {e}")))
    }

    async fn select<T: DeserializeOwned>(
        &self,
        operation: &str,
        table: &str,
        query: &[(&str, String)],
    ) -> StorageResult<Vec<T>> {
        let request = self
            .request(Method::GET, table)
            .query(&[("select", "*")])
            .query(query);
        Self::rows(operation, request).await
    }

    async fn update<T: DeserializeOwned>(
        &self,
        operation: &str,
        table: &str,
        query: &[(&str, String)],
        body: &Value,
    ) -> StorageResult<Vec<T>> {
        let request = self
            .request(Method::PATCH, table)
            .header("Prefer", "return=representation")
            .query(query)
            .json(body);
        Self::rows(operation, request).await
    }

    async fn patch_site(&self, site_id: &SiteId, body: Value) -> StorageResult<()> {
        let rows: Vec<Value> = self
            .update("update site", SITES, &[("id", eq(site_id))], &body)
            .await?;
        if rows.is_empty() {
            return Err(StorageError::SiteNotFound {
                site_id: site_id.to_string(),
            });
        }
        Ok(())
    }

    async fn merged_settings(
        &self,
        site_id: &SiteId,
        expires_at: DateTime<Utc>,
    ) -> StorageResult<Map<String, Value>> {
        let mut settings = self.load_site(site_id).await?.settings;
        settings.insert(
            TOKEN_EXPIRY_SETTING.to_string(),
            Value::String(expires_at.to_rfc3339()),
        );
        Ok(settings)
    }
}

#[async_trait]
impl BatchStore for PostgrestStore {
    #[instrument(skip(self), fields(batch_id = %batch_id))]
    async fn load(&self, batch_id: &BatchId) -> StorageResult<ChangeBatch> {
        let rows: Vec<ChangeBatch> = self
            .select("load batch", BATCHES, &[("id", eq(batch_id))])
            .await?;
        rows.into_iter()
            .next()
            .ok_or_else(|| StorageError::BatchNotFound {
                batch_id: batch_id.to_string(),
            })
    }

    #[instrument(skip(self, patch), fields(batch_id = %batch_id, transition = %transition))]
    async fn transition(
        &self,
        batch_id: &BatchId,
        transition: Transition,
        patch: BatchPatch,
    ) -> StorageResult<bool> {
        // PostgREST cannot merge jsonb in a PATCH, so merge client-side. The
        // state filter below still makes the write conditional.
        let current = self.load(batch_id).await?;
        if current.state != transition.from() {
            debug!(current = %current.state, "transition precondition already failed");
            return Ok(false);
        }
        let mut metadata = current.metadata;
        merge_metadata(&mut metadata, &patch.metadata);

        let mut body = json!({
            "state": transition.to(),
            "metadata": metadata,
            "updated_at": Utc::now().to_rfc3339(),
        });
        if let Some(sha) = patch.commit_sha {
            body["commit_sha"] = Value::String(sha);
        }

        let rows: Vec<ChangeBatch> = self
            .update(
                "transition batch",
                BATCHES,
                &[
                    ("id", eq(batch_id)),
                    ("state", eq(transition.from().as_str())),
                ],
                &body,
            )
            .await?;
        Ok(!rows.is_empty())
    }
}

#[async_trait]
impl AssetStore for PostgrestStore {
    async fn list_by_batch(
        &self,
        batch_id: &BatchId,
        status: AssetStatus,
    ) -> StorageResult<Vec<AssetVersion>> {
        self.select(
            "list assets",
            ASSETS,
            &[
                ("batch_id", eq(batch_id)),
                ("status", eq(status.as_str())),
                ("order", "repo_path.asc".to_string()),
            ],
        )
        .await
    }

    async fn set_status(
        &self,
        batch_id: &BatchId,
        asset_ids: &[AssetId],
        from: AssetStatus,
        to: AssetStatus,
    ) -> StorageResult<u64> {
        if asset_ids.is_empty() {
            return Ok(0);
        }
        let rows: Vec<Value> = self
            .update(
                "update asset status",
                ASSETS,
                &[
                    ("batch_id", eq(batch_id)),
                    ("status", eq(from.as_str())),
                    ("id", in_list(asset_ids)),
                ],
                &json!({ "status": to, "updated_at": Utc::now().to_rfc3339() }),
            )
            .await?;
        Ok(rows.len() as u64)
    }
}

#[async_trait]
impl SiteStore for PostgrestStore {
    async fn load_site(&self, site_id: &SiteId) -> StorageResult<Site> {
        let rows: Vec<Site> = self
            .select("load site", SITES, &[("id", eq(site_id))])
            .await?;
        rows.into_iter()
            .next()
            .ok_or_else(|| StorageError::SiteNotFound {
                site_id: site_id.to_string(),
            })
    }

    async fn update_integration(
        &self,
        site_id: &SiteId,
        integration: SiteIntegration,
        token_expires_at: DateTime<Utc>,
    ) -> StorageResult<()> {
        let settings = self.merged_settings(site_id, token_expires_at).await?;
        self.patch_site(
            site_id,
            json!({
                "github_installation_id": integration.github_installation_id,
                "github_app_slug": integration.github_app_slug,
                "repo_full_name": integration.repo_full_name,
                "default_branch": integration.default_branch,
                "updated_at": Utc::now().to_rfc3339(),
                "settings": settings,
            }),
        )
        .await
    }

    async fn record_token_expiry(
        &self,
        site_id: &SiteId,
        expires_at: DateTime<Utc>,
    ) -> StorageResult<()> {
        let settings = self.merged_settings(site_id, expires_at).await?;
        self.patch_site(site_id, json!({ "settings": settings })).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rest_url_drops_trailing_slash() {
        let store = PostgrestStore::new(PostgrestConfig::new(
            "https://project.supabase.co/",
            SecretString::from("service-key"),
        ))
        .unwrap();
        assert_eq!(store.rest_url, "https://project.supabase.co/rest/v1");
    }

    #[test]
    fn filters_use_postgrest_eq_syntax() {
        assert_eq!(eq("open"), "eq.open");
        let id = BatchId::parse("7b0cfa54-3d4c-4a8f-9d55-0a4f0e0b1c11").unwrap();
        assert_eq!(eq(id), "eq.7b0cfa54-3d4c-4a8f-9d55-0a4f0e0b1c11");
    }

    #[test]
    fn id_sets_use_postgrest_in_syntax() {
        let a = AssetId::parse("7b0cfa54-3d4c-4a8f-9d55-0a4f0e0b1c11").unwrap();
        let b = AssetId::parse("00000000-0000-4000-8000-000000000001").unwrap();
        assert_eq!(
            in_list(&[a, b]),
            "in.(7b0cfa54-3d4c-4a8f-9d55-0a4f0e0b1c11,00000000-0000-4000-8000-000000000001)"
        );
    }
}
