//! batchpubd: HTTP surface of the batch commit orchestrator.
//!
//! ## Routes
//!
//! - `POST /batches/:batch_id/commit` body `{batchId, dryRun?}`
//! - `POST /sites/:site_id/installation-sync` body
//!   `{siteId?, installationId, repoFullName, defaultBranch, githubAppSlug?}`
//! - `GET /healthz`
//!
//! Any other method on these paths is answered with a JSON `405`.

pub mod error;

use std::future::Future;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use batchpub_core::{CommitReceipt, CommitRequest, InstallationSyncRequest, Runtime};
use batchpub_state::{BatchId, SiteId};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::info;

use crate::error::{CommitBody, CommitFailure, SyncFailure};

pub fn router(runtime: Runtime) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route(
            "/batches/:batch_id/commit",
            post(commit_batch).fallback(|| async { CommitFailure::MethodNotAllowed }),
        )
        .route(
            "/sites/:site_id/installation-sync",
            post(sync_installation).fallback(|| async { SyncFailure::MethodNotAllowed }),
        )
        .with_state(runtime)
}

/// Serve until `shutdown` resolves.
pub async fn serve(
    listener: TcpListener,
    runtime: Runtime,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    info!(addr = %listener.local_addr()?, "batchpubd listening");
    axum::serve(listener, router(runtime))
        .with_graceful_shutdown(shutdown)
        .await
}

async fn healthz() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CommitPayload {
    #[serde(default)]
    batch_id: Option<String>,
    #[serde(default)]
    dry_run: bool,
}

fn parse_batch_id(raw: &str) -> Result<BatchId, CommitFailure> {
    BatchId::parse(raw.trim())
        .map_err(|_| CommitFailure::BadRequest("batchId must be a UUID".to_string()))
}

async fn commit_batch(
    State(runtime): State<Runtime>,
    Path(raw_batch_id): Path<String>,
    body: Bytes,
) -> Result<(StatusCode, Json<CommitBody>), CommitFailure> {
    let path_id = parse_batch_id(&raw_batch_id)?;
    let payload: CommitPayload = serde_json::from_slice(&body)
        .map_err(|e| CommitFailure::BadRequest(format!("Malformed JSON body: {e}")))?;
    let batch_id = match payload.batch_id.as_deref().map(str::trim) {
        Some(raw) if !raw.is_empty() => parse_batch_id(raw)?,
        _ => return Err(CommitFailure::BadRequest("batchId is required".to_string())),
    };
    if batch_id != path_id {
        return Err(CommitFailure::BadRequest(
            "batchId in the body does not match the path".to_string(),
        ));
    }

    info!(%batch_id, dry_run = payload.dry_run, "commit requested");
    let receipt = runtime
        .orchestrator
        .commit(CommitRequest {
            batch_id,
            dry_run: payload.dry_run,
        })
        .await
        .map_err(|error| CommitFailure::Commit { batch_id, error })?;

    let body = match receipt {
        CommitReceipt::Committed {
            batch_id,
            commit_sha,
        } => CommitBody {
            status: "accepted",
            message: None,
            batch_id: Some(batch_id),
            commit_sha: Some(commit_sha),
            details: None,
        },
        CommitReceipt::DryRun { batch_id } => CommitBody {
            status: "accepted",
            message: Some("Dry run acknowledged".to_string()),
            batch_id: Some(batch_id),
            commit_sha: None,
            details: None,
        },
    };
    Ok((StatusCode::ACCEPTED, Json(body)))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SyncPayload {
    #[serde(default)]
    site_id: Option<String>,
    #[serde(default)]
    installation_id: Option<u64>,
    #[serde(default)]
    repo_full_name: Option<String>,
    #[serde(default)]
    default_branch: Option<String>,
    #[serde(default)]
    github_app_slug: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SyncAccepted {
    ok: bool,
    expires_at: String,
}

async fn sync_installation(
    State(runtime): State<Runtime>,
    Path(raw_site_id): Path<String>,
    body: Bytes,
) -> Result<Json<SyncAccepted>, SyncFailure> {
    let site_id = SiteId::parse(raw_site_id.trim())
        .map_err(|_| SyncFailure::BadRequest("siteId must be a UUID".to_string()))?;
    let payload: SyncPayload = serde_json::from_slice(&body)
        .map_err(|e| SyncFailure::BadRequest(format!("Malformed JSON body: {e}")))?;
    if let Some(body_site) = payload.site_id.as_deref() {
        if SiteId::parse(body_site.trim()).ok() != Some(site_id) {
            return Err(SyncFailure::BadRequest(
                "siteId in the body does not match the path".to_string(),
            ));
        }
    }
    let (Some(installation_id), Some(repo_full_name), Some(default_branch)) = (
        payload.installation_id,
        payload.repo_full_name,
        payload.default_branch,
    ) else {
        return Err(SyncFailure::BadRequest(
            "installationId, repoFullName and defaultBranch are required".to_string(),
        ));
    };

    let expires_at = runtime
        .installations
        .sync(InstallationSyncRequest {
            site_id,
            installation_id,
            repo_full_name,
            default_branch,
            github_app_slug: payload.github_app_slug,
        })
        .await?;

    Ok(Json(SyncAccepted {
        ok: true,
        expires_at: expires_at.to_rfc3339(),
    }))
}
