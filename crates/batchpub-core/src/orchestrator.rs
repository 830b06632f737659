//! Orchestrator: sequences one batch commit under the batch state machine.
//!
//! ```text
//!   open ──BEGIN──▶ committing ──COMPLETE──▶ complete
//!    ▲                  │  │
//!    └─RELEASE_DRY_RUN──┘  └──FAIL──▶ failed
//! ```
//!
//! The BEGIN compare-and-swap is the only concurrency control: whoever wins
//! it owns the batch until it leaves `committing`. Losers return a conflict
//! without touching anything else (no token mint, no asset reads).
//!
//! Failures after BEGIN are recorded on the batch with `FAIL`. A commit
//! that landed remotely but could not be marked `complete` is reported as
//! `Internal` with its SHA and is never marked `failed`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use batchpub_github::{GitHost, GitHubError, Identity, RepoName, RepoSession, TokenMinter};
use batchpub_state::{
    AssetId, AssetStatus, AssetStore, BatchId, BatchPatch, BatchState, BatchStore, BlobStore,
    ChangeBatch, SiteStore, Transition,
};
use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::builder::{default_commit_message, CommitBuilder, PushedCommit};
use crate::error::{CommitError, CommitResult};
use crate::metrics::METRICS;
use crate::obs::{self, BatchSpan};
use crate::resolver::{AssetResolver, StagedFile};

/// A request to publish one batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitRequest {
    pub batch_id: BatchId,
    pub dry_run: bool,
}

/// What a successful run did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CommitReceipt {
    Committed { batch_id: BatchId, commit_sha: String },
    DryRun { batch_id: BatchId },
}

impl CommitReceipt {
    pub fn batch_id(&self) -> BatchId {
        match self {
            CommitReceipt::Committed { batch_id, .. } | CommitReceipt::DryRun { batch_id } => {
                *batch_id
            }
        }
    }
}

/// Bounds on re-running the build after the branch moved (or an attempt
/// timed out).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            attempt_timeout: Duration::from_secs(120),
        }
    }
}

/// Collaborators of the orchestrator, all injected.
#[derive(Clone)]
pub struct Services {
    pub batches: Arc<dyn BatchStore>,
    pub assets: Arc<dyn AssetStore>,
    pub sites: Arc<dyn SiteStore>,
    pub blobs: Arc<dyn BlobStore>,
    pub minter: Arc<dyn TokenMinter>,
    pub host: Arc<dyn GitHost>,
}

pub struct Orchestrator {
    batches: Arc<dyn BatchStore>,
    assets: Arc<dyn AssetStore>,
    sites: Arc<dyn SiteStore>,
    minter: Arc<dyn TokenMinter>,
    resolver: AssetResolver,
    builder: CommitBuilder,
    retry: RetryPolicy,
}

impl Orchestrator {
    pub fn new(services: Services) -> Self {
        Self {
            resolver: AssetResolver::new(services.assets.clone(), services.blobs),
            builder: CommitBuilder::new(services.host),
            batches: services.batches,
            assets: services.assets,
            sites: services.sites,
            minter: services.minter,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = RetryPolicy {
            max_attempts: retry.max_attempts.max(1),
            ..retry
        };
        self
    }

    pub fn with_identity(mut self, identity: Identity) -> Self {
        self.builder = self.builder.with_identity(identity);
        self
    }

    /// Bound on concurrent blob fetches and blob creations.
    pub fn with_concurrency(mut self, n: usize) -> Self {
        self.builder = self.builder.with_blob_concurrency(n);
        self.resolver = self.resolver.with_concurrency(n);
        self
    }

    /// Publish (or dry-run) one batch.
    pub async fn commit(&self, request: CommitRequest) -> CommitResult<CommitReceipt> {
        BatchSpan::new(&request.batch_id)
            .instrument(async {
                obs::emit_commit_started(&request.batch_id, request.dry_run);
                let started = Instant::now();

                let result = self.run(request).await;

                let outcome = match &result {
                    Ok(CommitReceipt::Committed { .. }) => "committed",
                    Ok(CommitReceipt::DryRun { .. }) => "dry_run",
                    Err(e) => e.kind(),
                };
                obs::emit_commit_finished(
                    &request.batch_id,
                    started.elapsed().as_millis() as u64,
                    outcome,
                );
                result
            })
            .await
    }

    async fn run(&self, request: CommitRequest) -> CommitResult<CommitReceipt> {
        let batch = self.batches.load(&request.batch_id).await?;
        if batch.state != BatchState::Open {
            return Err(CommitError::NotOpen {
                batch_id: batch.id,
                state: batch.state,
            });
        }
        if !self
            .batches
            .transition(&batch.id, Transition::BEGIN, BatchPatch::default())
            .await?
        {
            obs::emit_transition_lost(&batch.id, "open", "committing");
            return Err(CommitError::TransitionLost { batch_id: batch.id });
        }

        // From here on this request owns the batch.
        let mut claimed = Vec::new();
        match self.publish(&batch, request.dry_run, &mut claimed).await {
            Ok(Some(pushed)) => self.complete(&batch, &claimed, pushed).await,
            Ok(None) => self.release_dry_run(&batch).await,
            Err(err) => Err(self.record_failure(&batch, err, &claimed).await),
        }
    }

    /// Everything between BEGIN and the final transition. Returns `None` for
    /// a dry run. Ids of assets moved to `committing` are pushed onto
    /// `claimed` before the move is attempted.
    async fn publish(
        &self,
        batch: &ChangeBatch,
        dry_run: bool,
        claimed: &mut Vec<AssetId>,
    ) -> CommitResult<Option<PushedCommit>> {
        let site = self.sites.load_site(&batch.site_id).await?;
        let repo = RepoName::parse(&site.repo_full_name).map_err(|e| {
            CommitError::internal(format!("site {} is misconfigured: {e}", site.id))
        })?;

        let installation_id = site.github_installation_id;
        let token = self
            .minter
            .mint(installation_id)
            .await
            .map_err(|source| CommitError::Credential {
                installation_id,
                source,
            })?;
        obs::emit_token_minted(installation_id, &token.expires_at);
        if let Err(e) = self
            .sites
            .record_token_expiry(&site.id, token.expires_at)
            .await
        {
            obs::emit_bookkeeping_failed(&batch.id, "record_token_expiry", &e);
        }

        if dry_run {
            return Ok(None);
        }

        let staged = self.resolver.list_staged(&batch.id).await?;
        let files = self.resolver.resolve(&staged).await?;

        claimed.extend(files.iter().map(|f| f.asset_id));
        let changed = self
            .assets
            .set_status(
                &batch.id,
                claimed,
                AssetStatus::Staged,
                AssetStatus::Committing,
            )
            .await?;
        if changed != files.len() as u64 {
            return Err(CommitError::asset_integrity(
                None,
                format!(
                    "staged assets changed during commit ({changed} of {} claimed)",
                    files.len()
                ),
            ));
        }
        debug!(claimed = changed, "assets marked committing");

        let message = batch
            .commit_message
            .as_deref()
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| default_commit_message(&batch.id, files.len()));
        let session = RepoSession::new(repo, &token);

        self.push_with_retry(&session, &site.default_branch, &files, &message)
            .await
            .map(Some)
    }

    /// Run steps 1-5 until the branch accepts our commit. Ref conflicts are
    /// retried up to the policy bound. A timeout fails the run unless it hits
    /// an attempt that is itself a retry, in which case only that attempt is
    /// abandoned. Before giving up on or repeating a timed-out attempt whose
    /// commit was already created, the branch is checked: the ref update may
    /// have landed even though its response never arrived.
    async fn push_with_retry(
        &self,
        session: &RepoSession,
        branch: &str,
        files: &[StagedFile],
        message: &str,
    ) -> CommitResult<PushedCommit> {
        let max = self.retry.max_attempts;
        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut created: Option<PushedCommit> = None;
            let outcome = tokio::time::timeout(self.retry.attempt_timeout, async {
                let prepared = self.builder.prepare(session, branch, files, message).await?;
                created = Some(prepared.clone());
                self.builder.advance(session, branch, &prepared).await?;
                Ok::<_, CommitError>(prepared)
            })
            .await;
            let err = match outcome {
                Ok(Ok(pushed)) => return Ok(pushed),
                Ok(Err(err)) => err,
                Err(_) => CommitError::Remote(GitHubError::Timeout {
                    operation: format!("build and push attempt {attempt}"),
                }),
            };

            if err.is_timeout() {
                if let Some(pushed) = created {
                    if self.landed(session, branch, &pushed).await {
                        return Ok(pushed);
                    }
                }
            }

            let retryable = match &err {
                CommitError::ConcurrentUpdate { .. } => true,
                e => e.is_timeout() && attempt > 1,
            };
            if !retryable || attempt >= max {
                return Err(err.with_attempts(attempt));
            }
            if matches!(err, CommitError::ConcurrentUpdate { .. }) {
                METRICS.inc_ref_conflict_retries();
                obs::emit_ref_conflict(branch, attempt, max);
            } else {
                warn!(attempt, max, error = %err, "build attempt abandoned, retrying");
            }
        }
    }

    /// Whether the branch already points at `pushed.commit`. Any failure to
    /// find out counts as "no".
    async fn landed(&self, session: &RepoSession, branch: &str, pushed: &PushedCommit) -> bool {
        let check = tokio::time::timeout(
            self.retry.attempt_timeout,
            self.builder.points_at(session, branch, &pushed.commit),
        )
        .await;
        match check {
            Ok(Ok(true)) => {
                info!(commit = %pushed.commit.short(), "ref update landed before the timeout");
                true
            }
            Ok(Ok(false)) => false,
            Ok(Err(e)) => {
                warn!(error = %e, "could not read branch head after a timeout");
                false
            }
            Err(_) => {
                warn!("timed out reading branch head after a timeout");
                false
            }
        }
    }

    async fn complete(
        &self,
        batch: &ChangeBatch,
        claimed: &[AssetId],
        pushed: PushedCommit,
    ) -> CommitResult<CommitReceipt> {
        let sha = pushed.commit.to_string();
        let patch = BatchPatch::default()
            .with_commit_sha(sha.clone())
            .with_metadata("committed_at", Value::String(Utc::now().to_rfc3339()))
            .with_metadata("parent_sha", Value::String(pushed.parent.to_string()));

        let failure = match self
            .batches
            .transition(&batch.id, Transition::COMPLETE, patch)
            .await
        {
            Ok(true) => None,
            Ok(false) => Some("batch left committing before it could be completed".to_string()),
            Err(e) => Some(e.to_string()),
        };
        if let Some(reason) = failure {
            obs::emit_reconcile_required(&batch.id, &sha, &reason);
            METRICS.inc_commits_failed();
            return Err(CommitError::Internal {
                message: format!("commit {sha} landed but the batch was not completed: {reason}"),
                commit_sha: Some(sha),
            });
        }

        if let Err(e) = self
            .assets
            .set_status(
                &batch.id,
                claimed,
                AssetStatus::Committing,
                AssetStatus::Committed,
            )
            .await
        {
            obs::emit_bookkeeping_failed(&batch.id, "mark_assets_committed", &e);
        }
        METRICS.inc_commits_completed();
        Ok(CommitReceipt::Committed {
            batch_id: batch.id,
            commit_sha: sha,
        })
    }

    async fn release_dry_run(&self, batch: &ChangeBatch) -> CommitResult<CommitReceipt> {
        let released = self
            .batches
            .transition(&batch.id, Transition::RELEASE_DRY_RUN, BatchPatch::default())
            .await;
        match released {
            Ok(true) => {
                METRICS.inc_dry_runs();
                Ok(CommitReceipt::DryRun { batch_id: batch.id })
            }
            Ok(false) => {
                obs::emit_transition_lost(&batch.id, "committing", "open");
                Err(self
                    .record_failure(
                        batch,
                        CommitError::internal("batch left committing during a dry run"),
                        &[],
                    )
                    .await)
            }
            Err(e) => Err(self.record_failure(batch, e.into(), &[]).await),
        }
    }

    /// Best-effort `committing -> failed` with the error recorded. Always
    /// hands back the original error.
    async fn record_failure(
        &self,
        batch: &ChangeBatch,
        err: CommitError,
        claimed: &[AssetId],
    ) -> CommitError {
        warn!(kind = err.kind(), error = %err, "batch commit failed");
        METRICS.inc_commits_failed();

        if !claimed.is_empty() {
            if let Err(e) = self
                .assets
                .set_status(
                    &batch.id,
                    claimed,
                    AssetStatus::Committing,
                    AssetStatus::Staged,
                )
                .await
            {
                obs::emit_bookkeeping_failed(&batch.id, "release_assets", &e);
            }
        }

        let patch = BatchPatch::default().with_error(&err.detail());
        match self
            .batches
            .transition(&batch.id, Transition::FAIL, patch)
            .await
        {
            Ok(true) => {}
            Ok(false) => obs::emit_bookkeeping_failed(
                &batch.id,
                "mark_failed",
                &"batch was no longer committing",
            ),
            Err(e) => obs::emit_bookkeeping_failed(&batch.id, "mark_failed", &e),
        }
        err
    }
}
