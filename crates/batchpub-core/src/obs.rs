//! Structured lifecycle events for batch commits.
//!
//! Every event carries an `event` field with a stable name so log queries
//! do not depend on message wording. Run-scoped context comes from
//! [`BatchSpan`].

use batchpub_state::BatchId;
use tracing::instrument::Instrumented;
use tracing::{info, warn, Instrument};

/// Batch-scoped span for one orchestration run.
///
/// ```ignore
/// BatchSpan::new(&batch_id).instrument(async { /* ... */ }).await;
/// // every event inside is tagged with batch_id
/// ```
pub struct BatchSpan {
    span: tracing::Span,
}

impl BatchSpan {
    pub fn new(batch_id: &BatchId) -> Self {
        Self {
            span: tracing::info_span!("batchpub.batch", batch_id = %batch_id),
        }
    }

    /// Run `fut` inside the span. An entered guard cannot be held across
    /// `.await` in a `Send` future, so async callers use this.
    pub fn instrument<F: std::future::Future>(self, fut: F) -> Instrumented<F> {
        fut.instrument(self.span)
    }
}

pub fn emit_commit_started(batch_id: &BatchId, dry_run: bool) {
    info!(event = "batch.commit_started", batch_id = %batch_id, dry_run);
}

/// `outcome` is `committed`, `dry_run`, or the failing error's kind.
pub fn emit_commit_finished(batch_id: &BatchId, duration_ms: u64, outcome: &str) {
    info!(
        event = "batch.commit_finished",
        batch_id = %batch_id,
        duration_ms,
        outcome = %outcome,
    );
}

/// Another request moved the batch between our read and our CAS.
pub fn emit_transition_lost(batch_id: &BatchId, from: &str, to: &str) {
    info!(event = "batch.transition_lost", batch_id = %batch_id, from, to);
}

/// Recording a failure (or asset bookkeeping) did not stick. The original
/// failure is still returned to the caller.
pub fn emit_bookkeeping_failed(batch_id: &BatchId, step: &str, error: &dyn std::fmt::Display) {
    warn!(
        event = "batch.bookkeeping_failed",
        batch_id = %batch_id,
        step,
        error = %error,
    );
}

/// The commit landed remotely but the batch could not be marked complete.
pub fn emit_reconcile_required(batch_id: &BatchId, commit_sha: &str, error: &dyn std::fmt::Display) {
    tracing::error!(
        event = "batch.reconcile_required",
        batch_id = %batch_id,
        commit_sha,
        error = %error,
    );
}

/// Never log the token itself.
pub fn emit_token_minted(installation_id: u64, expires_at: &chrono::DateTime<chrono::Utc>) {
    info!(event = "token.minted", installation_id, expires_at = %expires_at);
}

pub fn emit_ref_conflict(branch: &str, attempt: u32, max_attempts: u32) {
    warn!(event = "tree.ref_conflict", branch, attempt, max_attempts);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn batch_span_wraps_a_future() {
        let id = BatchId::new();
        let value = BatchSpan::new(&id)
            .instrument(async {
                emit_commit_started(&id, true);
                emit_commit_finished(&id, 5, "dry_run");
                7
            })
            .await;
        assert_eq!(value, 7);
    }
}
