//! Process-wide counters for the commit path.
//!
//! Counters are bumped silently at the call site; [`Metrics::flush`] logs
//! all of them as one event (the daemon does so on shutdown).

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics singleton.
pub static METRICS: Metrics = Metrics::new();

pub struct Metrics {
    commits_completed: AtomicU64,
    commits_failed: AtomicU64,
    dry_runs: AtomicU64,
    ref_conflict_retries: AtomicU64,
    blobs_created: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            commits_completed: AtomicU64::new(0),
            commits_failed: AtomicU64::new(0),
            dry_runs: AtomicU64::new(0),
            ref_conflict_retries: AtomicU64::new(0),
            blobs_created: AtomicU64::new(0),
        }
    }

    pub fn inc_commits_completed(&self) {
        self.commits_completed.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "commits_completed", "counter incremented");
    }

    pub fn inc_commits_failed(&self) {
        self.commits_failed.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "commits_failed", "counter incremented");
    }

    pub fn inc_dry_runs(&self) {
        self.dry_runs.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "dry_runs", "counter incremented");
    }

    pub fn inc_ref_conflict_retries(&self) {
        self.ref_conflict_retries.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "ref_conflict_retries", "counter incremented");
    }

    /// Add `n` blob creations (one call per staged file per attempt).
    pub fn add_blobs_created(&self, n: u64) {
        self.blobs_created.fetch_add(n, Ordering::Relaxed);
    }

    /// Emit all current counter values as a single `info!` event.
    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            commits_completed = self.commits_completed(),
            commits_failed = self.commits_failed(),
            dry_runs = self.dry_runs(),
            ref_conflict_retries = self.ref_conflict_retries(),
            blobs_created = self.blobs_created(),
        );
    }

    pub fn commits_completed(&self) -> u64 {
        self.commits_completed.load(Ordering::Relaxed)
    }

    pub fn commits_failed(&self) -> u64 {
        self.commits_failed.load(Ordering::Relaxed)
    }

    pub fn dry_runs(&self) -> u64 {
        self.dry_runs.load(Ordering::Relaxed)
    }

    pub fn ref_conflict_retries(&self) -> u64 {
        self.ref_conflict_retries.load(Ordering::Relaxed)
    }

    pub fn blobs_created(&self) -> u64 {
        self.blobs_created.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_increment_independently() {
        let m = Metrics::new();
        m.inc_commits_completed();
        m.inc_commits_failed();
        m.inc_commits_failed();
        m.inc_dry_runs();
        m.inc_ref_conflict_retries();
        m.add_blobs_created(3);
        assert_eq!(m.commits_completed(), 1);
        assert_eq!(m.commits_failed(), 2);
        assert_eq!(m.dry_runs(), 1);
        assert_eq!(m.ref_conflict_retries(), 1);
        assert_eq!(m.blobs_created(), 3);
    }
}
