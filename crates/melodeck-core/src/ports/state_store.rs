//! State store port (driven/secondary port)
//!
//! The interface for persisting baselines and run history.
//!
//! ## Design Notes
//!
//! - Uses `anyhow::Result` because storage errors are adapter-specific
//!   (SQLite, in-memory, etc.); the orchestrator maps them to
//!   `SyncError::StateStore` at the boundary.
//! - `commit_baseline` is all-or-nothing: implementations replace the
//!   pair's rows inside one transaction so a storage failure leaves the
//!   prior baseline readable.
//! - Reads for one root pair may run concurrently with another pair's
//!   in-progress run.

use crate::domain::newtypes::RootPair;
use crate::domain::report::RunSummary;
use crate::domain::snapshot::Baseline;

/// Port trait for baseline and run-history persistence
#[async_trait::async_trait]
pub trait StateStore: Send + Sync {
    /// Loads the baseline recorded at the end of the last successful sync
    /// for the pair
    ///
    /// Returns `None` when the pair has never completed a sync.
    async fn load_baseline(&self, pair: &RootPair) -> anyhow::Result<Option<Baseline>>;

    /// Replaces the pair's baseline with `baseline`, atomically
    ///
    /// Called exactly once per run, at the Committing state, with a
    /// baseline reflecting only the applied subset of the execution
    /// report.
    async fn commit_baseline(&self, baseline: &Baseline) -> anyhow::Result<()>;

    /// Appends one run to the history
    async fn record_run(&self, summary: &RunSummary) -> anyhow::Result<()>;

    /// Commits the run's writes together
    ///
    /// The default chains the two operations; transactional adapters
    /// override this so the baseline replacement and the history row land
    /// in one transaction.
    async fn commit_run(&self, baseline: &Baseline, summary: &RunSummary) -> anyhow::Result<()> {
        self.commit_baseline(baseline).await?;
        self.record_run(summary).await
    }

    /// Returns the most recent runs for the pair, newest first
    async fn recent_runs(&self, pair: &RootPair, limit: u32) -> anyhow::Result<Vec<RunSummary>>;
}
