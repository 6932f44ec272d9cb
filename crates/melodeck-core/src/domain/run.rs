//! Run state machine and run context
//!
//! ## State Machine
//!
//! ```text
//!   Idle ──► Scanning ──► Diffing ──► Executing ──► Committing ──► Idle
//!               │            │            │              │
//!               └────────────┴────────────┴──────────────┴──► Failed
//!
//!   Cancelled is reachable from every non-terminal state.
//! ```
//!
//! A [`RunContext`] travels through every Scanner/Diff/Execution call in
//! place of any process-wide "current sync" singleton: it owns the
//! options, the cooperative cancellation token, the run metrics, and the
//! progress sender.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::errors::{DomainError, SyncError};
use super::progress::{ProgressEvent, ProgressSender};

// ============================================================================
// RunState
// ============================================================================

/// State of a sync run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    /// No run in progress
    Idle,
    /// Walking the source and destination roots
    Scanning,
    /// Computing the change set
    Diffing,
    /// Applying the change set to disk
    Executing,
    /// Persisting the new baseline and run history
    Committing,
    /// Terminal: the run aborted on a fatal condition
    Failed,
    /// Terminal: the run was cancelled; prior baseline untouched
    Cancelled,
}

impl RunState {
    /// Returns true for terminal states
    pub fn is_terminal(self) -> bool {
        matches!(self, RunState::Failed | RunState::Cancelled)
    }

    /// Returns whether the transition to `next` is allowed
    pub fn can_transition_to(self, next: RunState) -> bool {
        use RunState::*;
        match (self, next) {
            (Idle, Scanning) => true,
            (Scanning, Diffing) | (Diffing, Executing) | (Executing, Committing) => true,
            (Committing, Idle) => true,
            // Fatal conditions surface while actual work is happening,
            // including a store failure during commit.
            (Scanning | Diffing | Executing | Committing, Failed) => true,
            (s, Cancelled) if !s.is_terminal() => true,
            _ => false,
        }
    }

    /// Transitions to `next`
    ///
    /// # Errors
    /// Returns `DomainError::InvalidState` when the edge is not part of
    /// the machine.
    pub fn transition_to(self, next: RunState) -> Result<RunState, DomainError> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(DomainError::InvalidState {
                from: format!("{:?}", self),
                to: format!("{:?}", next),
            })
        }
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RunState::Idle => "idle",
            RunState::Scanning => "scanning",
            RunState::Diffing => "diffing",
            RunState::Executing => "executing",
            RunState::Committing => "committing",
            RunState::Failed => "failed",
            RunState::Cancelled => "cancelled",
        };
        write!(f, "{}", name)
    }
}

// ============================================================================
// SyncOptions
// ============================================================================

/// Which way changes propagate in a three-way diff
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncDirection {
    /// Source wins; destination-only changes are not propagated back
    OneWay,
    /// Changes propagate both ways; divergence becomes a conflict
    Bidirectional,
}

impl Default for SyncDirection {
    fn default() -> Self {
        SyncDirection::OneWay
    }
}

/// Per-run tunables
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncOptions {
    /// Propagation direction for three-way diffs
    pub direction: SyncDirection,
    /// Maximum concurrent execution operations (and hash workers)
    pub concurrency: usize,
    /// Retry attempts per operation before marking it Failed
    pub retry_limit: u32,
    /// First retry delay; doubles per attempt
    pub retry_base_delay: Duration,
    /// Two mtimes closer than this compare equal (FAT stores 2s steps)
    pub mtime_tolerance: Duration,
    /// Plan only: mark every operation Skipped, touch nothing
    pub dry_run: bool,
    /// fsync temp files before the atomic rename
    pub durable: bool,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            direction: SyncDirection::OneWay,
            concurrency: 8,
            retry_limit: 3,
            retry_base_delay: Duration::from_millis(250),
            mtime_tolerance: Duration::from_secs(2),
            dry_run: false,
            durable: true,
        }
    }
}

// ============================================================================
// RunMetrics
// ============================================================================

/// Shared atomic counters updated by workers throughout a run
#[derive(Debug, Default)]
pub struct RunMetrics {
    entries_scanned: AtomicU64,
    fingerprints_computed: AtomicU64,
    bytes_written: AtomicU64,
    operations_applied: AtomicU64,
    operations_failed: AtomicU64,
    operations_skipped: AtomicU64,
    progress_dropped: AtomicU64,
}

impl RunMetrics {
    /// Records one scanned entry
    pub fn record_entry_scanned(&self) {
        self.entries_scanned.fetch_add(1, Ordering::Relaxed);
    }

    /// Records one fingerprint computation (cache misses only)
    pub fn record_fingerprint(&self) {
        self.fingerprints_computed.fetch_add(1, Ordering::Relaxed);
    }

    /// Records bytes written by an applied operation
    pub fn record_bytes_written(&self, bytes: u64) {
        self.bytes_written.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Records an applied operation
    pub fn record_applied(&self) {
        self.operations_applied.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a permanently failed operation
    pub fn record_failed(&self) {
        self.operations_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a skipped operation
    pub fn record_skipped(&self) {
        self.operations_skipped.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a progress event dropped on a full channel
    pub fn record_progress_dropped(&self) {
        self.progress_dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Entries scanned so far
    pub fn entries_scanned(&self) -> u64 {
        self.entries_scanned.load(Ordering::Relaxed)
    }

    /// Fingerprints actually computed (cache hits excluded)
    pub fn fingerprints_computed(&self) -> u64 {
        self.fingerprints_computed.load(Ordering::Relaxed)
    }

    /// Bytes written so far
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Relaxed)
    }

    /// Applied operations so far
    pub fn operations_applied(&self) -> u64 {
        self.operations_applied.load(Ordering::Relaxed)
    }

    /// Failed operations so far
    pub fn operations_failed(&self) -> u64 {
        self.operations_failed.load(Ordering::Relaxed)
    }

    /// Skipped operations so far
    pub fn operations_skipped(&self) -> u64 {
        self.operations_skipped.load(Ordering::Relaxed)
    }

    /// Progress events dropped so far
    pub fn progress_dropped(&self) -> u64 {
        self.progress_dropped.load(Ordering::Relaxed)
    }
}

// ============================================================================
// RunContext
// ============================================================================

/// Everything one run's workers need, passed explicitly
///
/// Cheap to clone: options are small, metrics and the progress sender are
/// shared behind `Arc`, and child tokens keep cancellation hierarchical.
#[derive(Debug, Clone)]
pub struct RunContext {
    options: SyncOptions,
    cancel: CancellationToken,
    metrics: Arc<RunMetrics>,
    progress: Option<ProgressSender>,
}

impl RunContext {
    /// Creates a context with the given options and a fresh token
    pub fn new(options: SyncOptions) -> Self {
        Self {
            options,
            cancel: CancellationToken::new(),
            metrics: Arc::new(RunMetrics::default()),
            progress: None,
        }
    }

    /// Attaches a progress sender (builder style)
    pub fn with_progress(mut self, progress: ProgressSender) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Returns the run options
    pub fn options(&self) -> &SyncOptions {
        &self.options
    }

    /// Returns the cancellation token (clone for workers)
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Requests cooperative cancellation of the run
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Returns true once cancellation was requested
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Errors with `SyncError::Cancelled` once cancellation was requested
    ///
    /// Workers call this between entries, comparisons, and operations.
    pub fn check_cancelled(&self) -> Result<(), SyncError> {
        if self.is_cancelled() {
            Err(SyncError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Returns the shared metrics
    pub fn metrics(&self) -> &RunMetrics {
        &self.metrics
    }

    /// Returns a shared handle to the metrics for long-lived workers
    pub fn metrics_handle(&self) -> Arc<RunMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Emits a progress event if a consumer is attached
    ///
    /// Never blocks: a full channel drops the event and bumps the
    /// `progress_dropped` counter.
    pub fn emit_progress(&self, event: ProgressEvent) {
        if let Some(progress) = &self.progress {
            if !progress.emit(event) {
                self.metrics.record_progress_dropped();
            }
        }
    }
}

impl Default for RunContext {
    fn default() -> Self {
        Self::new(SyncOptions::default())
    }
}
