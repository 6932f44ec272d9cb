//! Sync run orchestrator
//!
//! [`SyncRun`] drives one synchronization of a root pair end to end:
//!
//! 1. **Scanning** - source and destination roots scanned concurrently
//! 2. **Diffing** - three-way against the stored baseline when one
//!    exists, two-way otherwise
//! 3. **Executing** - the change set applied with crash-safe writes
//! 4. **Committing** - a baseline reflecting only the applied subset,
//!    plus the run-history row, in one store transaction
//!
//! A cancelled or failed run never reaches Committing, so the prior
//! baseline survives untouched. Bidirectional runs add a role-swapped
//! second diff+execute pass; conflicts are surfaced once, by the forward
//! pass.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, instrument, warn};

use melodeck_core::config::ScanSettings;
use melodeck_core::domain::{
    Baseline, BaselineEntry, ChangeSet, ExecutionReport, Operation, RootPair, RunContext,
    RunId, RunOutcome, RunState, RunSummary, Snapshot, SyncDirection, SyncError,
};
use melodeck_core::ports::{ExtractorRegistry, Fingerprinter, StateStore};
use melodeck_diff::{DiffEngine, FingerprintService};
use melodeck_scan::Scanner;

use crate::executor::Executor;

/// One root pair's synchronization driver
///
/// Holds the collaborators a run needs; each [`run`](Self::run) call is a
/// fresh run with its own context, snapshots, and fingerprint cache.
pub struct SyncRun {
    pair: RootPair,
    store: Arc<dyn StateStore>,
    registry: ExtractorRegistry,
    scan_settings: ScanSettings,
    state: RunState,
}

impl SyncRun {
    /// Creates a run driver for the pair
    pub fn new(pair: RootPair, store: Arc<dyn StateStore>) -> Self {
        Self {
            pair,
            store,
            registry: ExtractorRegistry::new(),
            scan_settings: ScanSettings::default(),
            state: RunState::Idle,
        }
    }

    /// Attaches a metadata extractor registry for the source scan
    pub fn with_registry(mut self, registry: ExtractorRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Replaces the scan settings
    pub fn with_scan_settings(mut self, settings: ScanSettings) -> Self {
        self.scan_settings = settings;
        self
    }

    /// Current state, for observers
    pub fn state(&self) -> RunState {
        self.state
    }

    fn advance(&mut self, next: RunState) {
        match self.state.transition_to(next) {
            Ok(state) => self.state = state,
            Err(err) => {
                // A bad edge is a bug in this orchestrator, not a runtime
                // condition; keep going so the run still terminates.
                error!(%err, "run state machine misuse");
                self.state = next;
            }
        }
    }

    /// Performs one full sync run
    ///
    /// Returns `Ok` with the summary for committed **and** cancelled runs
    /// (the outcome field tells them apart); `Err` only for fatal
    /// conditions. Either way a run-history row is recorded, best effort
    /// for aborted runs.
    #[instrument(skip(self, ctx), fields(pair = %self.pair))]
    pub async fn run(&mut self, ctx: &RunContext) -> Result<RunSummary, SyncError> {
        let id = RunId::new();
        let started_at = Utc::now();
        self.state = RunState::Idle;

        info!(run = %id, "starting sync run");

        match self.run_inner(id, started_at, ctx).await {
            Ok(summary) => {
                info!(
                    run = %id,
                    applied = summary.applied,
                    failed = summary.failed,
                    conflicts = summary.conflicts,
                    "sync run committed"
                );
                Ok(summary)
            }
            Err(SyncError::Cancelled) => {
                self.advance(RunState::Cancelled);
                let summary = self.aborted_summary(id, started_at, RunOutcome::Cancelled, ctx);
                if let Err(err) = self.store.record_run(&summary).await {
                    warn!(%err, "failed to record cancelled run");
                }
                info!(run = %id, "sync run cancelled, baseline untouched");
                Ok(summary)
            }
            Err(err) => {
                self.advance(RunState::Failed);
                let summary = self.aborted_summary(
                    id,
                    started_at,
                    RunOutcome::Failed {
                        reason: err.to_string(),
                    },
                    ctx,
                );
                if let Err(record_err) = self.store.record_run(&summary).await {
                    warn!(%record_err, "failed to record failed run");
                }
                error!(run = %id, %err, "sync run failed");
                Err(err)
            }
        }
    }

    async fn run_inner(
        &mut self,
        id: RunId,
        started_at: DateTime<Utc>,
        ctx: &RunContext,
    ) -> Result<RunSummary, SyncError> {
        // ------------------------------------------------------------------
        // Scanning
        // ------------------------------------------------------------------
        self.advance(RunState::Scanning);

        let source_scanner = Scanner::new(self.pair.source())
            .with_settings(self.scan_settings.clone())
            .with_registry(self.registry.clone());
        let dest_scanner = Scanner::new(self.pair.dest()).with_settings(self.scan_settings.clone());

        let (source_outcome, dest_outcome) =
            tokio::join!(source_scanner.scan(ctx), dest_scanner.scan(ctx));

        let source = source_outcome?;
        // A destination that does not exist yet is a first sync, not a
        // fatal condition; the executor creates the root on demand.
        let dest = match dest_outcome {
            Ok(outcome) => outcome.snapshot,
            Err(SyncError::RootUnreadable { ref source, .. })
                if source.kind() == std::io::ErrorKind::NotFound =>
            {
                Snapshot::empty(self.pair.dest())
            }
            Err(err) => return Err(err),
        };
        let source_snapshot = source.snapshot;
        for warning in &source.warnings {
            debug!(path = %warning.path.display(), message = %warning.message, "scan warning");
        }

        ctx.check_cancelled()?;

        // ------------------------------------------------------------------
        // Diffing
        // ------------------------------------------------------------------
        self.advance(RunState::Diffing);

        let baseline = self
            .store
            .load_baseline(&self.pair)
            .await
            .map_err(|err| SyncError::StateStore(format!("{err:#}")))?;

        let fingerprinter: Arc<dyn Fingerprinter> =
            Arc::new(FingerprintService::new().with_metrics(ctx.metrics_handle()));
        let engine = DiffEngine::new(fingerprinter);

        let forward = engine
            .changes(&source_snapshot, &dest, baseline.as_ref(), ctx)
            .await?;

        // Bidirectional three-way runs propagate quiet-source/changed-dest
        // paths with a role-swapped second pass. Conflicts were already
        // surfaced by the forward pass and are filtered here.
        let reverse = match (&baseline, ctx.options().direction) {
            (Some(baseline), SyncDirection::Bidirectional) => {
                let mirrored = Baseline::new(
                    self.pair.swapped(),
                    baseline.committed_at(),
                    baseline.iter().cloned().collect(),
                );
                let change_set = engine
                    .diff3(&dest, &source_snapshot, &mirrored, ctx)
                    .await?;
                let operations: Vec<Operation> = change_set
                    .into_operations()
                    .into_iter()
                    .filter(|op| !op.is_conflict())
                    .collect();
                if operations.is_empty() {
                    None
                } else {
                    Some(ChangeSet::new(operations))
                }
            }
            _ => None,
        };

        ctx.check_cancelled()?;

        // ------------------------------------------------------------------
        // Executing
        // ------------------------------------------------------------------
        self.advance(RunState::Executing);

        let conflicts = forward.conflicts().count() as u64;

        let executor = Executor::new(self.pair.source(), self.pair.dest());
        let forward_report = executor.execute(forward, ctx).await?;

        let reverse_report = match reverse {
            Some(change_set) => {
                let reverse_executor = Executor::new(self.pair.dest(), self.pair.source());
                Some(reverse_executor.execute(change_set, ctx).await?)
            }
            None => None,
        };

        // Operations not dispatched after a cancellation were Skipped;
        // the run itself ends Cancelled and commits nothing.
        ctx.check_cancelled()?;

        // ------------------------------------------------------------------
        // Committing
        // ------------------------------------------------------------------
        self.advance(RunState::Committing);

        // A dry run applied nothing, so there is nothing to confirm: the
        // prior baseline stands and only the history row is written.
        if ctx.options().dry_run {
            let summary = build_summary(
                id,
                self.pair.clone(),
                started_at,
                &source_snapshot,
                &dest,
                conflicts,
                &forward_report,
                reverse_report.as_ref(),
            );
            self.store
                .record_run(&summary)
                .await
                .map_err(|err| SyncError::StateStore(format!("{err:#}")))?;
            self.advance(RunState::Idle);
            return Ok(summary);
        }

        let new_baseline = fold_baseline(
            self.pair.clone(),
            baseline,
            &source_snapshot,
            &dest,
            &forward_report,
            reverse_report.as_ref(),
        );

        let summary = build_summary(
            id,
            self.pair.clone(),
            started_at,
            &source_snapshot,
            &dest,
            conflicts,
            &forward_report,
            reverse_report.as_ref(),
        );

        self.store
            .commit_run(&new_baseline, &summary)
            .await
            .map_err(|err| SyncError::StateStore(format!("{err:#}")))?;

        self.advance(RunState::Idle);
        Ok(summary)
    }

    /// Summary for a run that never reached Committing
    fn aborted_summary(
        &self,
        id: RunId,
        started_at: DateTime<Utc>,
        outcome: RunOutcome,
        ctx: &RunContext,
    ) -> RunSummary {
        let metrics = ctx.metrics();
        RunSummary {
            id,
            pair: self.pair.clone(),
            started_at,
            finished_at: Utc::now(),
            source_entries: 0,
            dest_entries: 0,
            operations_total: metrics.operations_applied()
                + metrics.operations_failed()
                + metrics.operations_skipped(),
            applied: metrics.operations_applied(),
            failed: metrics.operations_failed(),
            skipped: metrics.operations_skipped(),
            conflicts: 0,
            bytes_written: metrics.bytes_written(),
            outcome,
        }
    }
}

// ============================================================================
// Baseline folding
// ============================================================================

/// Builds the next baseline from the prior one and what actually applied
///
/// - Applied Add/Update/Move operations fold their path in (content and
///   mtime from the snapshot the content came from)
/// - Applied Deletes fold their path out
/// - Failed, skipped, and conflicted paths keep whatever the prior
///   baseline said about them
/// - Paths quietly identical in both snapshots and untouched by any
///   operation are recorded when the prior baseline did not know them
///   (first-sync enrichment)
fn fold_baseline(
    pair: RootPair,
    prior: Option<Baseline>,
    source_snapshot: &Snapshot,
    dest_snapshot: &Snapshot,
    forward: &ExecutionReport,
    reverse: Option<&ExecutionReport>,
) -> Baseline {
    let mut baseline = match prior {
        Some(prior) => Baseline::new(pair, Utc::now(), prior.into_entries()),
        None => Baseline::empty(pair),
    };

    // Every path any operation mentioned, applied or not.
    let mut touched: std::collections::BTreeSet<melodeck_core::domain::LibraryPath> =
        std::collections::BTreeSet::new();
    for report in std::iter::once(forward).chain(reverse) {
        for result in report.results() {
            touched.insert(result.operation.path().clone());
            if let Operation::Move { from, .. } = &result.operation {
                touched.insert(from.clone());
            }
        }
    }

    for entry in source_snapshot.iter() {
        if dest_snapshot.contains(entry.path())
            && !touched.contains(entry.path())
            && baseline.get(entry.path()).is_none()
        {
            baseline.upsert(BaselineEntry {
                path: entry.path().clone(),
                size: entry.size(),
                mtime: entry.mtime(),
                fingerprint: entry.fingerprint().copied(),
            });
        }
    }

    // Forward pass wrote source content into the destination; reverse
    // pass wrote destination content back. Either way the baseline
    // records the content that now exists on both sides.
    fold_applied(&mut baseline, forward, source_snapshot);
    if let Some(reverse) = reverse {
        fold_applied(&mut baseline, reverse, dest_snapshot);
    }

    baseline
}

fn fold_applied(baseline: &mut Baseline, report: &ExecutionReport, content_side: &Snapshot) {
    for result in report.applied() {
        match &result.operation {
            Operation::Add {
                path, size, fingerprint,
            }
            | Operation::Update {
                path, size, fingerprint,
            } => {
                let (mtime, snapshot_fp) = match content_side.get(path) {
                    Some(entry) => (entry.mtime(), entry.fingerprint().copied()),
                    None => (Utc::now(), None),
                };
                baseline.upsert(BaselineEntry {
                    path: path.clone(),
                    size: *size,
                    mtime,
                    fingerprint: (*fingerprint).or(snapshot_fp),
                });
            }
            Operation::Delete { path } => {
                baseline.remove(path);
            }
            Operation::Move {
                from, to, size, fingerprint,
            } => {
                baseline.remove(from);
                let mtime = content_side
                    .get(to)
                    .map(|entry| entry.mtime())
                    .unwrap_or_else(Utc::now);
                baseline.upsert(BaselineEntry {
                    path: to.clone(),
                    size: *size,
                    mtime,
                    fingerprint: Some(*fingerprint),
                });
            }
            Operation::Conflict { .. } => {}
        }
    }
}

// ============================================================================
// Summary assembly
// ============================================================================

#[allow(clippy::too_many_arguments)]
fn build_summary(
    id: RunId,
    pair: RootPair,
    started_at: DateTime<Utc>,
    source_snapshot: &Snapshot,
    dest_snapshot: &Snapshot,
    conflicts: u64,
    forward: &ExecutionReport,
    reverse: Option<&ExecutionReport>,
) -> RunSummary {
    let mut operations_total = forward.results().len() as u64;
    let mut applied = forward.applied_count() as u64;
    let mut failed = forward.failed_count() as u64;
    let mut skipped = forward.skipped_count() as u64;
    let mut bytes_written = forward.bytes_written();

    if let Some(reverse) = reverse {
        operations_total += reverse.results().len() as u64;
        applied += reverse.applied_count() as u64;
        failed += reverse.failed_count() as u64;
        skipped += reverse.skipped_count() as u64;
        bytes_written += reverse.bytes_written();
    }

    RunSummary {
        id,
        pair,
        started_at,
        finished_at: Utc::now(),
        source_entries: source_snapshot.len() as u64,
        dest_entries: dest_snapshot.len() as u64,
        operations_total,
        applied,
        failed,
        skipped,
        conflicts,
        bytes_written,
        outcome: RunOutcome::Committed,
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use melodeck_core::domain::{
        LibraryEntry, LibraryPath, OperationOutcome, OperationResult,
    };

    use super::*;

    fn path(s: &str) -> LibraryPath {
        LibraryPath::new(s).unwrap()
    }

    fn applied_add(name: &str, size: u64) -> OperationResult {
        OperationResult {
            operation: Operation::Add {
                path: path(name),
                size,
                fingerprint: None,
            },
            outcome: OperationOutcome::Applied,
            bytes_written: size,
        }
    }

    fn failed_add(name: &str, size: u64) -> OperationResult {
        OperationResult {
            operation: Operation::Add {
                path: path(name),
                size,
                fingerprint: None,
            },
            outcome: OperationOutcome::Failed {
                cause: "permanent i/o error".to_string(),
            },
            bytes_written: 0,
        }
    }

    fn snapshot_of(root: &str, files: &[(&str, u64)]) -> Snapshot {
        Snapshot::from_entries(
            root,
            files
                .iter()
                .map(|(name, size)| LibraryEntry::new(path(name), *size, Utc::now()))
                .collect(),
        )
    }

    #[test]
    fn test_fold_keeps_only_applied_paths() {
        // Three adds; the middle one failed permanently. The committed
        // baseline must describe paths one and three, never path two.
        let pair = RootPair::new("/music", "/backup").unwrap();
        let source = snapshot_of("/music", &[("one.mp3", 1), ("two.mp3", 2), ("three.mp3", 3)]);
        let dest = snapshot_of("/backup", &[]);
        let report = ExecutionReport::new(
            Utc::now(),
            Utc::now(),
            vec![
                applied_add("one.mp3", 1),
                failed_add("two.mp3", 2),
                applied_add("three.mp3", 3),
            ],
        );

        let baseline = fold_baseline(pair, None, &source, &dest, &report, None);

        assert!(baseline.contains(&path("one.mp3")));
        assert!(!baseline.contains(&path("two.mp3")));
        assert!(baseline.contains(&path("three.mp3")));
    }

    #[test]
    fn test_fold_applied_delete_removes_path() {
        let pair = RootPair::new("/music", "/backup").unwrap();
        let prior = Baseline::new(
            pair.clone(),
            Utc::now(),
            vec![BaselineEntry {
                path: path("gone.mp3"),
                size: 9,
                mtime: Utc::now(),
                fingerprint: None,
            }],
        );
        let source = snapshot_of("/music", &[]);
        let dest = snapshot_of("/backup", &[("gone.mp3", 9)]);
        let report = ExecutionReport::new(
            Utc::now(),
            Utc::now(),
            vec![OperationResult {
                operation: Operation::Delete {
                    path: path("gone.mp3"),
                },
                outcome: OperationOutcome::Applied,
                bytes_written: 0,
            }],
        );

        let baseline = fold_baseline(pair, Some(prior), &source, &dest, &report, None);
        assert!(baseline.is_empty());
    }

    #[test]
    fn test_fold_failed_delete_keeps_prior_entry() {
        let pair = RootPair::new("/music", "/backup").unwrap();
        let prior = Baseline::new(
            pair.clone(),
            Utc::now(),
            vec![BaselineEntry {
                path: path("stuck.mp3"),
                size: 9,
                mtime: Utc::now(),
                fingerprint: None,
            }],
        );
        let source = snapshot_of("/music", &[]);
        let dest = snapshot_of("/backup", &[("stuck.mp3", 9)]);
        let report = ExecutionReport::new(
            Utc::now(),
            Utc::now(),
            vec![OperationResult {
                operation: Operation::Delete {
                    path: path("stuck.mp3"),
                },
                outcome: OperationOutcome::Failed {
                    cause: "busy".to_string(),
                },
                bytes_written: 0,
            }],
        );

        let baseline = fold_baseline(pair, Some(prior), &source, &dest, &report, None);
        assert!(baseline.contains(&path("stuck.mp3")));
    }

    #[test]
    fn test_fold_move_relocates_baseline_entry() {
        let pair = RootPair::new("/music", "/backup").unwrap();
        let fp = melodeck_core::domain::Fingerprint::from_bytes([3; 32]);
        let prior = Baseline::new(
            pair.clone(),
            Utc::now(),
            vec![BaselineEntry {
                path: path("old.flac"),
                size: 10,
                mtime: Utc::now(),
                fingerprint: Some(fp),
            }],
        );
        let source = snapshot_of("/music", &[("new.flac", 10)]);
        let dest = snapshot_of("/backup", &[("old.flac", 10)]);
        let report = ExecutionReport::new(
            Utc::now(),
            Utc::now(),
            vec![OperationResult {
                operation: Operation::Move {
                    from: path("old.flac"),
                    to: path("new.flac"),
                    size: 10,
                    fingerprint: fp,
                },
                outcome: OperationOutcome::Applied,
                bytes_written: 0,
            }],
        );

        let baseline = fold_baseline(pair, Some(prior), &source, &dest, &report, None);
        assert!(!baseline.contains(&path("old.flac")));
        let entry = baseline.get(&path("new.flac")).unwrap();
        assert_eq!(entry.fingerprint, Some(fp));
    }

    #[test]
    fn test_fold_enriches_quietly_synced_paths_on_first_run() {
        let pair = RootPair::new("/music", "/backup").unwrap();
        let source = snapshot_of("/music", &[("same.mp3", 5)]);
        let dest = snapshot_of("/backup", &[("same.mp3", 5)]);
        let report = ExecutionReport::new(Utc::now(), Utc::now(), Vec::new());

        let baseline = fold_baseline(pair, None, &source, &dest, &report, None);
        assert!(baseline.contains(&path("same.mp3")));
    }

    #[test]
    fn test_summary_counts_both_passes() {
        let pair = RootPair::new("/music", "/backup").unwrap();
        let source = snapshot_of("/music", &[("a.mp3", 1)]);
        let dest = snapshot_of("/backup", &[]);
        let forward = ExecutionReport::new(Utc::now(), Utc::now(), vec![applied_add("a.mp3", 1)]);
        let reverse = ExecutionReport::new(Utc::now(), Utc::now(), vec![failed_add("b.mp3", 2)]);

        let summary = build_summary(
            RunId::new(),
            pair,
            Utc::now(),
            &source,
            &dest,
            0,
            &forward,
            Some(&reverse),
        );

        assert_eq!(summary.operations_total, 2);
        assert_eq!(summary.applied, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.bytes_written, 1);
        assert!(summary.outcome.is_committed());
    }
}
