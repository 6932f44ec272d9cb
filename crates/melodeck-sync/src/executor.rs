//! Change-set execution engine
//!
//! Applies a [`ChangeSet`] to a destination root with crash-safe writes:
//! every copy lands in a temporary file next to its target and is renamed
//! into place atomically, so the final path never observably contains a
//! partial write. Add/Update/Move operations all run before any Delete,
//! so content is never lost if a later step fails.
//!
//! Failure semantics are best-effort: a transient-looking I/O error is
//! retried with doubling backoff, a permanent one marks that operation
//! Failed and execution continues. Only a vanished destination root
//! aborts the run.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, instrument, warn};

use melodeck_core::domain::{
    ChangeSet, ExecutionReport, Operation, OperationOutcome, OperationResult, ProgressEvent,
    ProgressPhase, RunContext, SyncError, SyncOptions, TEMP_FILE_SUFFIX,
};

/// Applies change sets produced by diffing `source_root` against
/// `dest_root`
pub struct Executor {
    source_root: PathBuf,
    dest_root: PathBuf,
}

/// Shared per-phase progress counters
#[derive(Default)]
struct Progress {
    ops_done: AtomicU64,
    bytes_done: AtomicU64,
}

impl Executor {
    /// Creates an executor for one root pair
    pub fn new(source_root: impl Into<PathBuf>, dest_root: impl Into<PathBuf>) -> Self {
        Self {
            source_root: source_root.into(),
            dest_root: dest_root.into(),
        }
    }

    /// Applies the change set and reports every operation's outcome
    ///
    /// Consumes the change set: it is applied exactly once.
    ///
    /// # Errors
    /// - `SyncError::RootUnreadable` if the destination root cannot be
    ///   created or disappears mid-run (fatal)
    ///
    /// Cancellation does not error: operations not yet dispatched are
    /// reported Skipped and the report is returned for the orchestrator
    /// to act on.
    #[instrument(skip_all, fields(dest = %self.dest_root.display(), operations = change_set.len()))]
    pub async fn execute(
        &self,
        change_set: ChangeSet,
        ctx: &RunContext,
    ) -> Result<ExecutionReport, SyncError> {
        let started_at = Utc::now();
        let options = ctx.options().clone();

        let operations = change_set.into_operations();
        let total_ops = operations.iter().filter(|op| !op.is_conflict()).count() as u64;
        let total_bytes: u64 = operations.iter().map(Operation::copy_bytes).sum();
        let progress = Arc::new(Progress::default());

        let mut slots: Vec<Option<OperationResult>> = vec![None; operations.len()];

        // Conflicts are never executed, dry runs never touch disk.
        for (idx, op) in operations.iter().enumerate() {
            if op.is_conflict() {
                slots[idx] = Some(skip(op, "conflict", ctx));
            } else if options.dry_run {
                slots[idx] = Some(skip(op, "dry run", ctx));
            }
        }

        if !options.dry_run {
            tokio::fs::create_dir_all(&self.dest_root)
                .await
                .map_err(|source| SyncError::RootUnreadable {
                    root: self.dest_root.clone(),
                    source,
                })?;

            self.run_copy_phase(
                &operations,
                &mut slots,
                &options,
                ctx,
                &progress,
                total_ops,
                total_bytes,
            )
            .await?;

            self.run_delete_phase(
                &operations,
                &mut slots,
                &options,
                ctx,
                &progress,
                total_ops,
                total_bytes,
            )
            .await;
        }

        let results = slots
            .into_iter()
            .map(|slot| slot.expect("every operation received an outcome"))
            .collect::<Vec<_>>();

        let report = ExecutionReport::new(started_at, Utc::now(), results);
        debug!(
            applied = report.applied_count(),
            failed = report.failed_count(),
            skipped = report.skipped_count(),
            bytes = report.bytes_written(),
            "execution finished"
        );
        Ok(report)
    }

    /// Dispatches Add/Update/Move operations over the bounded worker pool
    ///
    /// Copy-phase operations always target distinct paths (the diff emits
    /// one operation per path and move sources are consumed deletes), so
    /// concurrency is limited only by the semaphore. The delete phase
    /// starts after this one fully drains.
    #[allow(clippy::too_many_arguments)]
    async fn run_copy_phase(
        &self,
        operations: &[Operation],
        slots: &mut [Option<OperationResult>],
        options: &SyncOptions,
        ctx: &RunContext,
        progress: &Arc<Progress>,
        total_ops: u64,
        total_bytes: u64,
    ) -> Result<(), SyncError> {
        let semaphore = Arc::new(Semaphore::new(options.concurrency.max(1)));
        let mut join_set: JoinSet<(usize, Result<u64, String>)> = JoinSet::new();

        for (idx, op) in operations.iter().enumerate() {
            if slots[idx].is_some() || !op.is_copy_phase() {
                continue;
            }
            // Cancellation is checked between operations; in-flight copies
            // finish and their temp files are cleaned up by the apply path.
            if ctx.is_cancelled() {
                slots[idx] = Some(skip(op, "cancelled", ctx));
                continue;
            }

            let semaphore = Arc::clone(&semaphore);
            let op = op.clone();
            let source_root = self.source_root.clone();
            let dest_root = self.dest_root.clone();
            let options = options.clone();
            join_set.spawn(async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(err) => return (idx, Err(format!("worker pool closed: {err}"))),
                };
                let result = apply_with_retry(&op, &source_root, &dest_root, &options).await;
                (idx, result)
            });
        }

        while let Some(joined) = join_set.join_next().await {
            let (idx, result) = match joined {
                Ok(pair) => pair,
                Err(err) => {
                    // A panicked worker loses its slot index; surface it
                    // loudly but keep the run alive.
                    warn!(%err, "execution worker aborted");
                    continue;
                }
            };
            let op = &operations[idx];
            slots[idx] = Some(self.finish_op(op, result, ctx, progress, total_ops, total_bytes));
        }

        // A panicked worker never reported back; mark its slot failed so
        // the report stays complete and the baseline skips the path.
        for (idx, op) in operations.iter().enumerate() {
            if op.is_copy_phase() && slots[idx].is_none() {
                slots[idx] = Some(self.finish_op(
                    op,
                    Err("execution worker aborted".to_string()),
                    ctx,
                    progress,
                    total_ops,
                    total_bytes,
                ));
            }
        }

        // Permanent failures are tolerated per-operation, but a vanished
        // destination root is fatal for the whole run.
        if tokio::fs::metadata(&self.dest_root).await.is_err() {
            let source = std::io::Error::new(
                std::io::ErrorKind::Other,
                "destination root disappeared during execution",
            );
            return Err(SyncError::RootUnreadable {
                root: self.dest_root.clone(),
                source,
            });
        }

        Ok(())
    }

    /// Applies Delete operations, sequentially, after the copy phase
    #[allow(clippy::too_many_arguments)]
    async fn run_delete_phase(
        &self,
        operations: &[Operation],
        slots: &mut [Option<OperationResult>],
        options: &SyncOptions,
        ctx: &RunContext,
        progress: &Arc<Progress>,
        total_ops: u64,
        total_bytes: u64,
    ) {
        for (idx, op) in operations.iter().enumerate() {
            if slots[idx].is_some() || !matches!(op, Operation::Delete { .. }) {
                continue;
            }
            if ctx.is_cancelled() {
                slots[idx] = Some(skip(op, "cancelled", ctx));
                continue;
            }

            let result = apply_with_retry(op, &self.source_root, &self.dest_root, options).await;
            slots[idx] = Some(self.finish_op(op, result, ctx, progress, total_ops, total_bytes));
        }
    }

    /// Converts an apply result into an outcome, updating metrics and
    /// progress
    fn finish_op(
        &self,
        op: &Operation,
        result: Result<u64, String>,
        ctx: &RunContext,
        progress: &Progress,
        total_ops: u64,
        total_bytes: u64,
    ) -> OperationResult {
        let outcome = match &result {
            Ok(bytes) => {
                ctx.metrics().record_applied();
                ctx.metrics().record_bytes_written(*bytes);
                OperationOutcome::Applied
            }
            Err(cause) => {
                warn!(path = %op.path(), %cause, "operation failed permanently");
                ctx.metrics().record_failed();
                OperationOutcome::Failed {
                    cause: cause.clone(),
                }
            }
        };

        let bytes_written = result.unwrap_or(0);
        let ops_done = progress.ops_done.fetch_add(1, Ordering::Relaxed) + 1;
        let bytes_done = progress.bytes_done.fetch_add(bytes_written, Ordering::Relaxed)
            + bytes_written;
        ctx.emit_progress(ProgressEvent {
            phase: ProgressPhase::Executing,
            path: Some(op.path().clone()),
            bytes_done,
            bytes_total: total_bytes,
            operations_done: ops_done,
            operations_total: total_ops,
        });

        OperationResult {
            operation: op.clone(),
            outcome,
            bytes_written,
        }
    }
}

/// Builds a Skipped result and records it
fn skip(op: &Operation, reason: &str, ctx: &RunContext) -> OperationResult {
    ctx.metrics().record_skipped();
    OperationResult {
        operation: op.clone(),
        outcome: OperationOutcome::Skipped {
            reason: reason.to_string(),
        },
        bytes_written: 0,
    }
}

// ============================================================================
// Apply primitives
// ============================================================================

/// Retries transient-looking failures with doubling backoff
async fn apply_with_retry(
    op: &Operation,
    source_root: &Path,
    dest_root: &Path,
    options: &SyncOptions,
) -> Result<u64, String> {
    let mut attempt: u32 = 0;
    loop {
        match apply_once(op, source_root, dest_root, options.durable).await {
            Ok(bytes) => return Ok(bytes),
            Err(err) if attempt < options.retry_limit && is_transient_io(&err) => {
                let delay = options.retry_base_delay * 2u32.saturating_pow(attempt);
                warn!(
                    path = %op.path(),
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    %err,
                    "transient failure, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err.to_string()),
        }
    }
}

/// Classifies I/O errors worth retrying
///
/// Missing files and permission problems don't heal by waiting; busy or
/// interrupted conditions might.
fn is_transient_io(err: &std::io::Error) -> bool {
    use std::io::ErrorKind::*;
    matches!(err.kind(), Interrupted | TimedOut | WouldBlock | UnexpectedEof)
}

/// Applies one operation once
async fn apply_once(
    op: &Operation,
    source_root: &Path,
    dest_root: &Path,
    durable: bool,
) -> std::io::Result<u64> {
    match op {
        Operation::Add { path, .. } | Operation::Update { path, .. } => {
            let source = path.resolve(source_root);
            let dest = path.resolve(dest_root);
            copy_into_place(&source, &dest, durable).await
        }
        Operation::Move { from, to, .. } => {
            let from = from.resolve(dest_root);
            let to = to.resolve(dest_root);
            move_into_place(&from, &to, durable).await
        }
        Operation::Delete { path } => {
            let dest = path.resolve(dest_root);
            match tokio::fs::remove_file(&dest).await {
                Ok(()) => Ok(0),
                // Already gone: the desired end state holds.
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(0),
                Err(err) => Err(err),
            }
        }
        Operation::Conflict { .. } => unreachable!("conflicts are skipped before dispatch"),
    }
}

/// Derives the temporary path next to `dest` (same directory, so the
/// rename stays on one filesystem and is atomic)
fn temp_path(dest: &Path) -> PathBuf {
    let mut os = dest.as_os_str().to_owned();
    os.push(TEMP_FILE_SUFFIX);
    PathBuf::from(os)
}

/// Copies `source` over `dest` via temp file + atomic rename
///
/// The source's mtime is carried over so an unchanged file stays cheap to
/// compare on the next run. On any failure the temp file is removed; the
/// final path is either the old content or the complete new content,
/// never a partial write.
async fn copy_into_place(source: &Path, dest: &Path, durable: bool) -> std::io::Result<u64> {
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let tmp = temp_path(dest);
    let result = async {
        let bytes = tokio::fs::copy(source, &tmp).await?;

        if let Ok(meta) = tokio::fs::metadata(source).await {
            if let Ok(mtime) = meta.modified() {
                preserve_mtime(&tmp, mtime);
            }
        }

        if durable {
            let file = tokio::fs::OpenOptions::new().write(true).open(&tmp).await?;
            file.sync_all().await?;
        }

        tokio::fs::rename(&tmp, dest).await?;
        Ok(bytes)
    }
    .await;

    if result.is_err() {
        let _ = tokio::fs::remove_file(&tmp).await;
    }
    result
}

/// Best-effort mtime carry-over onto the temp file
fn preserve_mtime(path: &Path, mtime: std::time::SystemTime) {
    let _ = std::fs::OpenOptions::new()
        .write(true)
        .open(path)
        .and_then(|file| file.set_modified(mtime));
}

/// Renames within the destination, falling back to copy+delete when the
/// rename fails (cross-device moves)
async fn move_into_place(from: &Path, to: &Path, durable: bool) -> std::io::Result<u64> {
    if let Some(parent) = to.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    match tokio::fs::rename(from, to).await {
        Ok(()) => Ok(0),
        Err(rename_err) => {
            debug!(%rename_err, "rename failed, falling back to copy");
            copy_into_place(from, to, durable).await?;
            tokio::fs::remove_file(from).await?;
            Ok(0)
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
