//! Two-way diff engine
//!
//! Compares two snapshots by merging their path-sorted entries in one
//! sequential pass. Fingerprints are pulled through the [`Fingerprinter`]
//! port only when the cheap size+mtime comparison is inconclusive, and a
//! post-pass re-classifies same-content Add/Delete pairs as Moves so
//! renames never cost a full copy.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, instrument, warn};

use melodeck_core::domain::{
    Baseline, ChangeSet, Fingerprint, LibraryEntry, LibraryPath, Operation, ProgressEvent,
    ProgressPhase, RunContext, Snapshot, SyncError,
};
use melodeck_core::ports::Fingerprinter;

/// Returns true if two mtimes compare equal within the tolerance
///
/// FAT filesystems store mtimes in 2-second steps; a tolerance keeps a
/// library copied across filesystems from re-hashing everything.
pub(crate) fn mtimes_equal(a: DateTime<Utc>, b: DateTime<Utc>, tolerance: Duration) -> bool {
    let delta = (a - b).abs();
    let tolerance = chrono::Duration::from_std(tolerance).unwrap_or(chrono::Duration::zero());
    delta <= tolerance
}

/// How a path present on both sides compares
enum PairClass {
    /// Content is (or is assumed) identical
    Equal,
    /// Content differs; the fingerprint is attached when one was computed
    Update(Option<Fingerprint>),
}

/// Snapshot diff engine
///
/// One instance per run: the injected fingerprinter's cache is shared by
/// the classification pass, the move-detection pass, and (for three-way
/// diffs) both per-side comparisons.
pub struct DiffEngine {
    fingerprinter: Arc<dyn Fingerprinter>,
}

impl DiffEngine {
    /// Creates an engine over a fingerprinter
    pub fn new(fingerprinter: Arc<dyn Fingerprinter>) -> Self {
        Self { fingerprinter }
    }

    /// The injected fingerprinter (shared with the three-way pass)
    pub(crate) fn fingerprinter(&self) -> &Arc<dyn Fingerprinter> {
        &self.fingerprinter
    }

    /// Dispatches to [`diff`](Self::diff) or [`diff3`](Self::diff3)
    /// depending on whether a baseline is available
    pub async fn changes(
        &self,
        source: &Snapshot,
        dest: &Snapshot,
        baseline: Option<&Baseline>,
        ctx: &RunContext,
    ) -> Result<ChangeSet, SyncError> {
        match baseline {
            Some(baseline) => self.diff3(source, dest, baseline, ctx).await,
            None => self.diff(source, dest, ctx).await,
        }
    }

    /// Computes the change set that makes `dest` match `source`
    ///
    /// # Errors
    /// Only `SyncError::Cancelled` aborts the pass; per-file fingerprint
    /// failures are inconclusive and classify as conservative Updates.
    #[instrument(skip_all, fields(source = %source.root().display(), dest = %dest.root().display()))]
    pub async fn diff(
        &self,
        source: &Snapshot,
        dest: &Snapshot,
        ctx: &RunContext,
    ) -> Result<ChangeSet, SyncError> {
        let mut operations = Vec::new();
        let mut compared: u64 = 0;
        let total = (source.len() + dest.len()) as u64;

        let mut source_iter = source.iter().peekable();
        let mut dest_iter = dest.iter().peekable();

        loop {
            ctx.check_cancelled()?;

            let (s, d) = match (source_iter.peek(), dest_iter.peek()) {
                (None, None) => break,
                (Some(_), None) => {
                    let entry = source_iter.next().unwrap();
                    operations.push(add_op(entry));
                    self.report_progress(ctx, entry.path(), &mut compared, total);
                    continue;
                }
                (None, Some(_)) => {
                    let entry = dest_iter.next().unwrap();
                    operations.push(Operation::Delete {
                        path: entry.path().clone(),
                    });
                    self.report_progress(ctx, entry.path(), &mut compared, total);
                    continue;
                }
                (Some(s), Some(d)) => (*s, *d),
            };

            match s.path().cmp(d.path()) {
                std::cmp::Ordering::Less => {
                    let entry = source_iter.next().unwrap();
                    operations.push(add_op(entry));
                    self.report_progress(ctx, entry.path(), &mut compared, total);
                }
                std::cmp::Ordering::Greater => {
                    let entry = dest_iter.next().unwrap();
                    operations.push(Operation::Delete {
                        path: entry.path().clone(),
                    });
                    self.report_progress(ctx, entry.path(), &mut compared, total);
                }
                std::cmp::Ordering::Equal => {
                    let s = source_iter.next().unwrap();
                    let d = dest_iter.next().unwrap();
                    match self.classify_pair(source, dest, s, d, ctx).await? {
                        PairClass::Equal => {}
                        PairClass::Update(fingerprint) => {
                            operations.push(Operation::Update {
                                path: s.path().clone(),
                                size: s.size(),
                                fingerprint,
                            });
                        }
                    }
                    self.report_progress(ctx, s.path(), &mut compared, total);
                }
            }
        }

        let operations = self.detect_moves(source, dest, operations, ctx).await?;
        let change_set = ChangeSet::new(operations);

        let (adds, updates, deletes, moves, conflicts) = change_set.counts();
        debug!(adds, updates, deletes, moves, conflicts, "diff complete");

        Ok(change_set)
    }

    fn report_progress(&self, ctx: &RunContext, path: &LibraryPath, compared: &mut u64, total: u64) {
        *compared += 1;
        ctx.emit_progress(ProgressEvent {
            phase: ProgressPhase::Diffing,
            path: Some(path.clone()),
            bytes_done: 0,
            bytes_total: 0,
            operations_done: *compared,
            operations_total: total,
        });
    }

    /// Classifies a path present in both snapshots
    ///
    /// Size first (free), then mtime within tolerance (free), and only
    /// then content fingerprints. A fingerprint failure on either side is
    /// inconclusive and classifies as Update so real changes are never
    /// silently dropped.
    async fn classify_pair(
        &self,
        source: &Snapshot,
        dest: &Snapshot,
        s: &LibraryEntry,
        d: &LibraryEntry,
        ctx: &RunContext,
    ) -> Result<PairClass, SyncError> {
        if s.size() != d.size() {
            return Ok(PairClass::Update(None));
        }

        if mtimes_equal(s.mtime(), d.mtime(), ctx.options().mtime_tolerance) {
            return Ok(PairClass::Equal);
        }

        let source_fp = self.fingerprinter.fingerprint(source.root(), s).await;
        let dest_fp = self.fingerprinter.fingerprint(dest.root(), d).await;

        match (source_fp, dest_fp) {
            (Ok(sf), Ok(df)) if sf == df => {
                debug!(path = %s.path(), "touched but unchanged");
                Ok(PairClass::Equal)
            }
            (Ok(sf), Ok(_)) => Ok(PairClass::Update(Some(sf))),
            (Err(err), _) | (_, Err(err)) => {
                if matches!(err, SyncError::Cancelled) {
                    return Err(err);
                }
                warn!(path = %s.path(), %err, "fingerprint inconclusive, scheduling update");
                Ok(PairClass::Update(None))
            }
        }
    }

    /// Re-classifies same-content Add/Delete pairs as Moves
    ///
    /// Candidates are bucketed by size first so fingerprints are computed
    /// on demand for same-size pairs only, never for the whole set.
    pub(crate) async fn detect_moves(
        &self,
        source: &Snapshot,
        dest: &Snapshot,
        operations: Vec<Operation>,
        ctx: &RunContext,
    ) -> Result<Vec<Operation>, SyncError> {
        // Delete candidates bucketed by size.
        let mut deletes_by_size: HashMap<u64, Vec<LibraryPath>> = HashMap::new();
        for op in &operations {
            if let Operation::Delete { path } = op {
                if let Some(entry) = dest.get(path) {
                    deletes_by_size
                        .entry(entry.size())
                        .or_default()
                        .push(path.clone());
                }
            }
        }
        if deletes_by_size.is_empty() {
            return Ok(operations);
        }

        let mut moves = Vec::new();
        let mut moved_adds = Vec::new();
        let mut consumed_deletes = Vec::new();

        for op in &operations {
            ctx.check_cancelled()?;

            let Operation::Add { path, size, .. } = op else {
                continue;
            };
            let Some(candidates) = deletes_by_size.get_mut(size) else {
                continue;
            };
            let Some(source_entry) = source.get(path) else {
                continue;
            };

            let source_fp = match self.fingerprinter.fingerprint(source.root(), source_entry).await
            {
                Ok(fp) => fp,
                Err(SyncError::Cancelled) => return Err(SyncError::Cancelled),
                Err(err) => {
                    warn!(path = %path, %err, "skipping move candidate");
                    continue;
                }
            };

            let mut matched = None;
            for (idx, candidate) in candidates.iter().enumerate() {
                if consumed_deletes.contains(candidate) {
                    continue;
                }
                let Some(dest_entry) = dest.get(candidate) else {
                    continue;
                };
                match self.fingerprinter.fingerprint(dest.root(), dest_entry).await {
                    Ok(fp) if fp == source_fp => {
                        matched = Some((idx, candidate.clone()));
                        break;
                    }
                    Ok(_) => {}
                    Err(SyncError::Cancelled) => return Err(SyncError::Cancelled),
                    Err(err) => {
                        warn!(path = %candidate, %err, "skipping move candidate");
                    }
                }
            }

            if let Some((idx, from)) = matched {
                debug!(from = %from, to = %path, "re-classified add+delete as move");
                candidates.remove(idx);
                consumed_deletes.push(from.clone());
                moved_adds.push(path.clone());
                moves.push(Operation::Move {
                    from,
                    to: path.clone(),
                    size: *size,
                    fingerprint: source_fp,
                });
            }
        }

        if moves.is_empty() {
            return Ok(operations);
        }

        let mut result: Vec<Operation> = operations
            .into_iter()
            .filter(|op| match op {
                Operation::Add { path, .. } => !moved_adds.contains(path),
                Operation::Delete { path } => !consumed_deletes.contains(path),
                _ => true,
            })
            .collect();
        result.extend(moves);
        Ok(result)
    }
}

fn add_op(entry: &LibraryEntry) -> Operation {
    Operation::Add {
        path: entry.path().clone(),
        size: entry.size(),
        fingerprint: entry.fingerprint().copied(),
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::Path;

    use tempfile::TempDir;

    use melodeck_core::domain::SyncOptions;

    use crate::fingerprint::FingerprintService;

    use super::*;

    /// Builds a snapshot over real files with controlled mtimes
    fn snapshot(root: &Path, files: &[(&str, &[u8], i64)]) -> Snapshot {
        let mut entries = Vec::new();
        for (name, content, mtime_secs) in files {
            let abs = root.join(name);
            if let Some(parent) = abs.parent() {
                fs::create_dir_all(parent).unwrap();
            }
            fs::write(&abs, content).unwrap();
            entries.push(LibraryEntry::new(
                LibraryPath::new(*name).unwrap(),
                content.len() as u64,
                DateTime::from_timestamp(*mtime_secs, 0).unwrap(),
            ));
        }
        Snapshot::from_entries(root, entries)
    }

    fn engine() -> (Arc<FingerprintService>, DiffEngine) {
        let service = Arc::new(FingerprintService::new());
        let engine = DiffEngine::new(Arc::clone(&service) as Arc<dyn Fingerprinter>);
        (service, engine)
    }

    fn kinds(cs: &ChangeSet) -> Vec<(&'static str, String)> {
        cs.iter()
            .map(|op| (op.kind(), op.path().as_str().to_string()))
            .collect()
    }

    #[tokio::test]
    async fn test_source_only_is_add_dest_only_is_delete() {
        let src_dir = TempDir::new().unwrap();
        let dst_dir = TempDir::new().unwrap();
        let source = snapshot(src_dir.path(), &[("new.mp3", b"abc", 100)]);
        let dest = snapshot(dst_dir.path(), &[("old.mp3", b"defg", 100)]);

        let (_, engine) = engine();
        let cs = engine.diff(&source, &dest, &RunContext::default()).await.unwrap();

        assert_eq!(
            kinds(&cs),
            vec![
                ("add", "new.mp3".to_string()),
                ("delete", "old.mp3".to_string())
            ]
        );
    }

    #[tokio::test]
    async fn test_size_difference_updates_without_hashing() {
        let src_dir = TempDir::new().unwrap();
        let dst_dir = TempDir::new().unwrap();
        let source = snapshot(src_dir.path(), &[("t.mp3", b"longer content", 100)]);
        let dest = snapshot(dst_dir.path(), &[("t.mp3", b"short", 100)]);

        let (service, engine) = engine();
        let cs = engine.diff(&source, &dest, &RunContext::default()).await.unwrap();

        assert_eq!(kinds(&cs), vec![("update", "t.mp3".to_string())]);
        assert_eq!(service.computations(), 0);
    }

    #[tokio::test]
    async fn test_equal_size_and_mtime_never_hashes() {
        let src_dir = TempDir::new().unwrap();
        let dst_dir = TempDir::new().unwrap();
        let source = snapshot(src_dir.path(), &[("t.mp3", b"same", 100)]);
        let dest = snapshot(dst_dir.path(), &[("t.mp3", b"same", 100)]);

        let (service, engine) = engine();
        let cs = engine.diff(&source, &dest, &RunContext::default()).await.unwrap();

        assert!(cs.is_empty());
        assert_eq!(service.computations(), 0);
    }

    #[tokio::test]
    async fn test_mtime_within_tolerance_is_equal() {
        let src_dir = TempDir::new().unwrap();
        let dst_dir = TempDir::new().unwrap();
        // One second apart; default tolerance is two seconds.
        let source = snapshot(src_dir.path(), &[("t.mp3", b"same", 100)]);
        let dest = snapshot(dst_dir.path(), &[("t.mp3", b"same", 101)]);

        let (service, engine) = engine();
        let cs = engine.diff(&source, &dest, &RunContext::default()).await.unwrap();

        assert!(cs.is_empty());
        assert_eq!(service.computations(), 0);
    }

    #[tokio::test]
    async fn test_touched_but_unchanged_hashes_and_stays_equal() {
        let src_dir = TempDir::new().unwrap();
        let dst_dir = TempDir::new().unwrap();
        let source = snapshot(src_dir.path(), &[("t.mp3", b"same", 100)]);
        let dest = snapshot(dst_dir.path(), &[("t.mp3", b"same", 500)]);

        let (service, engine) = engine();
        let cs = engine.diff(&source, &dest, &RunContext::default()).await.unwrap();

        assert!(cs.is_empty());
        assert_eq!(service.computations(), 2);
    }

    #[tokio::test]
    async fn test_same_size_different_content_updates() {
        let src_dir = TempDir::new().unwrap();
        let dst_dir = TempDir::new().unwrap();
        let source = snapshot(src_dir.path(), &[("t.mp3", b"aaaa", 100)]);
        let dest = snapshot(dst_dir.path(), &[("t.mp3", b"bbbb", 500)]);

        let (_, engine) = engine();
        let cs = engine.diff(&source, &dest, &RunContext::default()).await.unwrap();

        assert_eq!(kinds(&cs), vec![("update", "t.mp3".to_string())]);
        // The computed source fingerprint rides along on the operation.
        let Some(Operation::Update { fingerprint, .. }) = cs.iter().next() else {
            panic!("expected update");
        };
        assert!(fingerprint.is_some());
    }

    #[tokio::test]
    async fn test_rename_becomes_single_move() {
        let src_dir = TempDir::new().unwrap();
        let dst_dir = TempDir::new().unwrap();
        let body = vec![7u8; 1024];
        let source = snapshot(src_dir.path(), &[("renamed.flac", body.as_slice(), 100)]);
        let dest = snapshot(dst_dir.path(), &[("song.flac", body.as_slice(), 100)]);

        let (_, engine) = engine();
        let cs = engine.diff(&source, &dest, &RunContext::default()).await.unwrap();

        assert_eq!(cs.len(), 1);
        let Operation::Move { from, to, size, .. } = cs.iter().next().unwrap() else {
            panic!("expected a move, got {:?}", cs);
        };
        assert_eq!(from.as_str(), "song.flac");
        assert_eq!(to.as_str(), "renamed.flac");
        assert_eq!(*size, 1024);
    }

    #[tokio::test]
    async fn test_same_size_different_content_is_not_a_move() {
        let src_dir = TempDir::new().unwrap();
        let dst_dir = TempDir::new().unwrap();
        let source = snapshot(src_dir.path(), &[("new.flac", b"contentA", 100)]);
        let dest = snapshot(dst_dir.path(), &[("old.flac", b"contentB", 100)]);

        let (_, engine) = engine();
        let cs = engine.diff(&source, &dest, &RunContext::default()).await.unwrap();

        assert_eq!(
            kinds(&cs),
            vec![
                ("add", "new.flac".to_string()),
                ("delete", "old.flac".to_string())
            ]
        );
    }

    #[tokio::test]
    async fn test_move_pass_hashes_candidates_only() {
        let src_dir = TempDir::new().unwrap();
        let dst_dir = TempDir::new().unwrap();
        let body = vec![1u8; 64];
        let source = snapshot(
            src_dir.path(),
            &[("moved.mp3", body.as_slice(), 100), ("unrelated.mp3", b"xyz", 100)],
        );
        let dest = snapshot(
            dst_dir.path(),
            &[("original.mp3", body.as_slice(), 100), ("unrelated.mp3", b"xyz", 100)],
        );

        let (service, engine) = engine();
        let cs = engine.diff(&source, &dest, &RunContext::default()).await.unwrap();

        assert_eq!(cs.counts().3, 1);
        // Only the add/delete pair was fingerprinted; the unchanged path
        // and the non-candidates were not.
        assert_eq!(service.computations(), 2);
    }

    #[tokio::test]
    async fn test_cancellation_mid_diff() {
        let src_dir = TempDir::new().unwrap();
        let dst_dir = TempDir::new().unwrap();
        let source = snapshot(src_dir.path(), &[("a.mp3", b"a", 100)]);
        let dest = snapshot(dst_dir.path(), &[("a.mp3", b"a", 100)]);

        let ctx = RunContext::new(SyncOptions::default());
        ctx.cancel();

        let (_, engine) = engine();
        let err = engine.diff(&source, &dest, &ctx).await.unwrap_err();
        assert!(matches!(err, SyncError::Cancelled));
    }
}
