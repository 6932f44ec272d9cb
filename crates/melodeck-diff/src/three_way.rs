//! Three-way diff against a remembered baseline
//!
//! Each side's status is derived against the baseline independently, by
//! the same size+mtime+lazy-fingerprint rule as the two-way pass. The
//! combination guarantees no silent overwrite of independently modified
//! content: divergence becomes a [`Operation::Conflict`], surfaced to the
//! caller and excluded from execution.
//!
//! The produced change set targets the destination. Destination-only
//! changes are deliberately no-ops here; a bidirectional run performs a
//! second, role-swapped pass (see the orchestrator) rather than mixing
//! two write directions into one change set.

use tracing::{debug, instrument, warn};

use melodeck_core::domain::{
    Baseline, BaselineEntry, ChangeSet, Fingerprint, LibraryEntry, LibraryPath, Operation,
    ProgressEvent, ProgressPhase, RunContext, Snapshot, SyncError,
};

use crate::engine::{mtimes_equal, DiffEngine};

/// One side's relation to the baseline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SideStatus {
    /// Baseline and side agree (or the path exists in neither)
    Unchanged,
    /// The side's content differs from the baseline
    Changed,
    /// The path is new on this side (baseline never had it)
    Added,
    /// The baseline had the path; this side no longer does
    Deleted,
}

impl DiffEngine {
    /// Computes the change set for `source` vs `dest` against `baseline`
    ///
    /// # Errors
    /// Only `SyncError::Cancelled` aborts the pass; fingerprint failures
    /// degrade to conservative statuses per side.
    #[instrument(skip_all, fields(source = %source.root().display(), dest = %dest.root().display()))]
    pub async fn diff3(
        &self,
        source: &Snapshot,
        dest: &Snapshot,
        baseline: &Baseline,
        ctx: &RunContext,
    ) -> Result<ChangeSet, SyncError> {
        // Union of every path any of the three states knows about,
        // already ordered.
        let mut paths: std::collections::BTreeSet<LibraryPath> = std::collections::BTreeSet::new();
        paths.extend(source.paths().cloned());
        paths.extend(dest.paths().cloned());
        paths.extend(baseline.iter().map(|e| e.path.clone()));

        let total = paths.len() as u64;
        let mut compared: u64 = 0;
        let mut operations = Vec::new();

        for path in &paths {
            ctx.check_cancelled()?;
            compared += 1;
            ctx.emit_progress(ProgressEvent {
                phase: ProgressPhase::Diffing,
                path: Some(path.clone()),
                bytes_done: 0,
                bytes_total: 0,
                operations_done: compared,
                operations_total: total,
            });

            let base = baseline.get(path);
            let source_entry = source.get(path);
            let dest_entry = dest.get(path);

            let source_status = self
                .side_status(source, source_entry, base, ctx)
                .await?;
            let dest_status = self.side_status(dest, dest_entry, base, ctx).await?;

            if let Some(op) = self
                .combine(path, source, dest, source_entry, dest_entry, source_status, dest_status)
                .await?
            {
                operations.push(op);
            }
        }

        let operations = self.detect_moves(source, dest, operations, ctx).await?;
        let change_set = ChangeSet::new(operations);

        let (adds, updates, deletes, moves, conflicts) = change_set.counts();
        debug!(adds, updates, deletes, moves, conflicts, "three-way diff complete");

        Ok(change_set)
    }

    /// Derives one side's status relative to the baseline
    ///
    /// Size first, then mtime within tolerance, then the side's
    /// fingerprint against the baseline's recorded one. A missing
    /// baseline fingerprint or a hash failure is inconclusive and reads
    /// as Changed so a real change is never masked.
    async fn side_status(
        &self,
        snapshot: &Snapshot,
        entry: Option<&LibraryEntry>,
        base: Option<&BaselineEntry>,
        ctx: &RunContext,
    ) -> Result<SideStatus, SyncError> {
        match (base, entry) {
            (None, None) => Ok(SideStatus::Unchanged),
            (None, Some(_)) => Ok(SideStatus::Added),
            (Some(_), None) => Ok(SideStatus::Deleted),
            (Some(base), Some(entry)) => {
                if entry.size() != base.size {
                    return Ok(SideStatus::Changed);
                }
                if mtimes_equal(entry.mtime(), base.mtime, ctx.options().mtime_tolerance) {
                    return Ok(SideStatus::Unchanged);
                }
                let Some(base_fp) = base.fingerprint else {
                    return Ok(SideStatus::Changed);
                };
                match self.fingerprinter().fingerprint(snapshot.root(), entry).await {
                    Ok(fp) if fp == base_fp => Ok(SideStatus::Unchanged),
                    Ok(_) => Ok(SideStatus::Changed),
                    Err(SyncError::Cancelled) => Err(SyncError::Cancelled),
                    Err(err) => {
                        warn!(path = %entry.path(), %err, "fingerprint inconclusive, treating as changed");
                        Ok(SideStatus::Changed)
                    }
                }
            }
        }
    }

    /// Applies the combination table for one path
    #[allow(clippy::too_many_arguments)]
    async fn combine(
        &self,
        path: &LibraryPath,
        source: &Snapshot,
        dest: &Snapshot,
        source_entry: Option<&LibraryEntry>,
        dest_entry: Option<&LibraryEntry>,
        source_status: SideStatus,
        dest_status: SideStatus,
    ) -> Result<Option<Operation>, SyncError> {
        use SideStatus::*;

        let op = match (source_status, dest_status) {
            // Nothing happened, or both sides already agree with the
            // baseline's absence of the path.
            (Unchanged, Unchanged) | (Deleted, Deleted) => None,

            // Source-side change with a quiet destination: propagate.
            (Added, Unchanged) => source_entry.map(|e| Operation::Add {
                path: e.path().clone(),
                size: e.size(),
                fingerprint: e.fingerprint().copied(),
            }),
            (Changed, Unchanged) => source_entry.map(|e| Operation::Update {
                path: e.path().clone(),
                size: e.size(),
                fingerprint: None,
            }),
            (Deleted, Unchanged) => Some(Operation::Delete { path: path.clone() }),

            // Destination-side change with a quiet source: no-op in this
            // pass; the role-swapped pass propagates it when the run is
            // bidirectional.
            (Unchanged, Added) | (Unchanged, Changed) | (Unchanged, Deleted) => None,

            // Both sides touched the path. Converged content is a no-op;
            // anything else is a conflict, never auto-resolved.
            (Changed | Added, Changed | Added) => {
                self.converged_or_conflict(path, source, dest, source_entry, dest_entry)
                    .await?
            }

            // One side edited what the other deleted.
            (Deleted, Changed | Added) => Some(Operation::Conflict {
                path: path.clone(),
                source_fingerprint: None,
                dest_fingerprint: self.try_fingerprint(dest, dest_entry).await?,
            }),
            (Changed | Added, Deleted) => Some(Operation::Conflict {
                path: path.clone(),
                source_fingerprint: self.try_fingerprint(source, source_entry).await?,
                dest_fingerprint: None,
            }),
        };

        Ok(op)
    }

    /// Resolves a both-sides-changed path: equal resulting fingerprints
    /// converge to a no-op, anything else conflicts
    ///
    /// Convergence does not rewrite mtime-only metadata; the next run's
    /// size+mtime check will re-fingerprint once and then the cache
    /// carries it.
    async fn converged_or_conflict(
        &self,
        path: &LibraryPath,
        source: &Snapshot,
        dest: &Snapshot,
        source_entry: Option<&LibraryEntry>,
        dest_entry: Option<&LibraryEntry>,
    ) -> Result<Option<Operation>, SyncError> {
        let source_fp = self.try_fingerprint(source, source_entry).await?;
        let dest_fp = self.try_fingerprint(dest, dest_entry).await?;

        match (source_fp, dest_fp) {
            (Some(sf), Some(df)) if sf == df => {
                debug!(path = %path, "both sides converged");
                Ok(None)
            }
            (source_fingerprint, dest_fingerprint) => Ok(Some(Operation::Conflict {
                path: path.clone(),
                source_fingerprint,
                dest_fingerprint,
            })),
        }
    }

    /// Fingerprints an entry, degrading hash failures to `None`
    async fn try_fingerprint(
        &self,
        snapshot: &Snapshot,
        entry: Option<&LibraryEntry>,
    ) -> Result<Option<Fingerprint>, SyncError> {
        let Some(entry) = entry else {
            return Ok(None);
        };
        match self.fingerprinter().fingerprint(snapshot.root(), entry).await {
            Ok(fp) => Ok(Some(fp)),
            Err(SyncError::Cancelled) => Err(SyncError::Cancelled),
            Err(err) => {
                warn!(path = %entry.path(), %err, "fingerprint unavailable");
                Ok(None)
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::Path;
    use std::sync::Arc;

    use chrono::{DateTime, Utc};
    use tempfile::TempDir;

    use melodeck_core::domain::RootPair;
    use melodeck_core::ports::Fingerprinter;

    use crate::fingerprint::FingerprintService;

    use super::*;

    fn ts(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

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
                ts(*mtime_secs),
            ));
        }
        Snapshot::from_entries(root, entries)
    }

    fn baseline_with(
        pair: &RootPair,
        entries: &[(&str, u64, i64, Option<Fingerprint>)],
    ) -> Baseline {
        Baseline::new(
            pair.clone(),
            Utc::now(),
            entries
                .iter()
                .map(|(name, size, mtime_secs, fp)| BaselineEntry {
                    path: LibraryPath::new(*name).unwrap(),
                    size: *size,
                    mtime: ts(*mtime_secs),
                    fingerprint: *fp,
                })
                .collect(),
        )
    }

    fn engine() -> (Arc<FingerprintService>, DiffEngine) {
        let service = Arc::new(FingerprintService::new());
        let engine = DiffEngine::new(Arc::clone(&service) as Arc<dyn Fingerprinter>);
        (service, engine)
    }

    struct Roots {
        src: TempDir,
        dst: TempDir,
        pair: RootPair,
    }

    fn roots() -> Roots {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        let pair = RootPair::new(src.path(), dst.path()).unwrap();
        Roots { src, dst, pair }
    }

    #[tokio::test]
    async fn test_independent_edits_conflict() {
        let r = roots();
        // Baseline content H0; source re-tagged to H1; dest re-tagged to H2.
        let source = snapshot(r.src.path(), &[("track.mp3", b"version-one!", 200)]);
        let dest = snapshot(r.dst.path(), &[("track.mp3", b"version-two!", 300)]);
        let baseline = baseline_with(
            &r.pair,
            &[("track.mp3", 12, 100, Some(Fingerprint::from_bytes([9; 32])))],
        );

        let (_, engine) = engine();
        let cs = engine
            .diff3(&source, &dest, &baseline, &RunContext::default())
            .await
            .unwrap();

        assert_eq!(cs.len(), 1);
        let Some(Operation::Conflict {
            path,
            source_fingerprint,
            dest_fingerprint,
        }) = cs.iter().next()
        else {
            panic!("expected conflict, got {:?}", cs);
        };
        assert_eq!(path.as_str(), "track.mp3");
        assert!(source_fingerprint.is_some());
        assert!(dest_fingerprint.is_some());
        assert_ne!(source_fingerprint, dest_fingerprint);
    }

    #[tokio::test]
    async fn test_source_change_propagates() {
        let r = roots();
        let source = snapshot(r.src.path(), &[("a.mp3", b"new version bytes", 200)]);
        let dest = snapshot(r.dst.path(), &[("a.mp3", b"old", 100)]);
        let baseline = baseline_with(&r.pair, &[("a.mp3", 3, 100, None)]);

        let (_, engine) = engine();
        let cs = engine
            .diff3(&source, &dest, &baseline, &RunContext::default())
            .await
            .unwrap();

        assert_eq!(cs.len(), 1);
        assert_eq!(cs.iter().next().unwrap().kind(), "update");
    }

    #[tokio::test]
    async fn test_dest_change_is_noop_forward() {
        let r = roots();
        let source = snapshot(r.src.path(), &[("a.mp3", b"old", 100)]);
        let dest = snapshot(r.dst.path(), &[("a.mp3", b"dest edited bytes", 200)]);
        let baseline = baseline_with(&r.pair, &[("a.mp3", 3, 100, None)]);

        let (_, engine) = engine();
        let cs = engine
            .diff3(&source, &dest, &baseline, &RunContext::default())
            .await
            .unwrap();

        assert!(cs.is_empty());
    }

    #[tokio::test]
    async fn test_source_delete_propagates() {
        let r = roots();
        let source = Snapshot::empty(r.src.path());
        let dest = snapshot(r.dst.path(), &[("gone.mp3", b"bye", 100)]);
        let baseline = baseline_with(&r.pair, &[("gone.mp3", 3, 100, None)]);

        let (_, engine) = engine();
        let cs = engine
            .diff3(&source, &dest, &baseline, &RunContext::default())
            .await
            .unwrap();

        assert_eq!(cs.len(), 1);
        assert_eq!(cs.iter().next().unwrap().kind(), "delete");
    }

    #[tokio::test]
    async fn test_delete_vs_edit_conflicts() {
        let r = roots();
        let source = Snapshot::empty(r.src.path());
        let dest = snapshot(r.dst.path(), &[("contested.mp3", b"dest edit bytes!!", 200)]);
        let baseline = baseline_with(&r.pair, &[("contested.mp3", 3, 100, None)]);

        let (_, engine) = engine();
        let cs = engine
            .diff3(&source, &dest, &baseline, &RunContext::default())
            .await
            .unwrap();

        assert_eq!(cs.conflicts().count(), 1);
    }

    #[tokio::test]
    async fn test_both_deleted_is_noop() {
        let r = roots();
        let source = Snapshot::empty(r.src.path());
        let dest = Snapshot::empty(r.dst.path());
        let baseline = baseline_with(&r.pair, &[("gone.mp3", 3, 100, None)]);

        let (service, engine) = engine();
        let cs = engine
            .diff3(&source, &dest, &baseline, &RunContext::default())
            .await
            .unwrap();

        assert!(cs.is_empty());
        assert_eq!(service.computations(), 0);
    }

    #[tokio::test]
    async fn test_convergent_edits_are_noop() {
        let r = roots();
        let source = snapshot(r.src.path(), &[("t.mp3", b"same new version", 200)]);
        let dest = snapshot(r.dst.path(), &[("t.mp3", b"same new version", 300)]);
        let baseline = baseline_with(&r.pair, &[("t.mp3", 3, 100, None)]);

        let (_, engine) = engine();
        let cs = engine
            .diff3(&source, &dest, &baseline, &RunContext::default())
            .await
            .unwrap();

        assert!(cs.is_empty());
    }

    #[tokio::test]
    async fn test_new_on_source_only_adds() {
        let r = roots();
        let source = snapshot(r.src.path(), &[("fresh.flac", b"brand new", 200)]);
        let dest = Snapshot::empty(r.dst.path());
        let baseline = baseline_with(&r.pair, &[]);

        let (service, engine) = engine();
        let cs = engine
            .diff3(&source, &dest, &baseline, &RunContext::default())
            .await
            .unwrap();

        assert_eq!(cs.len(), 1);
        assert_eq!(cs.iter().next().unwrap().kind(), "add");
        assert_eq!(service.computations(), 0);
    }

    #[tokio::test]
    async fn test_new_on_both_sides_same_content_is_noop() {
        let r = roots();
        let source = snapshot(r.src.path(), &[("dup.mp3", b"ripped twice", 200)]);
        let dest = snapshot(r.dst.path(), &[("dup.mp3", b"ripped twice", 300)]);
        let baseline = baseline_with(&r.pair, &[]);

        let (_, engine) = engine();
        let cs = engine
            .diff3(&source, &dest, &baseline, &RunContext::default())
            .await
            .unwrap();

        assert!(cs.is_empty());
    }

    #[tokio::test]
    async fn test_new_on_both_sides_different_content_conflicts() {
        let r = roots();
        let source = snapshot(r.src.path(), &[("dup.mp3", b"rip A", 200)]);
        let dest = snapshot(r.dst.path(), &[("dup.mp3", b"rip B", 300)]);
        let baseline = baseline_with(&r.pair, &[]);

        let (_, engine) = engine();
        let cs = engine
            .diff3(&source, &dest, &baseline, &RunContext::default())
            .await
            .unwrap();

        assert_eq!(cs.conflicts().count(), 1);
    }

    #[tokio::test]
    async fn test_untouched_paths_never_hash() {
        let r = roots();
        let source = snapshot(r.src.path(), &[("quiet.mp3", b"asleep", 100)]);
        let dest = snapshot(r.dst.path(), &[("quiet.mp3", b"asleep", 100)]);
        let baseline = baseline_with(&r.pair, &[("quiet.mp3", 6, 100, None)]);

        let (service, engine) = engine();
        let cs = engine
            .diff3(&source, &dest, &baseline, &RunContext::default())
            .await
            .unwrap();

        assert!(cs.is_empty());
        assert_eq!(service.computations(), 0);
    }

    #[tokio::test]
    async fn test_touched_but_matching_baseline_fingerprint_is_unchanged() {
        let r = roots();
        // Source mtime moved but content still matches the baseline's
        // recorded fingerprint: unchanged, so nothing propagates.
        let body = b"stable content";
        let source = snapshot(r.src.path(), &[("t.mp3", body, 900)]);
        let dest = snapshot(r.dst.path(), &[("t.mp3", body, 100)]);

        let (service, engine) = engine();
        let fp = service
            .fingerprint(
                r.src.path(),
                source.get(&LibraryPath::new("t.mp3").unwrap()).unwrap(),
            )
            .await
            .unwrap();
        let baseline = baseline_with(&r.pair, &[("t.mp3", body.len() as u64, 100, Some(fp))]);

        let cs = engine
            .diff3(&source, &dest, &baseline, &RunContext::default())
            .await
            .unwrap();

        assert!(cs.is_empty());
    }
}
