//! Snapshots and baselines
//!
//! A [`Snapshot`] is the point-in-time listing a scan produces: entries
//! ordered by path, plus the root they were captured under. A [`Baseline`]
//! is the fingerprint projection of the last successfully synchronized
//! state for one root pair, owned by the state store and read-only to the
//! diff engine.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::entry::LibraryEntry;
use super::newtypes::{Fingerprint, LibraryPath, RootPair};

// ============================================================================
// Snapshot
// ============================================================================

/// A point-in-time listing of the files under a root
///
/// Ordered by path (BTreeMap) so the diff engine can merge two snapshots
/// in a single sequential pass. Never mutated after capture; each scan
/// produces a fresh one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    /// The scanned root
    root: PathBuf,
    /// When the scan finished
    captured_at: DateTime<Utc>,
    /// Entries keyed by library-relative path
    entries: BTreeMap<LibraryPath, LibraryEntry>,
}

impl Snapshot {
    /// Builds a snapshot from scanned entries
    ///
    /// A path can appear at most once; later duplicates replace earlier
    /// ones, which cannot happen for entries produced by a single walk.
    pub fn from_entries(root: impl Into<PathBuf>, entries: Vec<LibraryEntry>) -> Self {
        let entries = entries
            .into_iter()
            .map(|e| (e.path().clone(), e))
            .collect();
        Self {
            root: root.into(),
            captured_at: Utc::now(),
            entries,
        }
    }

    /// Creates an empty snapshot for a root
    pub fn empty(root: impl Into<PathBuf>) -> Self {
        Self::from_entries(root, Vec::new())
    }

    /// Returns the scanned root
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns when the scan finished
    pub fn captured_at(&self) -> DateTime<Utc> {
        self.captured_at
    }

    /// Returns the number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if the snapshot has no entries
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Looks up an entry by path
    pub fn get(&self, path: &LibraryPath) -> Option<&LibraryEntry> {
        self.entries.get(path)
    }

    /// Returns true if the snapshot contains the path
    pub fn contains(&self, path: &LibraryPath) -> bool {
        self.entries.contains_key(path)
    }

    /// Iterates entries in path order
    pub fn iter(&self) -> impl Iterator<Item = &LibraryEntry> {
        self.entries.values()
    }

    /// Iterates paths in order
    pub fn paths(&self) -> impl Iterator<Item = &LibraryPath> {
        self.entries.keys()
    }

    /// Total size in bytes of all entries
    pub fn total_bytes(&self) -> u64 {
        self.entries.values().map(LibraryEntry::size).sum()
    }
}

// ============================================================================
// Baseline
// ============================================================================

/// The fingerprint projection of one path at the last successful sync
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BaselineEntry {
    /// Library-relative path
    pub path: LibraryPath,
    /// Size at commit time
    pub size: u64,
    /// Modification time at commit time
    pub mtime: DateTime<Utc>,
    /// Content fingerprint when one was computed for the committing run
    pub fingerprint: Option<Fingerprint>,
}

/// The last-synchronized state for one (source, destination) root pair
///
/// Replaced only after an execution report confirms application of the
/// paths it describes; a cancelled or failed run leaves it untouched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Baseline {
    /// The root pair this baseline belongs to
    pair: RootPair,
    /// When the owning run committed
    committed_at: DateTime<Utc>,
    /// Entries keyed by path
    entries: BTreeMap<LibraryPath, BaselineEntry>,
}

impl Baseline {
    /// Builds a baseline from entries
    pub fn new(pair: RootPair, committed_at: DateTime<Utc>, entries: Vec<BaselineEntry>) -> Self {
        let entries = entries.into_iter().map(|e| (e.path.clone(), e)).collect();
        Self {
            pair,
            committed_at,
            entries,
        }
    }

    /// Creates an empty baseline for a pair (first sync)
    pub fn empty(pair: RootPair) -> Self {
        Self::new(pair, Utc::now(), Vec::new())
    }

    /// Returns the root pair
    pub fn pair(&self) -> &RootPair {
        &self.pair
    }

    /// Returns the commit timestamp
    pub fn committed_at(&self) -> DateTime<Utc> {
        self.committed_at
    }

    /// Looks up the baseline state of a path
    pub fn get(&self, path: &LibraryPath) -> Option<&BaselineEntry> {
        self.entries.get(path)
    }

    /// Returns true if the path was present at the last sync
    pub fn contains(&self, path: &LibraryPath) -> bool {
        self.entries.contains_key(path)
    }

    /// Iterates entries in path order
    pub fn iter(&self) -> impl Iterator<Item = &BaselineEntry> {
        self.entries.values()
    }

    /// Returns the number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if the baseline records no paths
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Removes a path (used when folding applied deletes into the next
    /// baseline)
    pub fn remove(&mut self, path: &LibraryPath) -> Option<BaselineEntry> {
        self.entries.remove(path)
    }

    /// Inserts or replaces a path's entry (used when folding applied
    /// writes into the next baseline)
    pub fn upsert(&mut self, entry: BaselineEntry) {
        self.entries.insert(entry.path.clone(), entry);
    }

    /// Consumes the baseline into its entries, in path order
    pub fn into_entries(self) -> Vec<BaselineEntry> {
        self.entries.into_values().collect()
    }
}
