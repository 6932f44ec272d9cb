//! Change sets
//!
//! A [`ChangeSet`] is the ordered output of one diff invocation: the
//! operations that would make the destination match the source (plus
//! conflicts, which are surfaced but never executed). Produced once per
//! diff, immutable afterwards, consumed exactly once by the execution
//! engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::newtypes::{Fingerprint, LibraryPath};

/// One planned sync operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Operation {
    /// Copy a file that exists only in the source
    Add {
        /// Destination-relative path to create
        path: LibraryPath,
        /// Source size in bytes
        size: u64,
        /// Fingerprint when one was computed during diffing
        fingerprint: Option<Fingerprint>,
    },
    /// Overwrite a file whose content differs
    Update {
        /// Path to overwrite
        path: LibraryPath,
        /// Source size in bytes
        size: u64,
        /// Fingerprint when one was computed during diffing
        fingerprint: Option<Fingerprint>,
    },
    /// Remove a file that no longer exists in the source
    Delete {
        /// Path to remove
        path: LibraryPath,
    },
    /// Rename a file in place instead of copying it again
    ///
    /// Re-classified from an Add+Delete pair whose size and fingerprint
    /// match; avoids a redundant full-file copy.
    Move {
        /// Existing destination path
        from: LibraryPath,
        /// New destination path
        to: LibraryPath,
        /// File size in bytes
        size: u64,
        /// The shared content fingerprint that proved the match
        fingerprint: Fingerprint,
    },
    /// Both sides changed independently since the baseline
    ///
    /// Never auto-resolved and never executed; surfaced for manual
    /// resolution.
    Conflict {
        /// The contested path
        path: LibraryPath,
        /// Source-side fingerprint, when the source still has the file
        source_fingerprint: Option<Fingerprint>,
        /// Destination-side fingerprint, when the destination still has it
        dest_fingerprint: Option<Fingerprint>,
    },
}

impl Operation {
    /// Returns the primary path of the operation (the Move target)
    pub fn path(&self) -> &LibraryPath {
        match self {
            Operation::Add { path, .. }
            | Operation::Update { path, .. }
            | Operation::Delete { path }
            | Operation::Conflict { path, .. } => path,
            Operation::Move { to, .. } => to,
        }
    }

    /// Returns the bytes this operation will write (0 for deletes,
    /// renames, and conflicts)
    pub fn copy_bytes(&self) -> u64 {
        match self {
            Operation::Add { size, .. } | Operation::Update { size, .. } => *size,
            _ => 0,
        }
    }

    /// True for operations applied in the copy phase (before any delete)
    pub fn is_copy_phase(&self) -> bool {
        matches!(
            self,
            Operation::Add { .. } | Operation::Update { .. } | Operation::Move { .. }
        )
    }

    /// True for conflicts, which are excluded from execution
    pub fn is_conflict(&self) -> bool {
        matches!(self, Operation::Conflict { .. })
    }

    /// Short lowercase label for logs and run summaries
    pub fn kind(&self) -> &'static str {
        match self {
            Operation::Add { .. } => "add",
            Operation::Update { .. } => "update",
            Operation::Delete { .. } => "delete",
            Operation::Move { .. } => "move",
            Operation::Conflict { .. } => "conflict",
        }
    }
}

/// The ordered sequence of operations produced by one diff invocation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeSet {
    /// When the diff finished
    generated_at: DateTime<Utc>,
    /// Operations in diff order (path order, moves appended last)
    operations: Vec<Operation>,
}

impl ChangeSet {
    /// Builds a change set from operations
    pub fn new(operations: Vec<Operation>) -> Self {
        Self {
            generated_at: Utc::now(),
            operations,
        }
    }

    /// Creates an empty change set
    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    /// When the diff finished
    pub fn generated_at(&self) -> DateTime<Utc> {
        self.generated_at
    }

    /// Returns the number of operations, conflicts included
    pub fn len(&self) -> usize {
        self.operations.len()
    }

    /// Returns true if the diff found nothing to do
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Iterates operations in order
    pub fn iter(&self) -> impl Iterator<Item = &Operation> {
        self.operations.iter()
    }

    /// Iterates only the conflicts
    pub fn conflicts(&self) -> impl Iterator<Item = &Operation> {
        self.operations.iter().filter(|op| op.is_conflict())
    }

    /// Counts operations by kind, returned as (adds, updates, deletes,
    /// moves, conflicts)
    pub fn counts(&self) -> (usize, usize, usize, usize, usize) {
        let mut counts = (0, 0, 0, 0, 0);
        for op in &self.operations {
            match op {
                Operation::Add { .. } => counts.0 += 1,
                Operation::Update { .. } => counts.1 += 1,
                Operation::Delete { .. } => counts.2 += 1,
                Operation::Move { .. } => counts.3 += 1,
                Operation::Conflict { .. } => counts.4 += 1,
            }
        }
        counts
    }

    /// Total bytes the copy phase will write
    pub fn total_copy_bytes(&self) -> u64 {
        self.operations.iter().map(Operation::copy_bytes).sum()
    }

    /// Number of executable operations (everything but conflicts)
    pub fn executable_len(&self) -> usize {
        self.operations.iter().filter(|op| !op.is_conflict()).count()
    }

    /// Consumes the change set into its operations
    pub fn into_operations(self) -> Vec<Operation> {
        self.operations
    }
}
