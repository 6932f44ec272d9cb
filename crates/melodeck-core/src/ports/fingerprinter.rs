//! Fingerprinter port
//!
//! The diff engine pulls content fingerprints through this trait instead
//! of hashing inline, for two reasons: the memoizing implementation in
//! `melodeck-diff` can be shared across the two- and three-way passes of
//! one run, and tests can substitute a counting double to assert the
//! laziness invariant (no fingerprint for size+mtime-equal entries).

use std::path::Path;

use crate::domain::entry::LibraryEntry;
use crate::domain::errors::SyncError;
use crate::domain::newtypes::Fingerprint;

/// Port trait for lazy content fingerprinting
///
/// `fingerprint` is deterministic over file contents and keyed by
/// (path, size, mtime): implementations may cache under that key, and an
/// unmodified file is hashed at most once per service even under
/// concurrent requests.
#[async_trait::async_trait]
pub trait Fingerprinter: Send + Sync {
    /// Computes (or returns the cached) 256-bit digest of `entry` under
    /// `root`
    ///
    /// # Errors
    /// Returns `SyncError::Fingerprint` if the file became unreadable
    /// between scan and hash. The failure is local to one comparison and
    /// never aborts the run.
    async fn fingerprint(&self, root: &Path, entry: &LibraryEntry)
        -> Result<Fingerprint, SyncError>;
}
