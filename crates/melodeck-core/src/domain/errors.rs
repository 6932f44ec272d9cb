//! Domain error types
//!
//! This module defines the validation errors produced by domain value
//! objects and the run-level error taxonomy shared by the scanner, diff
//! engine, execution engine, and state store.

use std::path::PathBuf;

use thiserror::Error;

use super::newtypes::LibraryPath;

/// Errors that can occur when constructing or transitioning domain values
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// Invalid library-relative path format or content
    #[error("Invalid library path: {0}")]
    InvalidPath(String),

    /// Invalid fingerprint format (expected 64 lowercase hex characters)
    #[error("Invalid fingerprint: {0}")]
    InvalidFingerprint(String),

    /// Invalid run state transition attempt
    #[error("Invalid run state transition from {from} to {to}")]
    InvalidState {
        /// The current state
        from: String,
        /// The attempted target state
        to: String,
    },

    /// Generic validation failure
    #[error("Validation failed: {0}")]
    ValidationFailed(String),
}

/// Run-level error taxonomy
///
/// Propagation policy: per-entry failures (`EntryIo`, `Fingerprint`,
/// `OperationFailed`) are local and never abort the run by themselves.
/// Only `RootUnreadable` and `StateStore` are fatal. `Cancelled` is a
/// clean stop, distinct from failure: it leaves the prior baseline
/// untouched.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The root itself cannot be read; aborts the run
    #[error("Root is not readable: {root}")]
    RootUnreadable {
        /// The inaccessible root path
        root: PathBuf,
        /// The underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// A single entry could not be read; skipped and warned during scan
    #[error("I/O error on entry: {path}")]
    EntryIo {
        /// Library-relative path of the failing entry
        path: LibraryPath,
        /// The underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// A file became unreadable between scan and hash; local to one
    /// comparison, treated as inconclusive by the diff engine
    #[error("Failed to fingerprint: {path}")]
    Fingerprint {
        /// Library-relative path of the file
        path: LibraryPath,
        /// The underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// A single execution operation failed after retries were exhausted
    #[error("Operation failed for {path}: {cause}")]
    OperationFailed {
        /// Library-relative path the operation targeted
        path: LibraryPath,
        /// Description of the final failure
        cause: String,
    },

    /// The state store failed; fatal to the commit, prior baseline preserved
    #[error("State store failure: {0}")]
    StateStore(String),

    /// The run was cancelled cooperatively; no baseline change
    #[error("Sync run cancelled")]
    Cancelled,
}

impl SyncError {
    /// Returns true if this error aborts the whole run
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SyncError::RootUnreadable { .. } | SyncError::StateStore(_)
        )
    }

    /// Returns true if this error is a cooperative cancellation
    pub fn is_cancelled(&self) -> bool {
        matches!(self, SyncError::Cancelled)
    }
}
