//! Execution reports and run history
//!
//! The [`ExecutionReport`] records what actually happened to every
//! operation of a change set. It is the only input used to decide whether
//! the baseline is updated and for which paths. A [`RunSummary`] is the
//! condensed per-run record the state store keeps as history.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::changeset::Operation;
use super::newtypes::{RootPair, RunId};

// ============================================================================
// Per-operation outcomes
// ============================================================================

/// What happened to a single operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationOutcome {
    /// The operation was applied to disk
    Applied,
    /// The operation failed after retries were exhausted
    Failed {
        /// Description of the final failure
        cause: String,
    },
    /// The operation was not attempted (dry run, conflict, cancellation)
    Skipped {
        /// Why it was skipped
        reason: String,
    },
}

impl OperationOutcome {
    /// Returns true if the operation reached disk
    pub fn is_applied(&self) -> bool {
        matches!(self, OperationOutcome::Applied)
    }

    /// Returns true if the operation failed permanently
    pub fn is_failed(&self) -> bool {
        matches!(self, OperationOutcome::Failed { .. })
    }

    /// Returns true if the operation was skipped
    pub fn is_skipped(&self) -> bool {
        matches!(self, OperationOutcome::Skipped { .. })
    }
}

/// One operation paired with its outcome
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationResult {
    /// The planned operation
    pub operation: Operation,
    /// What happened to it
    pub outcome: OperationOutcome,
    /// Bytes written for this operation (0 unless Applied with a copy)
    pub bytes_written: u64,
}

// ============================================================================
// ExecutionReport
// ============================================================================

/// Complete record of one execution pass over a change set
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionReport {
    /// When execution started
    started_at: DateTime<Utc>,
    /// When execution finished
    finished_at: DateTime<Utc>,
    /// Per-operation results, in execution order
    results: Vec<OperationResult>,
}

impl ExecutionReport {
    /// Builds a report from per-operation results
    pub fn new(
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        results: Vec<OperationResult>,
    ) -> Self {
        Self {
            started_at,
            finished_at,
            results,
        }
    }

    /// When execution started
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// When execution finished
    pub fn finished_at(&self) -> DateTime<Utc> {
        self.finished_at
    }

    /// Per-operation results in execution order
    pub fn results(&self) -> &[OperationResult] {
        &self.results
    }

    /// Iterates the operations that were applied
    pub fn applied(&self) -> impl Iterator<Item = &OperationResult> {
        self.results.iter().filter(|r| r.outcome.is_applied())
    }

    /// Number of applied operations
    pub fn applied_count(&self) -> usize {
        self.applied().count()
    }

    /// Number of permanently failed operations
    pub fn failed_count(&self) -> usize {
        self.results.iter().filter(|r| r.outcome.is_failed()).count()
    }

    /// Number of skipped operations
    pub fn skipped_count(&self) -> usize {
        self.results.iter().filter(|r| r.outcome.is_skipped()).count()
    }

    /// Total bytes written by applied operations
    pub fn bytes_written(&self) -> u64 {
        self.results.iter().map(|r| r.bytes_written).sum()
    }

    /// Returns true if every executable operation was applied
    pub fn is_clean(&self) -> bool {
        self.failed_count() == 0
    }
}

// ============================================================================
// Run history
// ============================================================================

/// Terminal outcome of a sync run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    /// The run finished and a new baseline was committed
    Committed,
    /// The run aborted on a fatal condition
    Failed {
        /// Description of the fatal condition
        reason: String,
    },
    /// The run was cancelled; the prior baseline is untouched
    Cancelled,
}

impl RunOutcome {
    /// Returns true if a baseline was committed
    pub fn is_committed(&self) -> bool {
        matches!(self, RunOutcome::Committed)
    }

    /// Returns true if the run failed
    pub fn is_failed(&self) -> bool {
        matches!(self, RunOutcome::Failed { .. })
    }
}

impl std::fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunOutcome::Committed => write!(f, "committed"),
            RunOutcome::Failed { reason } => write!(f, "failed: {}", reason),
            RunOutcome::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Condensed record of one completed sync run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    /// Run identifier
    pub id: RunId,
    /// The synchronized root pair
    pub pair: RootPair,
    /// When the run started
    pub started_at: DateTime<Utc>,
    /// When the run reached a terminal state
    pub finished_at: DateTime<Utc>,
    /// Entries seen in the source snapshot
    pub source_entries: u64,
    /// Entries seen in the destination snapshot
    pub dest_entries: u64,
    /// Operations the diff produced (conflicts included)
    pub operations_total: u64,
    /// Operations applied
    pub applied: u64,
    /// Operations failed
    pub failed: u64,
    /// Operations skipped
    pub skipped: u64,
    /// Conflicts surfaced
    pub conflicts: u64,
    /// Bytes written by applied operations
    pub bytes_written: u64,
    /// Terminal outcome
    pub outcome: RunOutcome,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::newtypes::LibraryPath;

    fn result(path: &str, outcome: OperationOutcome, bytes: u64) -> OperationResult {
        OperationResult {
            operation: Operation::Add {
                path: LibraryPath::new(path).unwrap(),
                size: bytes,
                fingerprint: None,
            },
            outcome,
            bytes_written: bytes,
        }
    }

    #[test]
    fn test_report_counters() {
        let now = Utc::now();
        let report = ExecutionReport::new(
            now,
            now,
            vec![
                result("a.mp3", OperationOutcome::Applied, 10),
                result(
                    "b.mp3",
                    OperationOutcome::Failed {
                        cause: "disk full".to_string(),
                    },
                    0,
                ),
                result(
                    "c.mp3",
                    OperationOutcome::Skipped {
                        reason: "dry run".to_string(),
                    },
                    0,
                ),
            ],
        );

        assert_eq!(report.applied_count(), 1);
        assert_eq!(report.failed_count(), 1);
        assert_eq!(report.skipped_count(), 1);
        assert_eq!(report.bytes_written(), 10);
        assert!(!report.is_clean());
    }

    #[test]
    fn test_applied_iterates_only_applied() {
        let now = Utc::now();
        let report = ExecutionReport::new(
            now,
            now,
            vec![
                result("a.mp3", OperationOutcome::Applied, 1),
                result(
                    "b.mp3",
                    OperationOutcome::Failed {
                        cause: "io".to_string(),
                    },
                    0,
                ),
            ],
        );
        let applied: Vec<_> = report
            .applied()
            .map(|r| r.operation.path().as_str().to_string())
            .collect();
        assert_eq!(applied, vec!["a.mp3"]);
    }

    #[test]
    fn test_run_outcome_display() {
        assert_eq!(RunOutcome::Committed.to_string(), "committed");
        assert_eq!(RunOutcome::Cancelled.to_string(), "cancelled");
        assert_eq!(
            RunOutcome::Failed {
                reason: "root vanished".to_string()
            }
            .to_string(),
            "failed: root vanished"
        );
    }
}
