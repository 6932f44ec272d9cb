//! SQLite implementation of the StateStore port
//!
//! ## Type Mapping
//!
//! | Domain Type    | SQL Type | Strategy                                   |
//! |----------------|----------|--------------------------------------------|
//! | RunId          | TEXT     | UUID string via `.to_string()` / `FromStr` |
//! | root paths     | TEXT     | lossless on UTF-8 paths via `display()`    |
//! | LibraryPath    | TEXT     | validated string via `LibraryPath::new()`  |
//! | Fingerprint    | TEXT     | 64-char hex via `to_hex()` / `from_hex()`  |
//! | DateTime<Utc>  | TEXT     | RFC 3339 via `to_rfc3339()`                |
//! | RunOutcome     | TEXT     | `committed` / `cancelled` / `failed:<why>` |

use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::{debug, instrument};

use melodeck_core::domain::{
    Baseline, BaselineEntry, Fingerprint, LibraryPath, RootPair, RunId, RunOutcome, RunSummary,
};
use melodeck_core::ports::StateStore;

use crate::StoreError;

/// SQLite-based implementation of the state store port
///
/// All operations go through a connection pool; the per-run commit
/// (baseline replacement + history row) runs in one transaction.
pub struct SqliteStateStore {
    pool: SqlitePool,
}

impl SqliteStateStore {
    /// Creates a new store instance with the given connection pool
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

// ============================================================================
// Helper functions for type conversion
// ============================================================================

fn root_to_string(path: &std::path::Path) -> String {
    path.display().to_string()
}

/// Serialize a RunOutcome for storage
///
/// Committed and cancelled are plain strings; failures carry the reason
/// as `failed:<reason>`.
fn outcome_to_string(outcome: &RunOutcome) -> String {
    match outcome {
        RunOutcome::Committed => "committed".to_string(),
        RunOutcome::Cancelled => "cancelled".to_string(),
        RunOutcome::Failed { reason } => format!("failed:{}", reason),
    }
}

/// Deserialize a RunOutcome from its stored string representation
fn outcome_from_string(s: &str) -> Result<RunOutcome, StoreError> {
    match s {
        "committed" => Ok(RunOutcome::Committed),
        "cancelled" => Ok(RunOutcome::Cancelled),
        s if s.starts_with("failed:") => Ok(RunOutcome::Failed {
            reason: s[7..].to_string(),
        }),
        other => Err(StoreError::SerializationError(format!(
            "Unknown run outcome: {}",
            other
        ))),
    }
}

/// Parse a DateTime<Utc> from an RFC 3339 string
fn parse_datetime(s: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            StoreError::SerializationError(format!("Failed to parse datetime '{}': {}", s, e))
        })
}

// ============================================================================
// Row mapping functions
// ============================================================================

fn baseline_entry_from_row(row: &SqliteRow) -> Result<BaselineEntry, StoreError> {
    let path_str: String = row.get("path");
    let size: i64 = row.get("size");
    let mtime_str: String = row.get("mtime");
    let fingerprint_str: Option<String> = row.get("fingerprint");

    let path = LibraryPath::new(path_str)
        .map_err(|e| StoreError::SerializationError(format!("Invalid stored path: {}", e)))?;
    let fingerprint = fingerprint_str
        .map(|hex| {
            Fingerprint::from_hex(&hex).map_err(|e| {
                StoreError::SerializationError(format!("Invalid stored fingerprint: {}", e))
            })
        })
        .transpose()?;

    Ok(BaselineEntry {
        path,
        size: size as u64,
        mtime: parse_datetime(&mtime_str)?,
        fingerprint,
    })
}

fn run_summary_from_row(row: &SqliteRow) -> Result<RunSummary, StoreError> {
    let id_str: String = row.get("id");
    let source_root: String = row.get("source_root");
    let dest_root: String = row.get("dest_root");
    let started_str: String = row.get("started_at");
    let finished_str: String = row.get("finished_at");
    let outcome_str: String = row.get("outcome");

    let id = RunId::from_str(&id_str)
        .map_err(|e| StoreError::SerializationError(format!("Invalid stored run id: {}", e)))?;
    let pair = RootPair::new(PathBuf::from(source_root), PathBuf::from(dest_root))
        .map_err(|e| StoreError::SerializationError(format!("Invalid stored root pair: {}", e)))?;

    let get_u64 = |column: &str| -> u64 {
        let value: i64 = row.get(column);
        value as u64
    };

    Ok(RunSummary {
        id,
        pair,
        started_at: parse_datetime(&started_str)?,
        finished_at: parse_datetime(&finished_str)?,
        source_entries: get_u64("source_entries"),
        dest_entries: get_u64("dest_entries"),
        operations_total: get_u64("operations_total"),
        applied: get_u64("applied"),
        failed: get_u64("failed"),
        skipped: get_u64("skipped"),
        conflicts: get_u64("conflicts"),
        bytes_written: get_u64("bytes_written"),
        outcome: outcome_from_string(&outcome_str)?,
    })
}

// ============================================================================
// Write helpers
// ============================================================================

impl SqliteStateStore {
    /// Replaces the pair's baseline rows inside an open transaction
    async fn write_baseline(
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        baseline: &Baseline,
    ) -> Result<(), StoreError> {
        let source_root = root_to_string(baseline.pair().source());
        let dest_root = root_to_string(baseline.pair().dest());

        sqlx::query("DELETE FROM baselines WHERE source_root = ? AND dest_root = ?")
            .bind(&source_root)
            .bind(&dest_root)
            .execute(&mut **tx)
            .await?;
        sqlx::query("DELETE FROM baseline_entries WHERE source_root = ? AND dest_root = ?")
            .bind(&source_root)
            .bind(&dest_root)
            .execute(&mut **tx)
            .await?;

        sqlx::query(
            "INSERT INTO baselines (source_root, dest_root, committed_at) VALUES (?, ?, ?)",
        )
        .bind(&source_root)
        .bind(&dest_root)
        .bind(baseline.committed_at().to_rfc3339())
        .execute(&mut **tx)
        .await?;

        for entry in baseline.iter() {
            sqlx::query(
                "INSERT INTO baseline_entries \
                 (source_root, dest_root, path, size, mtime, fingerprint) \
                 VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(&source_root)
            .bind(&dest_root)
            .bind(entry.path.as_str())
            .bind(entry.size as i64)
            .bind(entry.mtime.to_rfc3339())
            .bind(entry.fingerprint.map(|fp| fp.to_hex()))
            .execute(&mut **tx)
            .await?;
        }

        Ok(())
    }

    /// Appends the run-history row inside an open transaction
    async fn write_run(
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        summary: &RunSummary,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO run_history \
             (id, source_root, dest_root, started_at, finished_at, \
              source_entries, dest_entries, operations_total, applied, \
              failed, skipped, conflicts, bytes_written, outcome) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(summary.id.to_string())
        .bind(root_to_string(summary.pair.source()))
        .bind(root_to_string(summary.pair.dest()))
        .bind(summary.started_at.to_rfc3339())
        .bind(summary.finished_at.to_rfc3339())
        .bind(summary.source_entries as i64)
        .bind(summary.dest_entries as i64)
        .bind(summary.operations_total as i64)
        .bind(summary.applied as i64)
        .bind(summary.failed as i64)
        .bind(summary.skipped as i64)
        .bind(summary.conflicts as i64)
        .bind(summary.bytes_written as i64)
        .bind(outcome_to_string(&summary.outcome))
        .execute(&mut **tx)
        .await?;

        Ok(())
    }
}

// ============================================================================
// StateStore implementation
// ============================================================================

#[async_trait::async_trait]
impl StateStore for SqliteStateStore {
    #[instrument(skip(self), fields(pair = %pair))]
    async fn load_baseline(&self, pair: &RootPair) -> anyhow::Result<Option<Baseline>> {
        let source_root = root_to_string(pair.source());
        let dest_root = root_to_string(pair.dest());

        let header = sqlx::query(
            "SELECT committed_at FROM baselines WHERE source_root = ? AND dest_root = ?",
        )
        .bind(&source_root)
        .bind(&dest_root)
        .fetch_optional(&self.pool)
        .await
        .map_err(StoreError::from)?;

        let Some(header) = header else {
            debug!("no baseline recorded for pair");
            return Ok(None);
        };
        let committed_at_str: String = header.get("committed_at");
        let committed_at = parse_datetime(&committed_at_str)?;

        let rows = sqlx::query(
            "SELECT path, size, mtime, fingerprint FROM baseline_entries \
             WHERE source_root = ? AND dest_root = ? ORDER BY path",
        )
        .bind(&source_root)
        .bind(&dest_root)
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::from)?;

        let entries = rows
            .iter()
            .map(baseline_entry_from_row)
            .collect::<Result<Vec<_>, _>>()?;

        debug!(entries = entries.len(), "baseline loaded");
        Ok(Some(Baseline::new(pair.clone(), committed_at, entries)))
    }

    #[instrument(skip(self, baseline), fields(pair = %baseline.pair(), entries = baseline.len()))]
    async fn commit_baseline(&self, baseline: &Baseline) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await.map_err(StoreError::from)?;
        Self::write_baseline(&mut tx, baseline).await?;
        tx.commit().await.map_err(StoreError::from)?;

        debug!("baseline committed");
        Ok(())
    }

    #[instrument(skip(self, summary), fields(run = %summary.id))]
    async fn record_run(&self, summary: &RunSummary) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await.map_err(StoreError::from)?;
        Self::write_run(&mut tx, summary).await?;
        tx.commit().await.map_err(StoreError::from)?;
        Ok(())
    }

    /// Baseline replacement and history row in one transaction: a failure
    /// rolls both back, preserving the prior baseline.
    #[instrument(skip(self, baseline, summary), fields(run = %summary.id, entries = baseline.len()))]
    async fn commit_run(&self, baseline: &Baseline, summary: &RunSummary) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await.map_err(StoreError::from)?;
        Self::write_baseline(&mut tx, baseline).await?;
        Self::write_run(&mut tx, summary).await?;
        tx.commit().await.map_err(StoreError::from)?;

        debug!("run committed");
        Ok(())
    }

    #[instrument(skip(self), fields(pair = %pair))]
    async fn recent_runs(&self, pair: &RootPair, limit: u32) -> anyhow::Result<Vec<RunSummary>> {
        let rows = sqlx::query(
            "SELECT * FROM run_history \
             WHERE source_root = ? AND dest_root = ? \
             ORDER BY started_at DESC LIMIT ?",
        )
        .bind(root_to_string(pair.source()))
        .bind(root_to_string(pair.dest()))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::from)?;

        let runs = rows
            .iter()
            .map(run_summary_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(runs)
    }
}
