//! MeloDeck Store - Baseline and run-history persistence
//!
//! SQLite-backed implementation of the `StateStore` port from
//! `melodeck-core`. A driven (secondary) adapter in the hexagonal
//! architecture.
//!
//! ## Key Components
//!
//! - [`DatabasePool`] - Connection pool with WAL mode and migration support
//! - [`SqliteStateStore`] - Full `StateStore` implementation; the baseline
//!   replacement and the run-history row of one sync run commit in a
//!   single transaction
//! - [`StoreError`] - Error types for store operations
//!
//! ## Usage
//!
//! ```no_run
//! use std::path::Path;
//! use melodeck_store::{DatabasePool, SqliteStateStore};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let pool = DatabasePool::new(Path::new("/home/user/.local/share/melodeck/state.db")).await?;
//! let store = SqliteStateStore::new(pool.pool().clone());
//! // Use store as StateStore...
//! # Ok(())
//! # }
//! ```

pub mod pool;
pub mod repository;

pub use pool::DatabasePool;
pub use repository::SqliteStateStore;

/// Errors that can occur during store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Failed to establish a database connection
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// A database query failed
    #[error("Query failed: {0}")]
    QueryFailed(String),

    /// Schema migration failed
    #[error("Migration failed: {0}")]
    MigrationFailed(String),

    /// Serialization or deserialization of domain types failed
    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        StoreError::QueryFailed(e.to_string())
    }
}
