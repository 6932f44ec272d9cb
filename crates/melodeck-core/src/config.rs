//! Configuration module for MeloDeck's sync core.
//!
//! Provides typed configuration structs that map to the YAML configuration
//! file, with loading, validation, and defaults. Collaborators (the desktop
//! shell, a command surface) hand the loaded `Config` to the core; nothing
//! in here reads the environment at sync time.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::run::{SyncDirection, SyncOptions};

/// Top-level configuration for the sync core.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub sync: SyncSettings,
    pub scan: ScanSettings,
    pub store: StoreSettings,
    pub logging: LoggingSettings,
}

/// Synchronization settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    /// Propagation direction: `one_way` or `bidirectional`.
    pub direction: SyncDirection,
    /// Maximum concurrent execution operations and hash workers.
    /// Sized to I/O concurrency, not CPU count.
    pub concurrency: usize,
    /// Retry attempts per operation before marking it failed.
    pub retry_limit: u32,
    /// First retry delay in milliseconds; doubles per attempt.
    pub retry_base_delay_ms: u64,
    /// Modification times closer than this (milliseconds) compare equal.
    pub mtime_tolerance_ms: u64,
    /// fsync temporary files before the atomic rename.
    pub durable: bool,
}

impl Default for SyncSettings {
    fn default() -> Self {
        let defaults = SyncOptions::default();
        Self {
            direction: defaults.direction,
            concurrency: defaults.concurrency,
            retry_limit: defaults.retry_limit,
            retry_base_delay_ms: defaults.retry_base_delay.as_millis() as u64,
            mtime_tolerance_ms: defaults.mtime_tolerance.as_millis() as u64,
            durable: defaults.durable,
        }
    }
}

/// Scanner settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanSettings {
    /// File names (or `*.ext` suffix patterns) the scanner skips.
    pub ignore: Vec<String>,
    /// Skip dotfiles and dot-directories.
    pub skip_hidden: bool,
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self {
            ignore: vec![
                ".DS_Store".to_string(),
                "Thumbs.db".to_string(),
                "*.partial".to_string(),
            ],
            skip_hidden: true,
        }
    }
}

/// State store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
    /// Path to the SQLite state database.
    pub db_path: PathBuf,
}

impl Default for StoreSettings {
    fn default() -> Self {
        let base = dirs::data_local_dir().unwrap_or_else(|| PathBuf::from("."));
        Self {
            db_path: base.join("melodeck").join("state.db"),
        }
    }
}

/// Logging / tracing settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Log level: `trace`, `debug`, `info`, `warn`, or `error`.
    pub level: String,
    /// Optional log file; stderr when unset.
    pub file: Option<PathBuf>,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

impl Config {
    /// Load configuration from a YAML file at `path`.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Try to load from `path`; fall back to [`Config::default`] on any error.
    pub fn load_or_default(path: &Path) -> Self {
        Self::load(path).unwrap_or_default()
    }

    /// Default location of the config file (`~/.config/melodeck/config.yaml`).
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("melodeck")
            .join("config.yaml")
    }

    /// Checks cross-field constraints.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.sync.concurrency == 0 {
            anyhow::bail!("sync.concurrency must be at least 1");
        }
        match self.logging.level.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            other => anyhow::bail!("unknown logging.level: {other}"),
        }
        Ok(())
    }

    /// Builds per-run options from the sync section.
    pub fn sync_options(&self) -> SyncOptions {
        SyncOptions {
            direction: self.sync.direction,
            concurrency: self.sync.concurrency,
            retry_limit: self.sync.retry_limit,
            retry_base_delay: Duration::from_millis(self.sync.retry_base_delay_ms),
            mtime_tolerance: Duration::from_millis(self.sync.mtime_tolerance_ms),
            dry_run: false,
            durable: self.sync.durable,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert!(config.scan.skip_hidden);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_sync_options_from_config() {
        let mut config = Config::default();
        config.sync.concurrency = 2;
        config.sync.mtime_tolerance_ms = 1500;
        let opts = config.sync_options();
        assert_eq!(opts.concurrency, 2);
        assert_eq!(opts.mtime_tolerance, Duration::from_millis(1500));
        assert!(!opts.dry_run);
    }

    #[test]
    fn test_validate_rejects_zero_concurrency() {
        let mut config = Config::default();
        config.sync.concurrency = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_partial_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "sync:\n  concurrency: 3\nlogging:\n  level: debug\n").unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.sync.concurrency, 3);
        assert_eq!(config.logging.level, "debug");
        // Untouched sections keep their defaults.
        assert!(config.scan.skip_hidden);
    }

    #[test]
    fn test_load_or_default_on_missing_file() {
        let config = Config::load_or_default(Path::new("/nonexistent/config.yaml"));
        assert_eq!(config.sync.concurrency, SyncOptions::default().concurrency);
    }
}
