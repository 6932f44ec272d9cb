//! Library scanner
//!
//! Walks a root path and produces a fresh [`Snapshot`] of file entries.
//! Traversal is sequential within a root (directory order is I/O-bound
//! anyway); independent roots scan on separate tasks. No hashing happens
//! here: fingerprints are the diff engine's business, computed lazily.
//!
//! Unreadable files and subdirectories are skipped and reported as
//! warnings; only an unreadable root is fatal.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;

use chrono::{DateTime, Utc};
use tracing::{debug, instrument, warn};

use melodeck_core::config::ScanSettings;
use melodeck_core::domain::{
    LibraryEntry, LibraryPath, ProgressEvent, ProgressPhase, RunContext, Snapshot, SyncError,
    TEMP_FILE_SUFFIX,
};
use melodeck_core::ports::ExtractorRegistry;

/// A non-fatal problem encountered during a scan
#[derive(Debug, Clone)]
pub struct ScanWarning {
    /// Absolute path of the entry that was skipped
    pub path: PathBuf,
    /// What went wrong
    pub message: String,
}

/// Result of one scan: the snapshot plus everything that was skipped
#[derive(Debug)]
pub struct ScanOutcome {
    /// The captured snapshot
    pub snapshot: Snapshot,
    /// Entries skipped with the reason
    pub warnings: Vec<ScanWarning>,
}

/// Scanner for one library root
///
/// Each `scan` call re-walks the filesystem; the returned snapshot is
/// never updated in place.
pub struct Scanner {
    root: PathBuf,
    settings: ScanSettings,
    registry: ExtractorRegistry,
}

impl Scanner {
    /// Creates a scanner with default settings and no metadata extractors
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            settings: ScanSettings::default(),
            registry: ExtractorRegistry::new(),
        }
    }

    /// Replaces the scan settings (builder style)
    pub fn with_settings(mut self, settings: ScanSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Attaches a metadata extractor registry (builder style)
    pub fn with_registry(mut self, registry: ExtractorRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Returns the scanned root
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Walks the root and captures a snapshot
    ///
    /// # Errors
    /// - `SyncError::RootUnreadable` if the root itself cannot be read
    /// - `SyncError::Cancelled` if the run context was cancelled
    #[instrument(skip(self, ctx), fields(root = %self.root.display()))]
    pub async fn scan(&self, ctx: &RunContext) -> Result<ScanOutcome, SyncError> {
        // Probe the root up front so a missing or unreadable root fails
        // fatally instead of producing an empty snapshot.
        let root_meta =
            tokio::fs::metadata(&self.root)
                .await
                .map_err(|source| SyncError::RootUnreadable {
                    root: self.root.clone(),
                    source,
                })?;
        if !root_meta.is_dir() {
            return Err(SyncError::RootUnreadable {
                root: self.root.clone(),
                source: std::io::Error::new(std::io::ErrorKind::Other, "root is not a directory"),
            });
        }

        let mut entries = Vec::new();
        let mut warnings = Vec::new();
        self.walk_directory(self.root.clone(), ctx, &mut entries, &mut warnings)
            .await?;

        debug!(
            entries = entries.len(),
            warnings = warnings.len(),
            "scan complete"
        );

        Ok(ScanOutcome {
            snapshot: Snapshot::from_entries(&self.root, entries),
            warnings,
        })
    }

    /// Returns true if the file name is excluded by settings
    fn is_ignored(&self, name: &str) -> bool {
        if name.ends_with(TEMP_FILE_SUFFIX) {
            return true;
        }
        if self.settings.skip_hidden && name.starts_with('.') {
            return true;
        }
        self.settings.ignore.iter().any(|pattern| {
            if let Some(suffix) = pattern.strip_prefix('*') {
                name.ends_with(suffix)
            } else {
                name == pattern
            }
        })
    }

    /// Recursively walks `dir`, appending entries and warnings
    ///
    /// Cancellation is checked between directory entries. Failures below
    /// the root are warnings; the walk continues.
    fn walk_directory<'a>(
        &'a self,
        dir: PathBuf,
        ctx: &'a RunContext,
        entries: &'a mut Vec<LibraryEntry>,
        warnings: &'a mut Vec<ScanWarning>,
    ) -> Pin<Box<dyn Future<Output = Result<(), SyncError>> + Send + 'a>> {
        Box::pin(async move {
            let mut read_dir = match tokio::fs::read_dir(&dir).await {
                Ok(rd) => rd,
                Err(err) if dir == self.root => {
                    return Err(SyncError::RootUnreadable {
                        root: self.root.clone(),
                        source: err,
                    });
                }
                Err(err) => {
                    warn!(path = %dir.display(), %err, "skipping unreadable directory");
                    warnings.push(ScanWarning {
                        path: dir,
                        message: err.to_string(),
                    });
                    return Ok(());
                }
            };

            loop {
                ctx.check_cancelled()?;

                let entry = match read_dir.next_entry().await {
                    Ok(Some(entry)) => entry,
                    Ok(None) => break,
                    Err(err) => {
                        warn!(path = %dir.display(), %err, "directory listing interrupted");
                        warnings.push(ScanWarning {
                            path: dir.clone(),
                            message: err.to_string(),
                        });
                        break;
                    }
                };

                let path = entry.path();
                let name = entry.file_name();
                let Some(name) = name.to_str() else {
                    warn!(path = %path.display(), "skipping non-UTF-8 file name");
                    warnings.push(ScanWarning {
                        path,
                        message: "non-UTF-8 file name".to_string(),
                    });
                    continue;
                };

                if self.is_ignored(name) {
                    continue;
                }

                let file_type = match entry.file_type().await {
                    Ok(ft) => ft,
                    Err(err) => {
                        warn!(path = %path.display(), %err, "skipping unreadable entry");
                        warnings.push(ScanWarning {
                            path,
                            message: err.to_string(),
                        });
                        continue;
                    }
                };

                if file_type.is_symlink() {
                    // Following links risks escaping the root; skip them.
                    warnings.push(ScanWarning {
                        path,
                        message: "symlink skipped".to_string(),
                    });
                    continue;
                }

                if file_type.is_dir() {
                    self.walk_directory(path, ctx, entries, warnings).await?;
                    continue;
                }

                match self.capture_entry(&path, warnings).await {
                    Ok(Some(library_entry)) => {
                        ctx.metrics().record_entry_scanned();
                        ctx.emit_progress(ProgressEvent {
                            phase: ProgressPhase::Scanning,
                            path: Some(library_entry.path().clone()),
                            bytes_done: 0,
                            bytes_total: 0,
                            operations_done: ctx.metrics().entries_scanned(),
                            operations_total: 0,
                        });
                        entries.push(library_entry);
                    }
                    Ok(None) => {}
                    Err(err) => return Err(err),
                }
            }

            Ok(())
        })
    }

    /// Stats one file and, for recognized audio extensions, extracts tags
    async fn capture_entry(
        &self,
        path: &Path,
        warnings: &mut Vec<ScanWarning>,
    ) -> Result<Option<LibraryEntry>, SyncError> {
        let metadata = match tokio::fs::metadata(path).await {
            Ok(m) => m,
            Err(err) => {
                warn!(path = %path.display(), %err, "skipping unreadable file");
                warnings.push(ScanWarning {
                    path: path.to_path_buf(),
                    message: err.to_string(),
                });
                return Ok(None);
            }
        };

        let relative = match path.strip_prefix(&self.root) {
            Ok(rel) => rel,
            Err(_) => {
                // Walk never leaves the root; a mismatch means the path
                // changed under us.
                warnings.push(ScanWarning {
                    path: path.to_path_buf(),
                    message: "entry escaped the scan root".to_string(),
                });
                return Ok(None);
            }
        };

        let library_path = match LibraryPath::from_relative(relative) {
            Ok(p) => p,
            Err(err) => {
                warn!(path = %path.display(), %err, "skipping invalid path");
                warnings.push(ScanWarning {
                    path: path.to_path_buf(),
                    message: err.to_string(),
                });
                return Ok(None);
            }
        };

        let mtime: DateTime<Utc> = metadata
            .modified()
            .map(DateTime::from)
            .unwrap_or_else(|_| Utc::now());

        let mut entry = LibraryEntry::new(library_path.clone(), metadata.len(), mtime);

        if let Some(extension) = library_path.extension() {
            if let Some(extractor) = self.registry.for_extension(&extension) {
                match extractor.extract(path).await {
                    Ok(audio) if !audio.is_empty() => {
                        entry = entry.with_audio(audio);
                    }
                    Ok(_) => {}
                    Err(err) => {
                        warn!(path = %path.display(), %err, "tag extraction failed");
                        warnings.push(ScanWarning {
                            path: path.to_path_buf(),
                            message: format!("tag extraction failed: {err:#}"),
                        });
                    }
                }
            }
        }

        Ok(Some(entry))
    }
}

// ============================================================================
// Tests
// ============================================================================
