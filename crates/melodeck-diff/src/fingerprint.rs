//! Memoizing fingerprint service
//!
//! SHA-256 over file contents, streamed in 64 KiB chunks on the blocking
//! pool. Results are cached under (absolute path, size, mtime) so an
//! unmodified file is hashed at most once per service instance, even when
//! a three-way diff touches the same path on both comparisons. The cache
//! is single-flight: concurrent requesters for one key await the one
//! in-flight computation instead of duplicating it.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use sha2::{Digest, Sha256};
use tokio::sync::OnceCell;
use tracing::{debug, instrument};

use melodeck_core::domain::{Fingerprint, LibraryEntry, RunMetrics, SyncError};
use melodeck_core::ports::Fingerprinter;

/// Cache key: a file identity at one point in time
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    path: PathBuf,
    size: u64,
    mtime_ms: i64,
}

/// Memoizing, concurrency-safe [`Fingerprinter`] implementation
pub struct FingerprintService {
    cache: DashMap<CacheKey, Arc<OnceCell<Fingerprint>>>,
    computations: AtomicU64,
    metrics: Option<Arc<RunMetrics>>,
}

impl FingerprintService {
    /// Creates an empty service
    pub fn new() -> Self {
        Self {
            cache: DashMap::new(),
            computations: AtomicU64::new(0),
            metrics: None,
        }
    }

    /// Mirrors computation counts into the run metrics (builder style)
    pub fn with_metrics(mut self, metrics: Arc<RunMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Number of digests actually computed (cache hits excluded)
    pub fn computations(&self) -> u64 {
        self.computations.load(Ordering::Relaxed)
    }

    /// Number of cached keys
    pub fn cached_keys(&self) -> usize {
        self.cache.len()
    }

    async fn compute(&self, abs_path: PathBuf, entry: &LibraryEntry) -> Result<Fingerprint, SyncError> {
        self.computations.fetch_add(1, Ordering::Relaxed);
        if let Some(metrics) = &self.metrics {
            metrics.record_fingerprint();
        }

        let path_for_error = entry.path().clone();
        tokio::task::spawn_blocking(move || hash_file(&abs_path))
            .await
            .map_err(|e| SyncError::Fingerprint {
                path: path_for_error.clone(),
                source: std::io::Error::new(std::io::ErrorKind::Other, e.to_string()),
            })?
            .map_err(|source| SyncError::Fingerprint {
                path: path_for_error,
                source,
            })
    }
}

impl Default for FingerprintService {
    fn default() -> Self {
        Self::new()
    }
}

/// Streams the file through SHA-256 with a 64 KiB buffer
fn hash_file(path: &Path) -> std::io::Result<Fingerprint> {
    use std::io::Read;

    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 64 * 1024];

    loop {
        let bytes_read = file.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(Fingerprint::from_bytes(hasher.finalize().into()))
}

#[async_trait::async_trait]
impl Fingerprinter for FingerprintService {
    #[instrument(skip(self, root, entry), fields(path = %entry.path()))]
    async fn fingerprint(
        &self,
        root: &Path,
        entry: &LibraryEntry,
    ) -> Result<Fingerprint, SyncError> {
        let abs_path = entry.path().resolve(root);
        let key = CacheKey {
            path: abs_path.clone(),
            size: entry.size(),
            mtime_ms: entry.mtime().timestamp_millis(),
        };

        let cell = self
            .cache
            .entry(key)
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone();

        let fingerprint = cell
            .get_or_try_init(|| self.compute(abs_path, entry))
            .await?;

        debug!(fingerprint = %fingerprint, "fingerprint resolved");
        Ok(*fingerprint)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use std::fs;

    use chrono::Utc;
    use tempfile::TempDir;

    use melodeck_core::domain::LibraryPath;

    use super::*;

    fn entry_for(dir: &TempDir, name: &str) -> LibraryEntry {
        let abs = dir.path().join(name);
        let meta = fs::metadata(&abs).unwrap();
        let mtime = meta.modified().map(Into::into).unwrap_or_else(|_| Utc::now());
        LibraryEntry::new(LibraryPath::new(name).unwrap(), meta.len(), mtime)
    }

    #[tokio::test]
    async fn test_fingerprint_deterministic() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.mp3"), b"same content").unwrap();

        let service = FingerprintService::new();
        let entry = entry_for(&dir, "a.mp3");

        let h1 = service.fingerprint(dir.path(), &entry).await.unwrap();
        let h2 = service.fingerprint(dir.path(), &entry).await.unwrap();
        assert_eq!(h1, h2);
    }

    #[tokio::test]
    async fn test_fingerprint_differs_for_different_content() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.mp3"), b"aaa").unwrap();
        fs::write(dir.path().join("b.mp3"), b"bbb").unwrap();

        let service = FingerprintService::new();
        let h1 = service
            .fingerprint(dir.path(), &entry_for(&dir, "a.mp3"))
            .await
            .unwrap();
        let h2 = service
            .fingerprint(dir.path(), &entry_for(&dir, "b.mp3"))
            .await
            .unwrap();
        assert_ne!(h1, h2);
    }

    #[tokio::test]
    async fn test_cache_hashes_once_per_key() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.mp3"), b"cache me").unwrap();

        let service = FingerprintService::new();
        let entry = entry_for(&dir, "a.mp3");

        service.fingerprint(dir.path(), &entry).await.unwrap();
        service.fingerprint(dir.path(), &entry).await.unwrap();
        service.fingerprint(dir.path(), &entry).await.unwrap();

        assert_eq!(service.computations(), 1);
        assert_eq!(service.cached_keys(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_requests_share_one_computation() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("big.flac"), vec![0u8; 256 * 1024]).unwrap();

        let service = Arc::new(FingerprintService::new());
        let entry = entry_for(&dir, "big.flac");
        let root = dir.path().to_path_buf();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let service = Arc::clone(&service);
            let entry = entry.clone();
            let root = root.clone();
            handles.push(tokio::spawn(async move {
                service.fingerprint(&root, &entry).await.unwrap()
            }));
        }

        let mut results = Vec::new();
        for handle in handles {
            results.push(handle.await.unwrap());
        }
        assert!(results.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(service.computations(), 1);
    }

    #[tokio::test]
    async fn test_changed_mtime_is_a_new_key() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.mp3"), b"v1").unwrap();

        let service = FingerprintService::new();
        let entry = entry_for(&dir, "a.mp3");
        service.fingerprint(dir.path(), &entry).await.unwrap();

        // Same path, different captured mtime: must not reuse the cache.
        let shifted = LibraryEntry::new(
            entry.path().clone(),
            entry.size(),
            entry.mtime() + chrono::Duration::seconds(10),
        );
        service.fingerprint(dir.path(), &shifted).await.unwrap();
        assert_eq!(service.computations(), 2);
    }

    #[tokio::test]
    async fn test_missing_file_is_local_error() {
        let dir = TempDir::new().unwrap();
        let entry = LibraryEntry::new(LibraryPath::new("gone.mp3").unwrap(), 3, Utc::now());

        let service = FingerprintService::new();
        let err = service.fingerprint(dir.path(), &entry).await.unwrap_err();
        assert!(matches!(err, SyncError::Fingerprint { .. }));
        assert!(!err.is_fatal());
    }
}
