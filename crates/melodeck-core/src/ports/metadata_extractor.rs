//! Metadata extraction port
//!
//! Audio tag parsing is polymorphic over file formats: each format binds
//! its own [`MetadataExtractor`], and the scanner dispatches through an
//! [`ExtractorRegistry`] by file extension. Capability objects, not
//! inheritance.

use std::path::Path;
use std::sync::Arc;

use crate::domain::entry::AudioMetadata;

/// Port trait for per-format audio tag extraction
#[async_trait::async_trait]
pub trait MetadataExtractor: Send + Sync {
    /// Human-readable name of the backing format family (for logs)
    fn name(&self) -> &'static str;

    /// Returns true if this extractor handles the (lowercase) extension
    fn handles(&self, extension: &str) -> bool;

    /// Extracts tags from the file
    ///
    /// Corrupt or tagless files should degrade to partially-empty
    /// metadata rather than erroring; an `Err` means the file could not
    /// be opened at all.
    async fn extract(&self, path: &Path) -> anyhow::Result<AudioMetadata>;
}

/// Extension-dispatched collection of extractors
///
/// First registered extractor claiming an extension wins, so specific
/// extractors should be registered before catch-alls.
#[derive(Clone, Default)]
pub struct ExtractorRegistry {
    extractors: Vec<Arc<dyn MetadataExtractor>>,
}

impl ExtractorRegistry {
    /// Creates an empty registry (scans record no audio metadata)
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an extractor (builder style)
    pub fn register(mut self, extractor: Arc<dyn MetadataExtractor>) -> Self {
        self.extractors.push(extractor);
        self
    }

    /// Finds the extractor for a lowercase extension
    pub fn for_extension(&self, extension: &str) -> Option<&Arc<dyn MetadataExtractor>> {
        self.extractors.iter().find(|e| e.handles(extension))
    }

    /// Returns true if some extractor claims the extension
    pub fn recognizes(&self, extension: &str) -> bool {
        self.for_extension(extension).is_some()
    }

    /// Number of registered extractors
    pub fn len(&self) -> usize {
        self.extractors.len()
    }

    /// Returns true if no extractor is registered
    pub fn is_empty(&self) -> bool {
        self.extractors.is_empty()
    }
}

impl std::fmt::Debug for ExtractorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<_> = self.extractors.iter().map(|e| e.name()).collect();
        f.debug_struct("ExtractorRegistry")
            .field("extractors", &names)
            .finish()
    }
}
