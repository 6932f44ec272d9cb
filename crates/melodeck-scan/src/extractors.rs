//! lofty-backed audio tag extractors
//!
//! One extractor per format family (ID3, Vorbis comments, MP4 atoms), all
//! sharing the same lofty probe underneath. The registry binds extensions
//! to extractors; the scanner never probes files it has no extractor for.
//!
//! Extraction degrades gracefully: a file with a broken or missing tag
//! yields empty metadata, not an error. Only a file that cannot be opened
//! at all errors.

use std::path::Path;
use std::sync::Arc;

use lofty::config::ParseOptions;
use lofty::file::{AudioFile, TaggedFileExt};
use lofty::probe::Probe;
use lofty::tag::{Accessor, ItemKey};
use tracing::{debug, warn};

use melodeck_core::domain::AudioMetadata;
use melodeck_core::ports::{ExtractorRegistry, MetadataExtractor};

/// Reads tags from `path` with lofty
///
/// Runs on the blocking pool: lofty does synchronous file I/O and parsing.
async fn read_tags(path: &Path) -> anyhow::Result<AudioMetadata> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || read_tags_blocking(&path))
        .await
        .map_err(|e| anyhow::anyhow!("tag extraction task failed: {e}"))?
}

fn read_tags_blocking(path: &Path) -> anyhow::Result<AudioMetadata> {
    let probe = Probe::open(path)?;
    let tagged_file = match probe.options(ParseOptions::new()).read() {
        Ok(f) => f,
        Err(err) => {
            // Unparseable content is a tagging problem, not a sync problem.
            warn!(path = %path.display(), %err, "unparseable audio file, recording no tags");
            return Ok(AudioMetadata::default());
        }
    };

    let duration_ms = tagged_file.properties().duration().as_millis() as u64;

    let tag = tagged_file.primary_tag().or_else(|| tagged_file.first_tag());
    let Some(tag) = tag else {
        debug!(path = %path.display(), "no tag present");
        return Ok(AudioMetadata {
            duration_ms: Some(duration_ms),
            ..Default::default()
        });
    };

    Ok(AudioMetadata {
        title: tag.title().map(|s| s.trim().to_string()),
        artist: tag.artist().map(|s| s.trim().to_string()),
        album: tag.album().map(|s| s.trim().to_string()),
        album_artist: tag
            .get_string(&ItemKey::AlbumArtist)
            .map(|s| s.trim().to_string()),
        track_number: tag.track(),
        genre: tag.genre().map(|s| s.trim().to_string()),
        year: tag.year().map(|y| y as i32),
        duration_ms: Some(duration_ms),
    })
}

// ============================================================================
// Per-format extractors
// ============================================================================

/// ID3v1/ID3v2 tags (MPEG audio, WAV, AIFF)
#[derive(Debug, Default)]
pub struct Id3Extractor;

#[async_trait::async_trait]
impl MetadataExtractor for Id3Extractor {
    fn name(&self) -> &'static str {
        "id3"
    }

    fn handles(&self, extension: &str) -> bool {
        matches!(extension, "mp3" | "wav" | "aiff" | "aif")
    }

    async fn extract(&self, path: &Path) -> anyhow::Result<AudioMetadata> {
        read_tags(path).await
    }
}

/// Vorbis comments (FLAC, Ogg Vorbis, Opus, Speex)
#[derive(Debug, Default)]
pub struct VorbisExtractor;

#[async_trait::async_trait]
impl MetadataExtractor for VorbisExtractor {
    fn name(&self) -> &'static str {
        "vorbis"
    }

    fn handles(&self, extension: &str) -> bool {
        matches!(extension, "flac" | "ogg" | "oga" | "opus" | "spx")
    }

    async fn extract(&self, path: &Path) -> anyhow::Result<AudioMetadata> {
        read_tags(path).await
    }
}

/// MP4 ilst atoms (AAC/ALAC containers)
#[derive(Debug, Default)]
pub struct Mp4Extractor;

#[async_trait::async_trait]
impl MetadataExtractor for Mp4Extractor {
    fn name(&self) -> &'static str {
        "mp4"
    }

    fn handles(&self, extension: &str) -> bool {
        matches!(extension, "m4a" | "m4b" | "mp4" | "aac")
    }

    async fn extract(&self, path: &Path) -> anyhow::Result<AudioMetadata> {
        read_tags(path).await
    }
}

/// Registry with every built-in extractor registered
pub fn default_registry() -> ExtractorRegistry {
    ExtractorRegistry::new()
        .register(Arc::new(Id3Extractor))
        .register(Arc::new(VorbisExtractor))
        .register(Arc::new(Mp4Extractor))
}
