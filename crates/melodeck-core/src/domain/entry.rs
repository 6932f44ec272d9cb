//! Library entries and audio metadata
//!
//! A [`LibraryEntry`] is the unit a scan produces: one file under a root,
//! captured with its size and modification time. Entries are immutable once
//! captured; the lazily computed fingerprint lives in the diff engine's
//! cache and on the operations it emits, never back-filled into an entry.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::newtypes::{Fingerprint, LibraryPath};

/// Audio tag metadata extracted during scanning
///
/// Opaque to sync decisions: the diff engine never looks at it. It rides
/// along on entries so collaborators (library views, conflict dialogs) can
/// show human-readable names instead of paths.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioMetadata {
    /// Track title
    pub title: Option<String>,
    /// Primary artist
    pub artist: Option<String>,
    /// Album name
    pub album: Option<String>,
    /// Album artist (compilations)
    pub album_artist: Option<String>,
    /// Track number on the album
    pub track_number: Option<u32>,
    /// Genre classification
    pub genre: Option<String>,
    /// Release year
    pub year: Option<i32>,
    /// Duration in milliseconds
    pub duration_ms: Option<u64>,
}

impl AudioMetadata {
    /// Returns true if no tag field was extracted
    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.artist.is_none()
            && self.album.is_none()
            && self.album_artist.is_none()
            && self.track_number.is_none()
            && self.genre.is_none()
            && self.year.is_none()
            && self.duration_ms.is_none()
    }
}

/// A single file captured by a scan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LibraryEntry {
    /// Library-relative path, unique within a snapshot
    path: LibraryPath,
    /// Size in bytes
    size: u64,
    /// Last modification time
    mtime: DateTime<Utc>,
    /// Content fingerprint, present only when it was already known at
    /// capture time (e.g. entries reconstructed from a baseline)
    fingerprint: Option<Fingerprint>,
    /// Extracted audio tags for recognized formats
    audio: Option<AudioMetadata>,
}

impl LibraryEntry {
    /// Creates an entry from scan metadata
    pub fn new(path: LibraryPath, size: u64, mtime: DateTime<Utc>) -> Self {
        Self {
            path,
            size,
            mtime,
            fingerprint: None,
            audio: None,
        }
    }

    /// Attaches a known fingerprint (builder style, used when entries are
    /// rebuilt from persisted state)
    pub fn with_fingerprint(mut self, fingerprint: Fingerprint) -> Self {
        self.fingerprint = Some(fingerprint);
        self
    }

    /// Attaches extracted audio metadata (builder style)
    pub fn with_audio(mut self, audio: AudioMetadata) -> Self {
        self.audio = Some(audio);
        self
    }

    /// Returns the library-relative path
    pub fn path(&self) -> &LibraryPath {
        &self.path
    }

    /// Returns the size in bytes
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Returns the last modification time
    pub fn mtime(&self) -> DateTime<Utc> {
        self.mtime
    }

    /// Returns the fingerprint if it was known at capture time
    pub fn fingerprint(&self) -> Option<&Fingerprint> {
        self.fingerprint.as_ref()
    }

    /// Returns the extracted audio metadata, if any
    pub fn audio(&self) -> Option<&AudioMetadata> {
        self.audio.as_ref()
    }
}
