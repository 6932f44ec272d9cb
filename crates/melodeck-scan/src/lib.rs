//! MeloDeck Scan - Library traversal and tag extraction
//!
//! Driven adapter producing [`Snapshot`]s of library roots:
//! - [`Scanner`] - recursive, skip-and-warn directory walker
//! - [`extractors`] - lofty-backed per-format tag readers behind the
//!   `MetadataExtractor` port
//!
//! Scanning never hashes file content; fingerprints are computed lazily
//! by the diff engine.
//!
//! [`Snapshot`]: melodeck_core::domain::Snapshot

pub mod extractors;
pub mod scanner;

pub use extractors::{default_registry, Id3Extractor, Mp4Extractor, VorbisExtractor};
pub use scanner::{ScanOutcome, ScanWarning, Scanner};
