//! MeloDeck Diff - Change detection between library snapshots
//!
//! Provides:
//! - [`FingerprintService`] - memoizing, single-flight SHA-256
//!   fingerprinting behind the `Fingerprinter` port
//! - [`DiffEngine`] - two-way snapshot diffing with lazy hashing and
//!   move detection, plus the baseline-aware three-way pass
//!
//! Diffing is a single sequential merge over path-sorted entries: it
//! needs the complete picture and is deliberately not parallelized.
//! Hashing underneath it is concurrency-safe and shared across passes.

pub mod engine;
pub mod fingerprint;
mod three_way;

pub use engine::DiffEngine;
pub use fingerprint::FingerprintService;
