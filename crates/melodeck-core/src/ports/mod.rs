//! Port definitions (trait interfaces implemented by adapter crates)

pub mod fingerprinter;
pub mod metadata_extractor;
pub mod state_store;

pub use fingerprinter::Fingerprinter;
pub use metadata_extractor::{ExtractorRegistry, MetadataExtractor};
pub use state_store::StateStore;
