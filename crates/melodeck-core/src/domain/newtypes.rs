//! Validated value objects for the sync domain
//!
//! Newtypes enforce their invariants at construction time so the rest of
//! the core never revalidates: a `LibraryPath` is always a clean relative
//! path, a `Fingerprint` is always 256 bits.

use std::fmt::{self, Display};
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::errors::DomainError;

// ============================================================================
// RunId
// ============================================================================

/// Unique identifier for a sync run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(Uuid);

impl RunId {
    /// Generates a new random run ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Returns the underlying UUID
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RunId {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| DomainError::ValidationFailed(format!("Invalid run ID '{}': {}", s, e)))
    }
}

// ============================================================================
// LibraryPath
// ============================================================================

/// A library-relative file path
///
/// Always relative, `/`-separated regardless of platform, with no empty,
/// `.` or `..` components. This is the unique key of an entry within a
/// snapshot and the ordering key of the diff merge.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct LibraryPath(String);

impl LibraryPath {
    /// Creates a library path from a `/`-separated relative string
    ///
    /// # Errors
    /// Returns `DomainError::InvalidPath` if the string is empty, absolute,
    /// or contains `.`/`..`/empty components or NUL bytes.
    pub fn new(path: impl Into<String>) -> Result<Self, DomainError> {
        let path = path.into();

        if path.is_empty() {
            return Err(DomainError::InvalidPath("path is empty".to_string()));
        }
        if path.contains('\0') {
            return Err(DomainError::InvalidPath(
                "path contains a NUL byte".to_string(),
            ));
        }
        if path.starts_with('/') {
            return Err(DomainError::InvalidPath(format!(
                "path is not relative: {}",
                path
            )));
        }
        for segment in path.split('/') {
            match segment {
                "" => {
                    return Err(DomainError::InvalidPath(format!(
                        "path has an empty component: {}",
                        path
                    )))
                }
                "." | ".." => {
                    return Err(DomainError::InvalidPath(format!(
                        "path has a relative component: {}",
                        path
                    )))
                }
                _ => {}
            }
        }

        Ok(Self(path))
    }

    /// Creates a library path from a filesystem path relative to a root
    ///
    /// Path components are re-joined with `/` so snapshots captured on
    /// different platforms compare equal.
    ///
    /// # Errors
    /// Returns `DomainError::InvalidPath` if `path` contains non-normal
    /// components or non-UTF-8 segments.
    pub fn from_relative(path: &Path) -> Result<Self, DomainError> {
        let mut segments = Vec::new();
        for component in path.components() {
            match component {
                Component::Normal(seg) => {
                    let seg = seg.to_str().ok_or_else(|| {
                        DomainError::InvalidPath(format!("non-UTF-8 path: {}", path.display()))
                    })?;
                    segments.push(seg);
                }
                _ => {
                    return Err(DomainError::InvalidPath(format!(
                        "path is not a clean relative path: {}",
                        path.display()
                    )))
                }
            }
        }
        Self::new(segments.join("/"))
    }

    /// Returns the path as a `/`-separated string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the final path segment (the file name)
    pub fn file_name(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or(&self.0)
    }

    /// Returns the file extension (lowercased), if any
    pub fn extension(&self) -> Option<String> {
        let name = self.file_name();
        let dot = name.rfind('.')?;
        if dot == 0 || dot + 1 == name.len() {
            return None;
        }
        Some(name[dot + 1..].to_ascii_lowercase())
    }

    /// Resolves this relative path under the given root
    pub fn resolve(&self, root: &Path) -> PathBuf {
        let mut out = root.to_path_buf();
        for segment in self.0.split('/') {
            out.push(segment);
        }
        out
    }
}

impl Display for LibraryPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for LibraryPath {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for LibraryPath {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<LibraryPath> for String {
    fn from(path: LibraryPath) -> Self {
        path.0
    }
}

// ============================================================================
// Fingerprint
// ============================================================================

/// A 256-bit content fingerprint
///
/// Computed lazily by the `Fingerprinter` port; equal fingerprints mean
/// equal content for sync purposes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    /// Wraps a raw 256-bit digest
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Parses a fingerprint from its 64-character hex form
    ///
    /// # Errors
    /// Returns `DomainError::InvalidFingerprint` if the string is not
    /// exactly 64 hex characters.
    pub fn from_hex(hex: &str) -> Result<Self, DomainError> {
        if hex.len() != 64 {
            return Err(DomainError::InvalidFingerprint(format!(
                "expected 64 hex characters, got {}",
                hex.len()
            )));
        }
        let mut bytes = [0u8; 32];
        for (i, byte) in bytes.iter_mut().enumerate() {
            let pair = &hex[i * 2..i * 2 + 2];
            *byte = u8::from_str_radix(pair, 16)
                .map_err(|_| DomainError::InvalidFingerprint(format!("not hex: {}", pair)))?;
        }
        Ok(Self(bytes))
    }

    /// Returns the raw digest bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Returns the full lowercase hex form
    pub fn to_hex(&self) -> String {
        let mut out = String::with_capacity(64);
        for byte in &self.0 {
            out.push_str(&format!("{:02x}", byte));
        }
        out
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex = self.to_hex();
        write!(f, "Fingerprint({})", &hex[..12])
    }
}

impl Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex = self.to_hex();
        write!(f, "{}", &hex[..12])
    }
}

impl TryFrom<String> for Fingerprint {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::from_hex(&value)
    }
}

impl From<Fingerprint> for String {
    fn from(fp: Fingerprint) -> Self {
        fp.to_hex()
    }
}

// ============================================================================
// RootPair
// ============================================================================

/// The (source root, destination root) pair a baseline belongs to
///
/// Baselines and run history are keyed by this pair; syncing the same
/// source to two different destinations keeps two independent baselines.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RootPair {
    source: PathBuf,
    dest: PathBuf,
}

impl RootPair {
    /// Creates a root pair
    ///
    /// # Errors
    /// Returns `DomainError::ValidationFailed` if the two roots are equal.
    pub fn new(source: impl Into<PathBuf>, dest: impl Into<PathBuf>) -> Result<Self, DomainError> {
        let source = source.into();
        let dest = dest.into();
        if source == dest {
            return Err(DomainError::ValidationFailed(format!(
                "source and destination roots are the same: {}",
                source.display()
            )));
        }
        Ok(Self { source, dest })
    }

    /// Returns the source root
    pub fn source(&self) -> &Path {
        &self.source
    }

    /// Returns the destination root
    pub fn dest(&self) -> &Path {
        &self.dest
    }

    /// Returns the pair with the roles exchanged
    ///
    /// Used by bidirectional runs for the role-swapped second diff pass.
    pub fn swapped(&self) -> RootPair {
        RootPair {
            source: self.dest.clone(),
            dest: self.source.clone(),
        }
    }
}

impl Display for RootPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.source.display(), self.dest.display())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_path_valid() {
        let p = LibraryPath::new("Artist/Album/01 Track.flac").unwrap();
        assert_eq!(p.as_str(), "Artist/Album/01 Track.flac");
        assert_eq!(p.file_name(), "01 Track.flac");
        assert_eq!(p.extension().as_deref(), Some("flac"));
    }

    #[test]
    fn test_library_path_rejects_absolute() {
        assert!(LibraryPath::new("/etc/passwd").is_err());
    }

    #[test]
    fn test_library_path_rejects_traversal() {
        assert!(LibraryPath::new("a/../b").is_err());
        assert!(LibraryPath::new("..").is_err());
        assert!(LibraryPath::new("./a").is_err());
    }

    #[test]
    fn test_library_path_rejects_empty() {
        assert!(LibraryPath::new("").is_err());
        assert!(LibraryPath::new("a//b").is_err());
    }

    #[test]
    fn test_library_path_ordering() {
        let a = LibraryPath::new("a/b.mp3").unwrap();
        let b = LibraryPath::new("a/c.mp3").unwrap();
        assert!(a < b);
    }

    #[test]
    fn test_library_path_from_relative() {
        let p = LibraryPath::from_relative(Path::new("sub/dir/file.ogg")).unwrap();
        assert_eq!(p.as_str(), "sub/dir/file.ogg");
    }

    #[test]
    fn test_library_path_resolve() {
        let p = LibraryPath::new("a/b.mp3").unwrap();
        let resolved = p.resolve(Path::new("/music"));
        assert_eq!(resolved, PathBuf::from("/music/a/b.mp3"));
    }

    #[test]
    fn test_extension_edge_cases() {
        assert_eq!(LibraryPath::new("noext").unwrap().extension(), None);
        assert_eq!(LibraryPath::new("dir/.hidden").unwrap().extension(), None);
        assert_eq!(
            LibraryPath::new("x.FLAC").unwrap().extension().as_deref(),
            Some("flac")
        );
    }

    #[test]
    fn test_fingerprint_hex_roundtrip() {
        let fp = Fingerprint::from_bytes([0xab; 32]);
        let hex = fp.to_hex();
        assert_eq!(hex.len(), 64);
        assert_eq!(Fingerprint::from_hex(&hex).unwrap(), fp);
    }

    #[test]
    fn test_fingerprint_rejects_bad_hex() {
        assert!(Fingerprint::from_hex("abcd").is_err());
        assert!(Fingerprint::from_hex(&"zz".repeat(32)).is_err());
    }

    #[test]
    fn test_fingerprint_display_is_short() {
        let fp = Fingerprint::from_bytes([0x12; 32]);
        assert_eq!(fp.to_string(), "121212121212");
    }

    #[test]
    fn test_root_pair_rejects_identical_roots() {
        assert!(RootPair::new("/music", "/music").is_err());
        let pair = RootPair::new("/music", "/backup").unwrap();
        assert_eq!(pair.source(), Path::new("/music"));
        assert_eq!(pair.dest(), Path::new("/backup"));
    }

    #[test]
    fn test_run_id_parse_roundtrip() {
        let id = RunId::new();
        let parsed: RunId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }
}
