//! Torrent descriptor (`.torrent` file) parsing.
//!
//! Metadata extraction uses bencode-rs; the info hash is the SHA-1 of the
//! raw `info` dictionary bytes.

pub mod bencode;

use std::fmt;
use std::path::Path;
use std::time::{Duration, SystemTime};

use bytes::Bytes;

pub use bencode::BencodeParser;

/// SHA-1 hash identifying a unique torrent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InfoHash([u8; 20]);

impl InfoHash {
    /// Creates InfoHash from 20-byte SHA-1 hash.
    pub fn new(hash: [u8; 20]) -> Self {
        Self(hash)
    }

    /// Returns reference to underlying 20-byte hash.
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl fmt::Display for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// Complete metadata extracted from a descriptor file.
///
/// Keeps the raw bytes so the engine can be handed the exact descriptor
/// that was read from disk.
#[derive(Debug, Clone, PartialEq)]
pub struct TorrentDescriptor {
    pub info_hash: InfoHash,
    pub name: String,
    pub piece_length: u64,
    pub total_length: u64,
    pub files: Vec<DescriptorFile>,
    /// Value of the optional "creation date" key, seconds since the epoch
    pub creation_date: Option<i64>,
    pub raw: Bytes,
}

/// Individual file within a torrent.
///
/// `path` is relative to the torrent's content root: a single-file torrent
/// yields `[name]`, multi-file torrents yield their declared components.
#[derive(Debug, Clone, PartialEq)]
pub struct DescriptorFile {
    pub path: Vec<String>,
    pub length: u64,
}

impl DescriptorFile {
    /// Path components joined with '/'.
    pub fn display_path(&self) -> String {
        self.path.join("/")
    }
}

impl TorrentDescriptor {
    /// Parses descriptor bytes.
    ///
    /// # Errors
    /// - `DescriptorError::Malformed` - Invalid bencode or missing fields
    pub fn from_bytes(data: impl Into<Bytes>) -> Result<Self, DescriptorError> {
        BencodeParser::parse_descriptor(data.into())
    }

    /// Reads and parses a descriptor file.
    ///
    /// # Errors
    /// - `DescriptorError::Io` - File could not be read
    /// - `DescriptorError::Malformed` - Invalid descriptor contents
    pub async fn load(path: &Path) -> Result<Self, DescriptorError> {
        let data = tokio::fs::read(path).await?;
        Self::from_bytes(data)
    }

    /// Creation time of the torrent, falling back to the Unix epoch.
    pub fn created_at(&self) -> SystemTime {
        match self.creation_date {
            Some(secs) if secs > 0 => SystemTime::UNIX_EPOCH + Duration::from_secs(secs as u64),
            _ => SystemTime::UNIX_EPOCH,
        }
    }
}

/// Errors that can occur while reading descriptors.
#[derive(Debug, thiserror::Error)]
pub enum DescriptorError {
    #[error("Failed to parse torrent descriptor: {reason}")]
    Malformed { reason: String },

    #[error("Torrent name {name:?} cannot be used as a directory name")]
    UnsafeName { name: String },

    #[error("I/O error")]
    Io(#[from] std::io::Error),
}

/// Turns a torrent's declared name into a single safe path component.
///
/// Separators, reserved characters and control characters are replaced by
/// '_' and surrounding whitespace is trimmed.
///
/// # Errors
/// - `DescriptorError::UnsafeName` - Name is empty or made only of dots after cleaning
pub fn sanitize_name(name: &str) -> Result<String, DescriptorError> {
    let cleaned: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    let cleaned = cleaned.trim();

    if cleaned.is_empty() || cleaned.chars().all(|c| c == '.') {
        return Err(DescriptorError::UnsafeName {
            name: name.to_string(),
        });
    }

    Ok(cleaned.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_info_hash_display() {
        let hash = [
            0x01, 0x23, 0x45, 0x67, 0x89, 0xab, 0xcd, 0xef, 0x01, 0x23, 0x45, 0x67, 0x89, 0xab,
            0xcd, 0xef, 0x01, 0x23, 0x45, 0x67,
        ];
        assert_eq!(
            InfoHash::new(hash).to_string(),
            "0123456789abcdef0123456789abcdef01234567"
        );
    }

    #[test]
    fn test_sanitize_name_replaces_separators() {
        assert_eq!(sanitize_name("Some/Movie").unwrap(), "Some_Movie");
        assert_eq!(sanitize_name("a\\b:c").unwrap(), "a_b_c");
        assert_eq!(sanitize_name("  Album (2001)  ").unwrap(), "Album (2001)");
    }

    #[test]
    fn test_sanitize_name_rejects_unusable_names() {
        assert!(sanitize_name("").is_err());
        assert!(sanitize_name("   ").is_err());
        assert!(sanitize_name(".").is_err());
        assert!(sanitize_name("..").is_err());
    }

    #[test]
    fn test_created_at_falls_back_to_epoch() {
        let mut descriptor = BencodeParser::parse_descriptor(Bytes::from_static(
            b"d4:infod6:lengthi5e4:name5:a.txt12:piece lengthi16384e6:pieces20:aaaaaaaaaaaaaaaaaaaaee",
        ))
        .unwrap();
        assert_eq!(descriptor.created_at(), SystemTime::UNIX_EPOCH);

        descriptor.creation_date = Some(1_700_000_000);
        assert_eq!(
            descriptor.created_at(),
            SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000)
        );
    }
}
