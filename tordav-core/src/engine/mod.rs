//! Torrent engine boundary.
//!
//! The peer wire, piece scheduling, trackers and on-disk piece storage all
//! live behind these traits. `RqbitEngine` drives librqbit in production,
//! `SimulatedEngine` is a deterministic in-process engine for tests.

#[cfg(feature = "rqbit")]
pub mod rqbit;
pub mod sim;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncSeek};

use crate::descriptor::{DescriptorFile, InfoHash, TorrentDescriptor};

#[cfg(feature = "rqbit")]
pub use rqbit::RqbitEngine;
pub use sim::SimulatedEngine;

/// Streaming reader over one file of a torrent.
///
/// Reads block until the requested pieces are available.
pub trait FileReader: AsyncRead + AsyncSeek + Send + Unpin {}

impl<T> FileReader for T where T: AsyncRead + AsyncSeek + Send + Unpin {}

/// Point-in-time download statistics of one torrent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TorrentStats {
    pub completed_bytes: u64,
    pub total_bytes: u64,
    pub finished: bool,
    /// Connected peers, when the engine reports them
    pub peers: Option<usize>,
}

/// Handle to one active swarm.
#[async_trait]
pub trait TorrentHandle: Send + Sync {
    fn info_hash(&self) -> InfoHash;

    fn name(&self) -> &str;

    /// Files in declaration order; the position is the file index.
    fn files(&self) -> &[DescriptorFile];

    /// Timestamp inherited by every node of the virtual tree.
    fn created_at(&self) -> SystemTime;

    /// Verified bytes of the given file.
    fn bytes_completed(&self, file_index: usize) -> u64;

    /// Creates an independent streaming reader for a file.
    ///
    /// # Errors
    /// - `EngineError::FileIndexOutOfRange` - No such file in the torrent
    /// - `EngineError::Backend` - The engine refused to create the stream
    fn open_reader(&self, file_index: usize) -> Result<Box<dyn FileReader>, EngineError>;

    fn stats(&self) -> TorrentStats;

    /// Detaches the torrent from the engine. Downloaded data stays on disk.
    ///
    /// # Errors
    /// - `EngineError::Backend` - The engine failed to forget the torrent
    async fn drop_torrent(&self) -> Result<(), EngineError>;
}

/// The process-wide torrent client.
#[async_trait]
pub trait TorrentEngine: Send + Sync {
    /// Registers a torrent storing its content under `storage_dir` and
    /// waits until its metadata is available.
    ///
    /// Adding a torrent again with the same `storage_dir` returns a handle
    /// to the existing swarm. A torrent has exactly one storage directory.
    ///
    /// # Errors
    /// - `EngineError::AlreadyManaged` - The torrent is stored in another directory
    /// - `EngineError::Backend` - The engine rejected the descriptor
    async fn add_torrent(
        &self,
        descriptor: &TorrentDescriptor,
        storage_dir: &Path,
    ) -> Result<Arc<dyn TorrentHandle>, EngineError>;

    /// Resolves a magnet URI into descriptor bytes.
    ///
    /// Blocks until the swarm delivered the metadata. No swarm registration
    /// is left behind.
    ///
    /// # Errors
    /// - `EngineError::InvalidMagnet` - The URI is not a usable magnet link
    /// - `EngineError::Backend` - Metadata could not be fetched
    async fn resolve_magnet(&self, uri: &str) -> Result<Bytes, EngineError>;

    /// Stops the client and closes completion persistence.
    ///
    /// # Errors
    /// - `EngineError::Backend` - The engine failed to shut down cleanly
    async fn shutdown(&self) -> Result<(), EngineError>;
}

/// Errors reported by the torrent engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Invalid magnet link {uri:?}: {reason}")]
    InvalidMagnet { uri: String, reason: String },

    #[error("Torrent {info_hash} is already stored in {dir:?}")]
    AlreadyManaged { info_hash: InfoHash, dir: PathBuf },

    #[error("File index {index} out of range")]
    FileIndexOutOfRange { index: usize },

    #[error("Torrent engine error: {reason}")]
    Backend { reason: String },

    #[error("Torrent engine has been shut down")]
    EngineShutdown,

    #[error("I/O error")]
    Io(#[from] std::io::Error),
}

/// Cheap syntactic check shared by engines before touching the network.
///
/// # Errors
/// - `EngineError::InvalidMagnet` - Missing scheme or `xt=urn:btih:` topic
pub fn check_magnet_uri(uri: &str) -> Result<(), EngineError> {
    let invalid = |reason: &str| EngineError::InvalidMagnet {
        uri: uri.to_string(),
        reason: reason.to_string(),
    };

    let query = uri
        .strip_prefix("magnet:?")
        .ok_or_else(|| invalid("missing magnet:? scheme"))?;

    let has_topic = query
        .split('&')
        .filter_map(|param| param.strip_prefix("xt=urn:btih:"))
        .any(|hash| {
            (hash.len() == 40 && hash.chars().all(|c| c.is_ascii_hexdigit()))
                || (hash.len() == 32 && hash.chars().all(|c| c.is_ascii_alphanumeric()))
        });

    if has_topic {
        Ok(())
    } else {
        Err(invalid("missing or invalid xt=urn:btih: topic"))
    }
}

/// Formats a byte count with binary units, e.g. `1.5 MiB`.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];

    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }

    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_magnet_uri_accepts_hex_and_base32() {
        assert!(check_magnet_uri("magnet:?xt=urn:btih:0123456789abcdef0123456789abcdef01234567").is_ok());
        assert!(
            check_magnet_uri("magnet:?dn=x&xt=urn:btih:ABCDEFGHIJKLMNOPQRSTUVWXYZ234567").is_ok()
        );
    }

    #[test]
    fn test_check_magnet_uri_rejects_garbage() {
        assert!(check_magnet_uri("").is_err());
        assert!(check_magnet_uri("http://example.com").is_err());
        assert!(check_magnet_uri("magnet:?xt=urn:btih:tooshort").is_err());
        assert!(check_magnet_uri("magnet:?dn=only-a-name").is_err());
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(1023), "1023 B");
        assert_eq!(format_bytes(1536), "1.5 KiB");
        assert_eq!(format_bytes(5 * 1024 * 1024 * 1024), "5.0 GiB");
    }
}
