//! tordav core - BitTorrent swarms exposed as read-only filesystems
//!
//! This crate provides the pieces behind the WebDAV frontend: descriptor
//! parsing, the torrent engine boundary, per-torrent virtual filesystems,
//! the streaming route table and the directory-driven torrent lifecycle.

pub mod config;
pub mod descriptor;
pub mod engine;
pub mod lifecycle;
pub mod service;
pub mod tracing_setup;
pub mod vtf;

use std::path::PathBuf;

// Re-export main types for convenient access
pub use config::{ConfigError, TorDavConfig};
pub use descriptor::{DescriptorError, InfoHash, TorrentDescriptor};
pub use engine::{EngineError, SimulatedEngine, TorrentEngine, TorrentHandle};
pub use lifecycle::{DirectoryWatcher, FsChange, LifecycleError, LifecycleManager};
pub use service::{RouteError, RouteTable, TorrentService};
pub use vtf::{FileSession, TorrentFs, VtfError};

/// Core errors that can bubble up from any tordav subsystem.
#[derive(Debug, thiserror::Error)]
pub enum TorDavError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Descriptor error: {0}")]
    Descriptor(#[from] DescriptorError),

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Filesystem error: {0}")]
    Vtf(#[from] VtfError),

    #[error("Routing error: {0}")]
    Route(#[from] RouteError),

    #[error("Lifecycle error: {0}")]
    Lifecycle(#[from] LifecycleError),

    #[error("Torrent already active in {dir:?}")]
    AlreadyActive { dir: PathBuf },

    #[error("Torrent {info_hash} is already active in {existing:?}")]
    DuplicateTorrent {
        info_hash: InfoHash,
        existing: PathBuf,
    },

    #[error("Directory {dir:?} is not below the torrents directory")]
    OutsideRoot { dir: PathBuf },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TorDavError {
    /// Checks if this error stems from a bad descriptor or bad user input
    /// rather than from the engine or the host.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            TorDavError::Config(_)
                | TorDavError::Descriptor(_)
                | TorDavError::Vtf(VtfError::ConflictingPath { .. } | VtfError::InvalidPath { .. })
                | TorDavError::Route(_)
                | TorDavError::DuplicateTorrent { .. }
                | TorDavError::Engine(EngineError::AlreadyManaged { .. })
        )
    }
}

pub type Result<T> = std::result::Result<T, TorDavError>;
