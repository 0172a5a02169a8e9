//! librqbit-backed engine.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use bytes::Bytes;
use librqbit::api::Api;
use librqbit::{
    AddTorrent, AddTorrentOptions, AddTorrentResponse, ManagedTorrent, Session,
    SessionOptions, SessionPersistenceConfig,
};
use parking_lot::Mutex;
use tracing::{debug, info};

use super::{EngineError, FileReader, TorrentEngine, TorrentHandle, TorrentStats, check_magnet_uri};
use crate::config::TorDavConfig;
use crate::descriptor::{DescriptorFile, InfoHash, TorrentDescriptor};

/// Same definition as librqbit's crate-private `ManagedTorrentHandle`.
type ManagedTorrentHandle = Arc<ManagedTorrent>;

fn backend(err: impl std::fmt::Display) -> EngineError {
    EngineError::Backend {
        reason: err.to_string(),
    }
}

/// Production engine driving a librqbit session.
pub struct RqbitEngine {
    session: Arc<Session>,
    api: Api,
    /// Storage directory of every torrent added through this engine
    storage_dirs: Arc<Mutex<HashMap<InfoHash, PathBuf>>>,
}

impl RqbitEngine {
    /// Opens the session with completion state persisted under the
    /// metadata directory.
    ///
    /// # Errors
    /// - `EngineError::Io` - Metadata directory could not be created
    /// - `EngineError::Backend` - librqbit failed to start the session
    pub async fn start(config: &TorDavConfig) -> Result<Self, EngineError> {
        tokio::fs::create_dir_all(&config.storage.metadata_dir).await?;

        let port = config.engine.listen_port;
        let opts = SessionOptions {
            fastresume: true,
            persistence: Some(SessionPersistenceConfig::Json {
                folder: Some(config.storage.metadata_dir.clone()),
            }),
            listen_port_range: Some(port..port.saturating_add(1)),
            ..Default::default()
        };

        let session = Session::new_with_opts(config.storage.torrents_dir.clone(), opts)
            .await
            .map_err(backend)?;
        let api = Api::new(Arc::clone(&session), None);

        info!("Torrent client listening for peers on port {port}");
        Ok(Self {
            session,
            api,
            storage_dirs: Arc::default(),
        })
    }
}

#[async_trait]
impl TorrentEngine for RqbitEngine {
    async fn add_torrent(
        &self,
        descriptor: &TorrentDescriptor,
        storage_dir: &Path,
    ) -> Result<Arc<dyn TorrentHandle>, EngineError> {
        if let Some(dir) = self.storage_dirs.lock().get(&descriptor.info_hash) {
            if dir.as_path() != storage_dir {
                return Err(EngineError::AlreadyManaged {
                    info_hash: descriptor.info_hash,
                    dir: dir.clone(),
                });
            }
        }

        let opts = AddTorrentOptions {
            overwrite: true,
            output_folder: Some(storage_dir.to_string_lossy().into_owned()),
            ..Default::default()
        };

        let response = self
            .session
            .add_torrent(AddTorrent::from_bytes(descriptor.raw.clone()), Some(opts))
            .await
            .map_err(backend)?;

        let (id, handle) = match response {
            AddTorrentResponse::Added(id, handle) => (id, handle),
            AddTorrentResponse::AlreadyManaged(id, handle) => {
                debug!("Torrent {} already known to the session", descriptor.info_hash);
                (id, handle)
            }
            AddTorrentResponse::ListOnly(_) => {
                return Err(backend("list-only answer to a regular add"));
            }
        };

        handle.wait_until_initialized().await.map_err(backend)?;
        self.storage_dirs
            .lock()
            .insert(descriptor.info_hash, storage_dir.to_path_buf());

        Ok(Arc::new(RqbitTorrent {
            api: self.api.clone(),
            storage_dirs: Arc::clone(&self.storage_dirs),
            id,
            handle,
            descriptor: descriptor.clone(),
        }))
    }

    async fn resolve_magnet(&self, uri: &str) -> Result<Bytes, EngineError> {
        check_magnet_uri(uri)?;

        let opts = AddTorrentOptions {
            list_only: true,
            ..Default::default()
        };
        let response = self
            .session
            .add_torrent(AddTorrent::from_url(uri.to_string()), Some(opts))
            .await
            .map_err(|e| EngineError::InvalidMagnet {
                uri: uri.to_string(),
                reason: e.to_string(),
            })?;

        match response {
            AddTorrentResponse::ListOnly(listing) => Ok(listing.torrent_bytes),
            AddTorrentResponse::Added(..) | AddTorrentResponse::AlreadyManaged(..) => Err(
                backend(format!("magnet {uri} refers to a torrent already in the session")),
            ),
        }
    }

    async fn shutdown(&self) -> Result<(), EngineError> {
        self.session.stop().await;
        Ok(())
    }
}

struct RqbitTorrent {
    api: Api,
    storage_dirs: Arc<Mutex<HashMap<InfoHash, PathBuf>>>,
    id: usize,
    handle: ManagedTorrentHandle,
    descriptor: TorrentDescriptor,
}

#[async_trait]
impl TorrentHandle for RqbitTorrent {
    fn info_hash(&self) -> InfoHash {
        self.descriptor.info_hash
    }

    fn name(&self) -> &str {
        &self.descriptor.name
    }

    fn files(&self) -> &[DescriptorFile] {
        &self.descriptor.files
    }

    fn created_at(&self) -> SystemTime {
        self.descriptor.created_at()
    }

    fn bytes_completed(&self, file_index: usize) -> u64 {
        self.handle
            .stats()
            .file_progress
            .get(file_index)
            .copied()
            .unwrap_or(0)
    }

    fn open_reader(&self, file_index: usize) -> Result<Box<dyn FileReader>, EngineError> {
        if file_index >= self.descriptor.files.len() {
            return Err(EngineError::FileIndexOutOfRange { index: file_index });
        }
        let stream = self.handle.clone().stream(file_index).map_err(backend)?;
        Ok(Box::new(Box::pin(stream)))
    }

    fn stats(&self) -> TorrentStats {
        let stats = self.handle.stats();
        TorrentStats {
            completed_bytes: stats.progress_bytes,
            total_bytes: stats.total_bytes,
            finished: stats.finished,
            peers: stats
                .live
                .as_ref()
                .map(|live| live.snapshot.peer_stats.live),
        }
    }

    async fn drop_torrent(&self) -> Result<(), EngineError> {
        self.api
            .api_torrent_action_forget(self.id.into())
            .await
            .map_err(backend)?;
        self.storage_dirs.lock().remove(&self.descriptor.info_hash);
        Ok(())
    }
}
