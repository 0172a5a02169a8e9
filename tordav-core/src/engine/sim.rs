//! Deterministic in-process engine.
//!
//! Serves generated file contents and exposes knobs for completion
//! progress, registered magnet links and instrumentation counters. Used by
//! the test suites of every crate in the workspace.

use std::collections::HashMap;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::SystemTime;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tracing::debug;

use super::{
    EngineError, FileReader, TorrentEngine, TorrentHandle, TorrentStats, check_magnet_uri,
};
use crate::descriptor::{DescriptorFile, InfoHash, TorrentDescriptor};

/// Piece length used by [`build_descriptor`].
pub const SIM_PIECE_LENGTH: u64 = 16384;

#[derive(Default)]
struct SimState {
    torrents: Mutex<HashMap<InfoHash, Arc<SimulatedTorrent>>>,
    magnets: Mutex<HashMap<String, Bytes>>,
    added: AtomicUsize,
    dropped: AtomicUsize,
    shut_down: AtomicBool,
}

/// Simulated torrent client.
#[derive(Default, Clone)]
pub struct SimulatedEngine {
    state: Arc<SimState>,
}

impl SimulatedEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `uri` resolvable to the given descriptor bytes.
    pub fn register_magnet(&self, uri: impl Into<String>, descriptor: impl Into<Bytes>) {
        self.state
            .magnets
            .lock()
            .insert(uri.into(), descriptor.into());
    }

    /// Active torrent by info hash.
    pub fn torrent(&self, info_hash: &InfoHash) -> Option<Arc<SimulatedTorrent>> {
        self.state.torrents.lock().get(info_hash).cloned()
    }

    pub fn active_count(&self) -> usize {
        self.state.torrents.lock().len()
    }

    /// Number of successful `add_torrent` calls, re-adds included.
    pub fn added_count(&self) -> usize {
        self.state.added.load(Ordering::SeqCst)
    }

    pub fn dropped_count(&self) -> usize {
        self.state.dropped.load(Ordering::SeqCst)
    }

    /// Streaming readers created across all active torrents.
    pub fn readers_opened(&self) -> usize {
        self.state
            .torrents
            .lock()
            .values()
            .map(|torrent| torrent.readers_opened())
            .sum()
    }

    pub fn is_shut_down(&self) -> bool {
        self.state.shut_down.load(Ordering::SeqCst)
    }

    fn ensure_running(&self) -> Result<(), EngineError> {
        if self.is_shut_down() {
            Err(EngineError::EngineShutdown)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl TorrentEngine for SimulatedEngine {
    async fn add_torrent(
        &self,
        descriptor: &TorrentDescriptor,
        storage_dir: &Path,
    ) -> Result<Arc<dyn TorrentHandle>, EngineError> {
        self.ensure_running()?;

        let torrent = {
            let mut torrents = self.state.torrents.lock();
            let torrent = torrents.entry(descriptor.info_hash).or_insert_with(|| {
                Arc::new(SimulatedTorrent::new(descriptor.clone(), storage_dir))
            });
            if torrent.storage_dir.as_path() != storage_dir {
                return Err(EngineError::AlreadyManaged {
                    info_hash: descriptor.info_hash,
                    dir: torrent.storage_dir.clone(),
                });
            }
            Arc::clone(torrent)
        };
        self.state.added.fetch_add(1, Ordering::SeqCst);

        debug!(
            "Simulated engine added {} ({}) at {}",
            descriptor.name,
            descriptor.info_hash,
            storage_dir.display()
        );

        Ok(Arc::new(SimulatedHandle {
            state: Arc::clone(&self.state),
            torrent,
        }))
    }

    async fn resolve_magnet(&self, uri: &str) -> Result<Bytes, EngineError> {
        self.ensure_running()?;
        check_magnet_uri(uri)?;

        self.state
            .magnets
            .lock()
            .get(uri)
            .cloned()
            .ok_or_else(|| EngineError::Backend {
                reason: format!("no peers delivered metadata for {uri}"),
            })
    }

    async fn shutdown(&self) -> Result<(), EngineError> {
        self.state.shut_down.store(true, Ordering::SeqCst);
        self.state.torrents.lock().clear();
        Ok(())
    }
}

/// Torrent state shared by every handle of the same info hash.
pub struct SimulatedTorrent {
    descriptor: TorrentDescriptor,
    storage_dir: PathBuf,
    progress: Vec<AtomicU64>,
    peers: AtomicUsize,
    readers_opened: AtomicUsize,
}

impl SimulatedTorrent {
    fn new(descriptor: TorrentDescriptor, storage_dir: &Path) -> Self {
        let progress = descriptor.files.iter().map(|_| AtomicU64::new(0)).collect();
        Self {
            descriptor,
            storage_dir: storage_dir.to_path_buf(),
            progress,
            peers: AtomicUsize::new(0),
            readers_opened: AtomicUsize::new(0),
        }
    }

    pub fn descriptor(&self) -> &TorrentDescriptor {
        &self.descriptor
    }

    pub fn storage_dir(&self) -> &Path {
        &self.storage_dir
    }

    pub fn set_peers(&self, peers: usize) {
        self.peers.store(peers, Ordering::SeqCst);
    }

    /// Overrides the verified byte count of one file.
    ///
    /// Values above the file length are kept as-is to mimic engines that
    /// over-report.
    pub fn set_bytes_completed(&self, file_index: usize, bytes: u64) {
        if let Some(progress) = self.progress.get(file_index) {
            progress.store(bytes, Ordering::SeqCst);
        }
    }

    pub fn complete_file(&self, file_index: usize) {
        if let Some(file) = self.descriptor.files.get(file_index) {
            self.set_bytes_completed(file_index, file.length);
        }
    }

    pub fn complete_all(&self) {
        for index in 0..self.descriptor.files.len() {
            self.complete_file(index);
        }
    }

    pub fn readers_opened(&self) -> usize {
        self.readers_opened.load(Ordering::SeqCst)
    }

    /// Content served for a file by this engine.
    pub fn content(&self, file_index: usize) -> Option<Bytes> {
        self.descriptor
            .files
            .get(file_index)
            .map(|file| Bytes::from(sim_file_content(file_index, file.length)))
    }
}

struct SimulatedHandle {
    state: Arc<SimState>,
    torrent: Arc<SimulatedTorrent>,
}

#[async_trait]
impl TorrentHandle for SimulatedHandle {
    fn info_hash(&self) -> InfoHash {
        self.torrent.descriptor.info_hash
    }

    fn name(&self) -> &str {
        &self.torrent.descriptor.name
    }

    fn files(&self) -> &[DescriptorFile] {
        &self.torrent.descriptor.files
    }

    fn created_at(&self) -> SystemTime {
        self.torrent.descriptor.created_at()
    }

    fn bytes_completed(&self, file_index: usize) -> u64 {
        self.torrent
            .progress
            .get(file_index)
            .map_or(0, |progress| progress.load(Ordering::SeqCst))
    }

    fn open_reader(&self, file_index: usize) -> Result<Box<dyn FileReader>, EngineError> {
        let content = self
            .torrent
            .content(file_index)
            .ok_or(EngineError::FileIndexOutOfRange { index: file_index })?;
        self.torrent.readers_opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(Cursor::new(content)))
    }

    fn stats(&self) -> TorrentStats {
        let descriptor = &self.torrent.descriptor;
        let completed_bytes = descriptor
            .files
            .iter()
            .enumerate()
            .map(|(index, file)| self.bytes_completed(index).min(file.length))
            .sum();
        TorrentStats {
            completed_bytes,
            total_bytes: descriptor.total_length,
            finished: completed_bytes >= descriptor.total_length,
            peers: Some(self.torrent.peers.load(Ordering::SeqCst)),
        }
    }

    async fn drop_torrent(&self) -> Result<(), EngineError> {
        let removed = self
            .state
            .torrents
            .lock()
            .remove(&self.torrent.descriptor.info_hash);
        if removed.is_some() {
            self.state.dropped.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

/// Deterministic bytes of a simulated file.
pub fn sim_file_content(file_index: usize, length: u64) -> Vec<u8> {
    (0..length)
        .map(|offset| ((offset + file_index as u64 * 31) % 251) as u8)
        .collect()
}

/// Encodes a multi-file descriptor for tests and fixtures.
///
/// `files` holds '/'-separated paths relative to the content root.
pub fn build_descriptor(name: &str, files: &[(&str, u64)], creation_date: Option<i64>) -> Bytes {
    let total: u64 = files.iter().map(|(_, length)| length).sum();
    let piece_count = total.div_ceil(SIM_PIECE_LENGTH).max(1) as usize;

    let mut out = Vec::new();
    out.push(b'd');
    if let Some(secs) = creation_date {
        put_str(&mut out, b"creation date");
        put_int(&mut out, secs);
    }
    put_str(&mut out, b"info");
    out.push(b'd');
    put_str(&mut out, b"files");
    out.push(b'l');
    for (path, length) in files {
        out.push(b'd');
        put_str(&mut out, b"length");
        put_int(&mut out, *length as i64);
        put_str(&mut out, b"path");
        out.push(b'l');
        for component in path.split('/') {
            put_str(&mut out, component.as_bytes());
        }
        out.push(b'e');
        out.push(b'e');
    }
    out.push(b'e');
    put_str(&mut out, b"name");
    put_str(&mut out, name.as_bytes());
    put_str(&mut out, b"piece length");
    put_int(&mut out, SIM_PIECE_LENGTH as i64);
    put_str(&mut out, b"pieces");
    put_str(&mut out, &vec![0u8; piece_count * 20]);
    out.push(b'e');
    out.push(b'e');

    Bytes::from(out)
}

fn put_str(out: &mut Vec<u8>, value: &[u8]) {
    out.extend_from_slice(value.len().to_string().as_bytes());
    out.push(b':');
    out.extend_from_slice(value);
}

fn put_int(out: &mut Vec<u8>, value: i64) {
    out.push(b'i');
    out.extend_from_slice(value.to_string().as_bytes());
    out.push(b'e');
}
