//! Directory-driven torrent lifecycle.
//!
//! The torrents root is the control surface: a directory holding the
//! canonical descriptor is an active torrent, a bare `*.torrent` file is
//! moved into its own directory, and a magnet batch file is resolved into
//! descriptors and deleted. All changes are handled by one consumer task,
//! in arrival order.

pub mod watcher;

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::TorDavError;
use crate::config::{LifecycleConfig, TorDavConfig};
use crate::descriptor::{DescriptorError, TorrentDescriptor, sanitize_name};
use crate::service::TorrentService;
pub use watcher::{DirectoryWatcher, FsChange};

/// Errors raised by the lifecycle machinery itself.
#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("Watcher error: {0}")]
    Watcher(#[from] notify::Error),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Text of the placeholder status file kept in the torrents root.
pub const STATUS_PLACEHOLDER: &str = "Only for WebDav server";

/// Creates the torrents root with its status file placeholder when it does
/// not exist yet. Returns whether the root was created.
///
/// # Errors
/// - `LifecycleError::Io` - The directory or placeholder could not be written
pub async fn prepare_root(config: &TorDavConfig) -> Result<bool, LifecycleError> {
    let root = &config.storage.torrents_dir;
    if tokio::fs::try_exists(root).await? {
        return Ok(false);
    }

    tokio::fs::create_dir_all(root).await?;
    tokio::fs::write(
        root.join(&config.lifecycle.status_file_name),
        STATUS_PLACEHOLDER,
    )
    .await?;
    info!("Created torrents directory {}", root.display());
    Ok(true)
}

/// Reacts to changes under the torrents root.
pub struct LifecycleManager {
    service: Arc<TorrentService>,
    root: PathBuf,
    config: LifecycleConfig,
    watcher: Option<DirectoryWatcher>,
}

impl LifecycleManager {
    /// Creates a manager without a watcher; directories are then only
    /// processed through explicit scans and changes.
    pub fn new(service: Arc<TorrentService>, config: &TorDavConfig) -> Self {
        Self {
            service,
            root: config.storage.torrents_dir.clone(),
            config: config.lifecycle.clone(),
            watcher: None,
        }
    }

    /// Registers every scanned directory with `watcher`.
    pub fn with_watcher(mut self, watcher: DirectoryWatcher) -> Self {
        self.watcher = Some(watcher);
        self
    }

    pub fn service(&self) -> &Arc<TorrentService> {
        &self.service
    }

    /// Scans the whole torrents root.
    pub async fn scan_root(&mut self) {
        let root = self.root.clone();
        self.scan(&root).await;
    }

    /// Walks `dir` and everything below it.
    ///
    /// Every visited directory is watched. A directory below the root
    /// holding the canonical descriptor is activated and not descended
    /// into. Magnet
    /// batches are resolved and bare descriptors moved into their own
    /// directories before those are visited in turn.
    pub async fn scan(&mut self, dir: &Path) {
        let mut pending = vec![dir.to_path_buf()];

        while let Some(dir) = pending.pop() {
            self.watch(&dir);

            if dir != self.root && dir.join(&self.config.descriptor_name).is_file() {
                self.activate(&dir).await;
                continue;
            }

            let batch = dir.join(&self.config.magnet_batch_name);
            if batch.is_file() {
                for descriptor in self.process_magnets(&batch).await {
                    if let Some(new_dir) = self.ingest_descriptor(&descriptor).await {
                        pending.push(new_dir);
                    }
                }
            }

            let entries = match self.list_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) => {
                    error!("Can't read directory {}: {e}", dir.display());
                    continue;
                }
            };

            for (path, is_dir) in entries {
                if is_dir {
                    pending.push(path);
                } else if self.is_bare_descriptor(&path) {
                    pending.extend(self.ingest_descriptor(&path).await);
                }
            }
        }
    }

    async fn list_dir(&self, dir: &Path) -> io::Result<Vec<(PathBuf, bool)>> {
        let mut entries = Vec::new();
        let mut read_dir = tokio::fs::read_dir(dir).await?;
        while let Some(entry) = read_dir.next_entry().await? {
            let is_dir = entry.file_type().await?.is_dir();
            entries.push((entry.path(), is_dir));
        }
        entries.sort();
        Ok(entries)
    }

    fn watch(&mut self, dir: &Path) {
        let Some(watcher) = self.watcher.as_mut() else {
            return;
        };
        if let Err(e) = watcher.watch(dir) {
            error!("Can't watch {}: {e}", dir.display());
        }
    }

    /// Consumes changes until the channel closes.
    pub async fn run(mut self, mut changes: mpsc::UnboundedReceiver<FsChange>) {
        while let Some(change) = changes.recv().await {
            self.handle_change(change).await;
        }
        debug!("Lifecycle change channel closed");
    }

    /// Applies one filesystem change.
    pub async fn handle_change(&mut self, change: FsChange) {
        debug!("Filesystem change: {change:?}");

        match change {
            FsChange::Removed(path) => self.handle_removed(&path).await,
            FsChange::Created(path) => self.handle_created(&path).await,
            FsChange::Written(path) => {
                if self.is_inside_torrent_dir(&path) {
                    return;
                }
                if self.has_name(&path, &self.config.magnet_batch_name) {
                    self.ingest_magnets(&path).await;
                }
            }
        }
    }

    async fn handle_removed(&mut self, path: &Path) {
        if self.has_name(path, &self.config.descriptor_name) {
            if let Some(dir) = path.parent() {
                self.deactivate(dir).await;
            }
        } else if self.service.is_active(path) {
            self.deactivate(path).await;
        }
    }

    async fn handle_created(&mut self, path: &Path) {
        if self.has_name(path, &self.config.descriptor_name) {
            if let Some(dir) = path.parent() {
                self.activate(dir).await;
            }
            return;
        }
        if self.is_inside_torrent_dir(path) {
            return;
        }

        if self.has_name(path, &self.config.magnet_batch_name) {
            self.ingest_magnets(path).await;
            return;
        }

        let metadata = match tokio::fs::metadata(path).await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("{} vanished before it could be handled", path.display());
                return;
            }
            Err(e) => {
                error!("Can't stat {}: {e}", path.display());
                return;
            }
        };

        if metadata.is_dir() {
            self.scan(path).await;
        } else if self.is_bare_descriptor(path) {
            if let Some(new_dir) = self.ingest_descriptor(path).await {
                self.scan(&new_dir).await;
            }
        }
    }

    async fn ingest_magnets(&mut self, batch: &Path) {
        for descriptor in self.process_magnets(batch).await {
            if let Some(new_dir) = self.ingest_descriptor(&descriptor).await {
                self.scan(&new_dir).await;
            }
        }
    }

    fn has_name(&self, path: &Path, name: &str) -> bool {
        path.file_name().is_some_and(|n| n == name)
    }

    /// Whether `path` lives directly in a directory owning a descriptor.
    ///
    /// Content written by the engine into torrent directories is never
    /// interpreted.
    fn is_inside_torrent_dir(&self, path: &Path) -> bool {
        path.parent().is_some_and(|dir| {
            dir != self.root
                && (self.service.is_active(dir)
                    || dir.join(&self.config.descriptor_name).is_file())
        })
    }

    fn is_bare_descriptor(&self, path: &Path) -> bool {
        let is_torrent = path.extension().is_some_and(|ext| ext == "torrent");
        is_torrent
            && !self.has_name(path, &self.config.descriptor_name)
            && !self.has_name(path, &self.config.status_file_name)
    }

    /// Reads a file, retrying once after the configured delay. A missing
    /// file is reported immediately.
    async fn read_with_retry(&self, path: &Path) -> io::Result<Vec<u8>> {
        match tokio::fs::read(path).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(e),
            Err(e) => {
                debug!("Read of {} failed, retrying: {e}", path.display());
                tokio::time::sleep(self.config.retry_delay).await;
                tokio::fs::read(path).await
            }
        }
    }

    /// Loads a descriptor, retrying once when reading or parsing fails.
    async fn load_descriptor(&self, path: &Path) -> Option<TorrentDescriptor> {
        match TorrentDescriptor::load(path).await {
            Ok(descriptor) => return Some(descriptor),
            Err(DescriptorError::Io(e)) if e.kind() == io::ErrorKind::NotFound => {
                debug!("{} vanished before it could be loaded", path.display());
                return None;
            }
            Err(e) => debug!("Loading {} failed, retrying: {e}", path.display()),
        }

        tokio::time::sleep(self.config.retry_delay).await;
        match TorrentDescriptor::load(path).await {
            Ok(descriptor) => Some(descriptor),
            Err(e) => {
                error!("Can't load torrent file {}: {e}", path.display());
                None
            }
        }
    }

    /// Moves a bare descriptor into a new directory named after the torrent.
    ///
    /// Returns the new torrent directory. On any failure the descriptor is
    /// left where it was.
    pub async fn ingest_descriptor(&self, path: &Path) -> Option<PathBuf> {
        let descriptor = self.load_descriptor(path).await?;

        let name = match sanitize_name(&descriptor.name) {
            Ok(name) => name,
            Err(e) => {
                error!("Can't ingest {}: {e}", path.display());
                return None;
            }
        };
        let parent = path.parent()?;
        let dir = parent.join(name);

        if let Err(e) = tokio::fs::create_dir(&dir).await {
            error!("Can't create dir {} for {}: {e}", dir.display(), path.display());
            return None;
        }

        let target = dir.join(&self.config.descriptor_name);
        if let Err(e) = tokio::fs::rename(path, &target).await {
            error!("Can't move {} to {}: {e}", path.display(), target.display());
            if let Err(e) = tokio::fs::remove_dir(&dir).await {
                warn!("Can't clean up {}: {e}", dir.display());
            }
            return None;
        }

        info!(
            "Found new torrent {} in {}",
            descriptor.name,
            path.display()
        );
        Some(dir)
    }

    /// Resolves every magnet link of a batch into a descriptor file next
    /// to it, then deletes the batch.
    ///
    /// Lines are independent: a failing link is reported and skipped. A
    /// batch without any link is left in place. Returns the descriptor
    /// files written.
    pub async fn process_magnets(&self, batch: &Path) -> Vec<PathBuf> {
        let data = match self.read_with_retry(batch).await {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("Magnet batch {} already processed", batch.display());
                return Vec::new();
            }
            Err(e) => {
                error!("Can't read magnet batch {}: {e}", batch.display());
                return Vec::new();
            }
        };
        let Some(dir) = batch.parent() else {
            return Vec::new();
        };

        let contents = String::from_utf8_lossy(&data);
        if contents.trim().is_empty() {
            debug!("Magnet batch {} is empty, waiting for links", batch.display());
            return Vec::new();
        }

        info!("Parsing magnet batch {}", batch.display());
        let mut written = Vec::new();

        for uri in contents.lines().map(str::trim).filter(|line| !line.is_empty()) {
            let bytes = match self.service.engine().resolve_magnet(uri).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!("Can't add magnet {uri} from {}: {e}", batch.display());
                    continue;
                }
            };

            let target = unique_descriptor_path(dir);
            match tokio::fs::write(&target, &bytes).await {
                Ok(()) => {
                    debug!("Wrote {} for {uri}", target.display());
                    written.push(target);
                }
                Err(e) => warn!("Can't write {}: {e}", target.display()),
            }
        }

        if let Err(e) = tokio::fs::remove_file(batch).await {
            warn!("Can't remove magnet batch {}: {e}", batch.display());
        }
        written
    }

    /// Activates the torrent of `dir` unless it is already active.
    pub async fn activate(&self, dir: &Path) {
        if dir == self.root {
            warn!(
                "Ignoring {} in the torrents root itself",
                self.config.descriptor_name
            );
            return;
        }
        if self.service.is_active(dir) {
            debug!("Torrent in {} already active", dir.display());
            return;
        }

        let path = dir.join(&self.config.descriptor_name);
        let Some(descriptor) = self.load_descriptor(&path).await else {
            return;
        };

        match self.service.add_torrent(dir, &descriptor).await {
            Ok(_) => {}
            Err(TorDavError::AlreadyActive { .. }) => {
                debug!("Torrent in {} activated concurrently", dir.display());
            }
            Err(e) if e.is_user_error() => {
                warn!("Can't activate torrent in {}: {e}", dir.display());
            }
            Err(e) => error!("Can't activate torrent in {}: {e}", dir.display()),
        }
    }

    async fn deactivate(&self, dir: &Path) {
        if let Err(e) = self.service.drop_torrent(dir).await {
            error!("Can't drop torrent in {}: {e}", dir.display());
        }
    }
}

fn unique_descriptor_path(dir: &Path) -> PathBuf {
    let mut stamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    loop {
        let candidate = dir.join(format!("{stamp}-from-magnet.torrent"));
        if !candidate.exists() {
            return candidate;
        }
        stamp += 1;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tempfile::TempDir;

    use super::*;
    use crate::engine::SimulatedEngine;
    use crate::engine::sim::build_descriptor;

    #[test]
    fn test_unique_descriptor_path_avoids_existing_files() {
        let dir = TempDir::new().unwrap();
        let first = unique_descriptor_path(dir.path());
        std::fs::write(&first, b"x").unwrap();

        let second = unique_descriptor_path(dir.path());
        assert_ne!(first, second);
        assert!(
            second
                .file_name()
                .unwrap()
                .to_string_lossy()
                .ends_with("-from-magnet.torrent")
        );
    }

    #[tokio::test]
    async fn test_magnet_batch_skips_bad_lines() {
        let dir = TempDir::new().unwrap();
        let config = TorDavConfig::for_testing(dir.path());
        std::fs::create_dir_all(&config.storage.torrents_dir).unwrap();

        let engine = SimulatedEngine::new();
        let uri = "magnet:?xt=urn:btih:0123456789abcdef0123456789abcdef01234567";
        let descriptor = build_descriptor("clip", &[("clip.bin", 10)], None);
        engine.register_magnet(uri, descriptor.clone());
        let service = Arc::new(TorrentService::new(Arc::new(engine.clone()), &config));
        let lifecycle = LifecycleManager::new(service, &config);

        let batch = config.storage.torrents_dir.join("magnets.txt");
        std::fs::write(&batch, format!("{uri}\nmagnet:?dn=nothing\n\n")).unwrap();

        let written = lifecycle.process_magnets(&batch).await;

        assert_eq!(written.len(), 1);
        assert_eq!(std::fs::read(&written[0]).unwrap(), descriptor.to_vec());
        assert!(!batch.exists());
        assert_eq!(engine.active_count(), 0);
    }

    #[tokio::test]
    async fn test_empty_magnet_batch_is_left_in_place() {
        let dir = TempDir::new().unwrap();
        let config = TorDavConfig::for_testing(dir.path());
        std::fs::create_dir_all(&config.storage.torrents_dir).unwrap();

        let service = Arc::new(TorrentService::new(Arc::new(SimulatedEngine::new()), &config));
        let mut lifecycle = LifecycleManager::new(service, &config);
        let batch = config.storage.torrents_dir.join("magnets.txt");

        std::fs::write(&batch, b"").unwrap();
        lifecycle.handle_change(FsChange::Created(batch.clone())).await;
        assert!(batch.exists());

        std::fs::write(&batch, b" \n\t\n").unwrap();
        lifecycle.handle_change(FsChange::Written(batch.clone())).await;
        assert!(batch.exists());
    }

    #[tokio::test]
    async fn test_missing_files_are_not_retried() {
        let dir = TempDir::new().unwrap();
        let mut config = TorDavConfig::for_testing(dir.path());
        config.lifecycle.retry_delay = Duration::from_secs(30);
        std::fs::create_dir_all(&config.storage.torrents_dir).unwrap();

        let service = Arc::new(TorrentService::new(Arc::new(SimulatedEngine::new()), &config));
        let lifecycle = LifecycleManager::new(service, &config);
        let root = config.storage.torrents_dir.clone();

        let outcome = tokio::time::timeout(Duration::from_secs(2), async {
            let written = lifecycle.process_magnets(&root.join("magnets.txt")).await;
            let moved = lifecycle.ingest_descriptor(&root.join("gone.torrent")).await;
            (written, moved)
        })
        .await
        .unwrap();

        assert!(outcome.0.is_empty());
        assert!(outcome.1.is_none());
    }

    #[tokio::test]
    async fn test_prepare_root_writes_placeholder() {
        let dir = TempDir::new().unwrap();
        let config = TorDavConfig::for_testing(dir.path());

        assert!(prepare_root(&config).await.unwrap());
        assert!(!prepare_root(&config).await.unwrap());

        let status = config
            .storage
            .torrents_dir
            .join(&config.lifecycle.status_file_name);
        assert_eq!(
            std::fs::read_to_string(status).unwrap(),
            STATUS_PLACEHOLDER
        );
    }
}
