//! Active torrent bookkeeping and the streaming route table.
//!
//! `TorrentService` owns the engine and two maps: active torrents keyed by
//! watched directory, and routes keyed by URL prefix. Every route points at
//! the virtual filesystem of exactly one active torrent.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::config::TorDavConfig;
use crate::descriptor::{InfoHash, TorrentDescriptor};
use crate::engine::{TorrentEngine, TorrentHandle, format_bytes};
use crate::vtf::TorrentFs;
use crate::{Result, TorDavError};

/// Streams one torrent's content under a URL prefix.
#[derive(Debug)]
pub struct Route {
    pub prefix: String,
    pub fs: Arc<TorrentFs>,
}

/// Errors raised by the route table.
#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    #[error("Route {prefix} overlaps existing route {existing}")]
    Overlap { prefix: String, existing: String },
}

/// Segment-aware map from URL prefix to streaming route.
///
/// No registered prefix is ever an ancestor of another, so a request path
/// matches at most one route.
#[derive(Debug, Default)]
pub struct RouteTable {
    routes: RwLock<HashMap<String, Arc<Route>>>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// # Errors
    /// - `RouteError::Overlap` - `prefix` equals, contains or is contained by an existing prefix
    pub fn insert(&self, prefix: String, fs: Arc<TorrentFs>) -> std::result::Result<(), RouteError> {
        let mut routes = self.routes.write();
        if let Some(existing) = routes.keys().find(|existing| {
            strip_path_prefix(existing, &prefix).is_some()
                || strip_path_prefix(&prefix, existing).is_some()
        }) {
            return Err(RouteError::Overlap {
                prefix,
                existing: existing.clone(),
            });
        }
        routes.insert(prefix.clone(), Arc::new(Route { prefix, fs }));
        Ok(())
    }

    pub fn remove(&self, prefix: &str) -> Option<Arc<Route>> {
        self.routes.write().remove(prefix)
    }

    /// Finds the route owning `path` and the remaining sub-path, which
    /// always starts with '/'.
    pub fn lookup(&self, path: &str) -> Option<(Arc<Route>, String)> {
        self.routes.read().values().find_map(|route| {
            strip_path_prefix(&route.prefix, path).map(|sub| (Arc::clone(route), sub.to_string()))
        })
    }

    pub fn len(&self) -> usize {
        self.routes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.read().is_empty()
    }
}

/// Strips `prefix` from `path` on a segment boundary.
///
/// Returns the remainder starting with '/' ("/" for an exact match), or
/// `None` when `path` is not under `prefix`. The prefix "/" matches every
/// absolute path.
pub fn strip_path_prefix<'a>(prefix: &str, path: &'a str) -> Option<&'a str> {
    if prefix == "/" {
        return path.starts_with('/').then_some(path);
    }
    let rest = path.strip_prefix(prefix)?;
    if rest.is_empty() {
        Some("/")
    } else if rest.starts_with('/') {
        Some(rest)
    } else {
        None
    }
}

/// Joins a secret path and a relative '/'-separated path.
pub fn join_url_path(secret: &str, relative: &str) -> String {
    let relative = relative.trim_start_matches('/');
    if secret == "/" {
        format!("/{relative}")
    } else {
        format!("{secret}/{relative}")
    }
}

/// A torrent activated from a watched directory.
pub struct ActiveTorrent {
    pub dir: PathBuf,
    pub prefix: String,
    pub handle: Arc<dyn TorrentHandle>,
}

/// Owns the engine, the set of active torrents and the route table.
pub struct TorrentService {
    engine: Arc<dyn TorrentEngine>,
    torrents_dir: PathBuf,
    secret_path: String,
    active: Mutex<HashMap<PathBuf, ActiveTorrent>>,
    routes: RouteTable,
}

impl TorrentService {
    pub fn new(engine: Arc<dyn TorrentEngine>, config: &TorDavConfig) -> Self {
        Self {
            engine,
            torrents_dir: config.storage.torrents_dir.clone(),
            secret_path: config.server.secret_path.clone(),
            active: Mutex::new(HashMap::new()),
            routes: RouteTable::new(),
        }
    }

    pub fn engine(&self) -> &Arc<dyn TorrentEngine> {
        &self.engine
    }

    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    pub fn torrents_dir(&self) -> &Path {
        &self.torrents_dir
    }

    pub fn is_active(&self, dir: &Path) -> bool {
        self.active.lock().contains_key(dir)
    }

    pub fn active_count(&self) -> usize {
        self.active.lock().len()
    }

    /// Directory of the active torrent with the given info hash.
    pub fn dir_of(&self, info_hash: &InfoHash) -> Option<PathBuf> {
        self.active
            .lock()
            .values()
            .find(|torrent| torrent.handle.info_hash() == *info_hash)
            .map(|torrent| torrent.dir.clone())
    }

    /// URL prefix serving the content of a torrent directory.
    ///
    /// # Errors
    /// - `TorDavError::OutsideRoot` - `dir` is not strictly below the torrents directory
    pub fn prefix_for(&self, dir: &Path) -> Result<String> {
        let outside = || TorDavError::OutsideRoot {
            dir: dir.to_path_buf(),
        };
        let relative = dir.strip_prefix(&self.torrents_dir).map_err(|_| outside())?;

        let mut segments = Vec::new();
        for component in relative.components() {
            match component {
                Component::Normal(segment) => segments.push(segment.to_string_lossy()),
                Component::CurDir => {}
                _ => return Err(outside()),
            }
        }
        if segments.is_empty() {
            return Err(outside());
        }

        Ok(join_url_path(&self.secret_path, &segments.join("/")))
    }

    /// Activates a torrent stored in `dir` and routes its content.
    ///
    /// The engine call runs without holding any service lock. When the
    /// virtual tree or the route cannot be installed the torrent is
    /// dropped from the engine again.
    ///
    /// # Errors
    /// - `TorDavError::AlreadyActive` - `dir` already hosts an active torrent
    /// - `TorDavError::DuplicateTorrent` - The same torrent is active in another directory
    /// - `TorDavError::OutsideRoot` - `dir` is not below the torrents directory
    /// - `TorDavError::Engine` - The engine rejected the torrent
    /// - `TorDavError::Vtf` - The torrent's file list cannot form a tree
    /// - `TorDavError::Route` - The prefix overlaps an existing route
    pub async fn add_torrent(
        &self,
        dir: &Path,
        descriptor: &TorrentDescriptor,
    ) -> Result<Arc<dyn TorrentHandle>> {
        if self.is_active(dir) {
            return Err(TorDavError::AlreadyActive {
                dir: dir.to_path_buf(),
            });
        }
        if let Some(existing) = self.dir_of(&descriptor.info_hash) {
            return Err(TorDavError::DuplicateTorrent {
                info_hash: descriptor.info_hash,
                existing,
            });
        }
        let prefix = self.prefix_for(dir)?;

        info!(
            "Adding torrent {} ({}) from {}",
            descriptor.name,
            descriptor.info_hash,
            dir.display()
        );
        let handle = self.engine.add_torrent(descriptor, dir).await?;

        let fs = match TorrentFs::new(Arc::clone(&handle)) {
            Ok(fs) => Arc::new(fs),
            Err(e) => {
                self.abandon(&handle).await;
                return Err(e.into());
            }
        };
        if let Err(e) = self.routes.insert(prefix.clone(), fs) {
            self.abandon(&handle).await;
            return Err(e.into());
        }

        let raced = {
            let mut active = self.active.lock();
            if active.contains_key(dir) {
                true
            } else {
                active.insert(
                    dir.to_path_buf(),
                    ActiveTorrent {
                        dir: dir.to_path_buf(),
                        prefix: prefix.clone(),
                        handle: Arc::clone(&handle),
                    },
                );
                false
            }
        };
        if raced {
            self.routes.remove(&prefix);
            return Err(TorDavError::AlreadyActive {
                dir: dir.to_path_buf(),
            });
        }

        let stats = handle.stats();
        info!(
            "Torrent {} streaming under {} ({} of {} verified, {} peers)",
            handle.name(),
            prefix,
            format_bytes(stats.completed_bytes),
            format_bytes(stats.total_bytes),
            stats
                .peers
                .map_or_else(|| "unknown".to_string(), |peers| peers.to_string())
        );
        Ok(handle)
    }

    /// Drops a torrent that could not be routed, unless another directory
    /// actively serves the same swarm.
    async fn abandon(&self, handle: &Arc<dyn TorrentHandle>) {
        if let Some(dir) = self.dir_of(&handle.info_hash()) {
            debug!(
                "Keeping torrent {} active in {}",
                handle.name(),
                dir.display()
            );
            return;
        }
        if let Err(e) = handle.drop_torrent().await {
            warn!("Failed to drop rejected torrent {}: {e}", handle.name());
        }
    }

    /// Deactivates the torrent of `dir`, removing its route first.
    ///
    /// Returns whether a torrent was active there. Content on disk is kept.
    ///
    /// # Errors
    /// - `TorDavError::Engine` - The engine failed to drop the torrent
    pub async fn drop_torrent(&self, dir: &Path) -> Result<bool> {
        let Some(torrent) = self.active.lock().remove(dir) else {
            debug!("No active torrent in {}", dir.display());
            return Ok(false);
        };
        self.routes.remove(&torrent.prefix);

        torrent.handle.drop_torrent().await?;
        info!(
            "Dropped torrent {} from {}",
            torrent.handle.name(),
            torrent.dir.display()
        );
        Ok(true)
    }

    /// Human-readable status of every active torrent.
    pub fn status_report(&self) -> String {
        let mut torrents: Vec<(PathBuf, String, Arc<dyn TorrentHandle>)> = self
            .active
            .lock()
            .values()
            .map(|t| (t.dir.clone(), t.prefix.clone(), Arc::clone(&t.handle)))
            .collect();
        torrents.sort_by(|a, b| a.0.cmp(&b.0));

        let mut report = format!("Active torrents: {}\n", torrents.len());
        for (dir, prefix, handle) in torrents {
            let stats = handle.stats();
            let percent = if stats.total_bytes == 0 {
                100.0
            } else {
                stats.completed_bytes as f64 * 100.0 / stats.total_bytes as f64
            };

            let _ = writeln!(report);
            let _ = writeln!(report, "{}", handle.name());
            let _ = writeln!(report, "  info hash: {}", handle.info_hash());
            let _ = writeln!(report, "  directory: {}", dir.display());
            let _ = writeln!(report, "  url: {}", prefix);
            let _ = writeln!(
                report,
                "  progress: {} / {} ({percent:.1}%)",
                format_bytes(stats.completed_bytes),
                format_bytes(stats.total_bytes)
            );
            let state = if stats.finished { "finished" } else { "downloading" };
            let _ = writeln!(report, "  state: {state}");
            if let Some(peers) = stats.peers {
                let _ = writeln!(report, "  peers: {peers}");
            }
        }
        report
    }

    /// Stops the engine. Active torrents are forgotten without dropping
    /// them, so persisted completion state survives.
    ///
    /// # Errors
    /// - `TorDavError::Engine` - The engine failed to shut down
    pub async fn stop(&self) -> Result<()> {
        let count = {
            let mut active = self.active.lock();
            let count = active.len();
            for torrent in active.values() {
                self.routes.remove(&torrent.prefix);
            }
            active.clear();
            count
        };
        info!("Stopping torrent engine with {count} active torrents");
        self.engine.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::engine::sim::build_descriptor;
    use crate::engine::{EngineError, SimulatedEngine};

    fn descriptor(name: &str) -> TorrentDescriptor {
        TorrentDescriptor::from_bytes(build_descriptor(
            name,
            &[("a/b.txt", 10), ("c.txt", 5)],
            None,
        ))
        .unwrap()
    }

    fn service(root: &TempDir, secret: &str) -> (SimulatedEngine, TorrentService) {
        let engine = SimulatedEngine::new();
        let mut config = TorDavConfig::for_testing(root.path());
        config.server.secret_path = secret.to_string();
        let service = TorrentService::new(Arc::new(engine.clone()), &config);
        (engine, service)
    }

    #[test]
    fn test_strip_path_prefix_is_segment_aware() {
        assert_eq!(strip_path_prefix("/movie", "/movie"), Some("/"));
        assert_eq!(strip_path_prefix("/movie", "/movie/a.mkv"), Some("/a.mkv"));
        assert_eq!(strip_path_prefix("/movie", "/movies/a.mkv"), None);
        assert_eq!(strip_path_prefix("/movie", "/other"), None);
        assert_eq!(strip_path_prefix("/", "/anything"), Some("/anything"));
    }

    #[test]
    fn test_join_url_path() {
        assert_eq!(join_url_path("/", "movie"), "/movie");
        assert_eq!(join_url_path("/s3cret", "movie/part"), "/s3cret/movie/part");
    }

    #[tokio::test]
    async fn test_prefix_for_joins_secret_and_relative_dir() {
        let root = TempDir::new().unwrap();
        let (_engine, service) = service(&root, "/s3cret");
        let torrents = service.torrents_dir().to_path_buf();

        assert_eq!(
            service.prefix_for(&torrents.join("series").join("s01")).unwrap(),
            "/s3cret/series/s01"
        );
        assert!(matches!(
            service.prefix_for(&torrents),
            Err(TorDavError::OutsideRoot { .. })
        ));
        assert!(matches!(
            service.prefix_for(Path::new("/elsewhere")),
            Err(TorDavError::OutsideRoot { .. })
        ));
    }

    #[tokio::test]
    async fn test_add_routes_and_drop_unroutes() {
        let root = TempDir::new().unwrap();
        let (engine, service) = service(&root, "/");
        let dir = service.torrents_dir().join("movie");

        service.add_torrent(&dir, &descriptor("movie")).await.unwrap();
        assert!(service.is_active(&dir));
        let (route, sub) = service.routes().lookup("/movie/a/b.txt").unwrap();
        assert_eq!(route.prefix, "/movie");
        assert_eq!(sub, "/a/b.txt");

        assert!(service.drop_torrent(&dir).await.unwrap());
        assert!(!service.is_active(&dir));
        assert!(service.routes().lookup("/movie/a/b.txt").is_none());
        assert_eq!(engine.dropped_count(), 1);

        assert!(!service.drop_torrent(&dir).await.unwrap());
    }

    #[tokio::test]
    async fn test_second_add_of_same_dir_is_rejected() {
        let root = TempDir::new().unwrap();
        let (engine, service) = service(&root, "/");
        let dir = service.torrents_dir().join("movie");

        service.add_torrent(&dir, &descriptor("movie")).await.unwrap();
        assert!(matches!(
            service.add_torrent(&dir, &descriptor("movie")).await,
            Err(TorDavError::AlreadyActive { .. })
        ));
        assert_eq!(engine.added_count(), 1);
        assert_eq!(service.routes().len(), 1);
    }

    #[tokio::test]
    async fn test_nested_torrent_directories_are_rejected() {
        let root = TempDir::new().unwrap();
        let (engine, service) = service(&root, "/");
        let outer = service.torrents_dir().join("outer");
        let inner = outer.join("inner");

        service.add_torrent(&outer, &descriptor("outer")).await.unwrap();
        assert!(matches!(
            service.add_torrent(&inner, &descriptor("inner")).await,
            Err(TorDavError::Route(RouteError::Overlap { .. }))
        ));

        assert!(!service.is_active(&inner));
        assert_eq!(engine.dropped_count(), 1);
        assert_eq!(engine.active_count(), 1);
    }

    #[tokio::test]
    async fn test_status_report_lists_torrents() {
        let root = TempDir::new().unwrap();
        let (engine, service) = service(&root, "/");
        let dir = service.torrents_dir().join("movie");
        let descriptor = descriptor("movie");

        service.add_torrent(&dir, &descriptor).await.unwrap();
        engine
            .torrent(&descriptor.info_hash)
            .unwrap()
            .complete_file(1);

        let report = service.status_report();
        assert!(report.starts_with("Active torrents: 1\n"));
        assert!(report.contains("movie"));
        assert!(report.contains(&descriptor.info_hash.to_string()));
        assert!(report.contains("5 B / 15 B (33.3%)"));
        assert!(report.contains("state: downloading"));
        assert!(report.contains("peers: 0"));

        engine.torrent(&descriptor.info_hash).unwrap().set_peers(3);
        assert!(service.status_report().contains("peers: 3"));
    }

    #[tokio::test]
    async fn test_same_torrent_in_second_dir_is_rejected() {
        let root = TempDir::new().unwrap();
        let (engine, service) = service(&root, "/");
        let first = service.torrents_dir().join("first");
        let second = service.torrents_dir().join("second");
        let descriptor = descriptor("movie");

        service.add_torrent(&first, &descriptor).await.unwrap();
        assert!(matches!(
            service.add_torrent(&second, &descriptor).await,
            Err(TorDavError::DuplicateTorrent { existing, .. }) if existing == first
        ));
        assert_eq!(service.dir_of(&descriptor.info_hash), Some(first.clone()));

        assert!(!service.drop_torrent(&second).await.unwrap());
        assert!(service.is_active(&first));
        assert!(service.routes().lookup("/first/c.txt").is_some());
        assert_eq!(engine.active_count(), 1);
        assert_eq!(engine.dropped_count(), 0);
    }

    #[tokio::test]
    async fn test_engine_rejection_of_second_dir_keeps_first() {
        let root = TempDir::new().unwrap();
        let (engine, service) = service(&root, "/");
        let first = service.torrents_dir().join("first");
        let second = service.torrents_dir().join("second");
        let descriptor = descriptor("movie");

        engine.add_torrent(&descriptor, &first).await.unwrap();

        assert!(matches!(
            service.add_torrent(&second, &descriptor).await,
            Err(TorDavError::Engine(EngineError::AlreadyManaged { .. }))
        ));
        assert!(!service.is_active(&second));
        assert!(service.routes().is_empty());
        assert_eq!(engine.dropped_count(), 0);
    }

    #[tokio::test]
    async fn test_stop_shuts_engine_down() {
        let root = TempDir::new().unwrap();
        let (engine, service) = service(&root, "/");
        let dir = service.torrents_dir().join("movie");
        service.add_torrent(&dir, &descriptor("movie")).await.unwrap();

        service.stop().await.unwrap();
        assert!(engine.is_shut_down());
        assert_eq!(service.active_count(), 0);
        assert!(service.routes().is_empty());
        assert_eq!(engine.dropped_count(), 0);
    }
}
