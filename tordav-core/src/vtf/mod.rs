//! Read-only virtual filesystem over one active torrent.
//!
//! The tree is built once from the torrent's file list and never changes.
//! Paths are '/'-separated and relative to the torrent's content root, so
//! the root directory is `/` and a single-file torrent exposes `/<name>`.
//! Reads go through engine streaming readers and block until the pieces
//! they need are verified.

pub mod node;
pub mod session;

use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, warn};

use crate::engine::{EngineError, TorrentHandle};
pub use node::{NodeId, NodeInfo, NodeKind, ROOT, VirtualNode};
pub use session::FileSession;

/// Errors surfaced by virtual filesystem operations.
#[derive(Debug, thiserror::Error)]
pub enum VtfError {
    #[error("No such file or directory: {path}")]
    NotFound { path: String },

    #[error("Read-only filesystem: {path}")]
    PermissionDenied { path: String },

    #[error("Operation not supported on {path}")]
    InvalidOperation { path: String },

    #[error("File session already closed")]
    Closed,

    #[error("Torrent declares conflicting entries at {path}")]
    ConflictingPath { path: String },

    #[error("Torrent declares an unusable file path: {path}")]
    InvalidPath { path: String },

    #[error("Engine error")]
    Engine(#[from] EngineError),

    #[error("I/O error")]
    Io(#[from] std::io::Error),
}

/// Virtual tree of one torrent plus per-file completion latches.
pub struct TorrentFs {
    handle: Arc<dyn TorrentHandle>,
    nodes: Vec<VirtualNode>,
    lookup: HashMap<String, NodeId>,
    complete: Vec<AtomicBool>,
}

impl std::fmt::Debug for TorrentFs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TorrentFs")
            .field("torrent", &self.handle.name())
            .field("nodes", &self.nodes.len())
            .finish()
    }
}

impl TorrentFs {
    /// Builds the tree from the torrent's file list.
    ///
    /// Intermediate directories are created once and shared. Every node
    /// inherits the torrent's creation time.
    ///
    /// # Errors
    /// - `VtfError::InvalidPath` - A file has no components or an empty, "." or ".." component
    /// - `VtfError::ConflictingPath` - Two entries claim the same path, or a file
    ///   sits where a directory is needed
    pub fn new(handle: Arc<dyn TorrentHandle>) -> Result<Self, VtfError> {
        let modified = handle.created_at();
        let mut nodes = vec![VirtualNode::directory("/", modified)];
        let mut lookup = HashMap::from([("/".to_string(), ROOT)]);

        for (file_index, file) in handle.files().iter().enumerate() {
            let Some((file_name, dirs)) = file.path.split_last() else {
                return Err(VtfError::InvalidPath {
                    path: String::new(),
                });
            };
            if file.path.iter().any(|c| !is_valid_component(c)) {
                return Err(VtfError::InvalidPath {
                    path: file.display_path(),
                });
            }

            let mut parent = ROOT;
            let mut path = String::new();
            for dir in dirs {
                path.push('/');
                path.push_str(dir);
                parent = match lookup.get(&path) {
                    Some(&id) if nodes[id.0].is_dir() => id,
                    Some(_) => return Err(VtfError::ConflictingPath { path }),
                    None => {
                        let node = VirtualNode::directory(dir.as_str(), modified);
                        let id = attach(&mut nodes, parent, node);
                        lookup.insert(path.clone(), id);
                        id
                    }
                };
            }

            path.push('/');
            path.push_str(file_name);
            if lookup.contains_key(&path) {
                return Err(VtfError::ConflictingPath { path });
            }
            let id = attach(
                &mut nodes,
                parent,
                VirtualNode::file(file_name.as_str(), file_index, file.length, modified),
            );
            lookup.insert(path, id);
        }

        debug!(
            "Built virtual tree for {} with {} nodes",
            handle.name(),
            nodes.len()
        );

        let complete = nodes.iter().map(|_| AtomicBool::new(false)).collect();
        Ok(Self {
            handle,
            nodes,
            lookup,
            complete,
        })
    }

    pub fn handle(&self) -> &Arc<dyn TorrentHandle> {
        &self.handle
    }

    pub fn node(&self, id: NodeId) -> &VirtualNode {
        &self.nodes[id.0]
    }

    /// Number of nodes including the root.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.len() == 1
    }

    pub fn lookup(&self, path: &str) -> Option<NodeId> {
        self.lookup.get(normalize_path(path).as_ref()).copied()
    }

    /// Metadata of the node at `path`.
    ///
    /// # Errors
    /// - `VtfError::NotFound` - No node at `path`
    pub fn stat(&self, path: &str) -> Result<NodeInfo, VtfError> {
        self.lookup(path)
            .map(|id| self.node(id).info())
            .ok_or_else(|| VtfError::NotFound {
                path: path.to_string(),
            })
    }

    /// Children of a directory node, in declaration order.
    pub fn children(&self, id: NodeId) -> Vec<NodeInfo> {
        match &self.node(id).kind {
            NodeKind::Directory { children } => {
                children.iter().map(|child| self.node(*child).info()).collect()
            }
            NodeKind::File { .. } => Vec::new(),
        }
    }

    /// Whether reads of `path` can be served from plain on-disk files.
    ///
    /// Unknown paths and directories count as complete. A file becomes
    /// complete once the engine reports all of its bytes verified, and
    /// stays complete for the lifetime of this tree.
    pub fn is_complete(&self, path: &str) -> bool {
        let Some(id) = self.lookup(path) else {
            return true;
        };
        let NodeKind::File { file_index, size } = self.node(id).kind else {
            return true;
        };

        if self.complete[id.0].load(Ordering::Acquire) {
            return true;
        }

        let done = self.handle.bytes_completed(file_index);
        if done > size {
            warn!("Engine reports {done} verified bytes for {path} but the file has {size}");
        }
        let complete = done >= size;
        if complete {
            self.complete[id.0].store(true, Ordering::Release);
        }
        complete
    }

    /// Opens a session on a file or directory.
    ///
    /// # Errors
    /// - `VtfError::NotFound` - No node at `path`
    pub fn open(self: &Arc<Self>, path: &str) -> Result<FileSession, VtfError> {
        let id = self.lookup(path).ok_or_else(|| VtfError::NotFound {
            path: path.to_string(),
        })?;
        Ok(FileSession::new(Arc::clone(self), id))
    }

    /// # Errors
    /// Always `VtfError::PermissionDenied`
    pub fn create_dir(&self, path: &str) -> Result<(), VtfError> {
        Err(VtfError::PermissionDenied {
            path: path.to_string(),
        })
    }

    /// # Errors
    /// Always `VtfError::PermissionDenied`
    pub fn remove(&self, path: &str) -> Result<(), VtfError> {
        Err(VtfError::PermissionDenied {
            path: path.to_string(),
        })
    }

    /// # Errors
    /// Always `VtfError::PermissionDenied`
    pub fn rename(&self, from: &str, _to: &str) -> Result<(), VtfError> {
        Err(VtfError::PermissionDenied {
            path: from.to_string(),
        })
    }
}

fn attach(nodes: &mut Vec<VirtualNode>, parent: NodeId, node: VirtualNode) -> NodeId {
    let id = NodeId(nodes.len());
    nodes.push(node);
    if let NodeKind::Directory { children } = &mut nodes[parent.0].kind {
        children.push(id);
    }
    id
}

fn is_valid_component(component: &str) -> bool {
    !component.is_empty() && component != "." && component != ".." && !component.contains('/')
}

/// Canonical lookup key: leading '/', no trailing '/', no empty segments.
pub fn normalize_path(path: &str) -> Cow<'_, str> {
    let is_canonical = path.starts_with('/')
        && (path == "/" || !path.ends_with('/'))
        && !path.contains("//");
    if is_canonical {
        return Cow::Borrowed(path);
    }

    let mut normalized = String::with_capacity(path.len() + 1);
    for segment in path.split('/').filter(|s| !s.is_empty()) {
        normalized.push('/');
        normalized.push_str(segment);
    }
    if normalized.is_empty() {
        normalized.push('/');
    }
    Cow::Owned(normalized)
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use proptest::prelude::*;

    use super::node::{DIR_MODE, FILE_MODE};
    use super::*;
    use crate::descriptor::TorrentDescriptor;
    use crate::engine::sim::build_descriptor;
    use crate::engine::{SimulatedEngine, TorrentEngine};

    async fn build(files: &[(&str, u64)]) -> (SimulatedEngine, Arc<TorrentFs>) {
        let engine = SimulatedEngine::new();
        let descriptor =
            TorrentDescriptor::from_bytes(build_descriptor("root", files, Some(1_700_000_000)))
                .unwrap();
        let handle = engine
            .add_torrent(&descriptor, Path::new("/tmp/root"))
            .await
            .unwrap();
        (engine, Arc::new(TorrentFs::new(handle).unwrap()))
    }

    #[tokio::test]
    async fn test_tree_shares_intermediate_directories() {
        let (_engine, fs) = build(&[("a/b/c.txt", 10), ("a/d.txt", 5)]).await;

        assert_eq!(fs.len(), 5);
        assert!(fs.stat("/a").unwrap().is_dir);
        assert!(fs.stat("/a/b").unwrap().is_dir);
        assert_eq!(fs.stat("/a/b/c.txt").unwrap().size, 10);
        assert_eq!(fs.stat("/a/d.txt").unwrap().size, 5);

        let names: Vec<String> = fs
            .children(fs.lookup("/a").unwrap())
            .into_iter()
            .map(|info| info.name)
            .collect();
        assert_eq!(names, vec!["b", "d.txt"]);
    }

    #[tokio::test]
    async fn test_nodes_inherit_creation_time() {
        let (_engine, fs) = build(&[("a/b.txt", 1)]).await;
        let created = fs.handle().created_at();

        assert_eq!(fs.stat("/").unwrap().modified, created);
        assert_eq!(fs.stat("/a").unwrap().modified, created);
        assert_eq!(fs.stat("/a/b.txt").unwrap().modified, created);
        assert_eq!(fs.stat("/a/b.txt").unwrap().mode, FILE_MODE);
        assert_eq!(fs.stat("/a").unwrap().mode, DIR_MODE);
    }

    #[tokio::test]
    async fn test_lookup_tolerates_trailing_and_double_slashes() {
        let (_engine, fs) = build(&[("a/b.txt", 1)]).await;

        assert!(fs.lookup("/a/").is_some());
        assert!(fs.lookup("a//b.txt").is_some());
        assert_eq!(fs.lookup(""), Some(ROOT));
        assert!(matches!(fs.stat("/missing"), Err(VtfError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_conflicting_entries_are_rejected() {
        let engine = SimulatedEngine::new();
        for files in [
            vec![("a", 1), ("a/b.txt", 1)],
            vec![("a/b.txt", 1), ("a", 1)],
            vec![("x.txt", 1), ("x.txt", 2)],
        ] {
            let descriptor =
                TorrentDescriptor::from_bytes(build_descriptor("root", &files, None)).unwrap();
            let handle = engine
                .add_torrent(&descriptor, Path::new("/tmp/root"))
                .await
                .unwrap();
            assert!(matches!(
                TorrentFs::new(handle),
                Err(VtfError::ConflictingPath { .. })
            ));
        }
    }

    #[tokio::test]
    async fn test_dot_components_are_rejected() {
        let engine = SimulatedEngine::new();
        let descriptor =
            TorrentDescriptor::from_bytes(build_descriptor("root", &[("../escape.txt", 1)], None))
                .unwrap();
        let handle = engine
            .add_torrent(&descriptor, Path::new("/tmp/root"))
            .await
            .unwrap();

        assert!(matches!(
            TorrentFs::new(handle),
            Err(VtfError::InvalidPath { .. })
        ));
    }

    #[tokio::test]
    async fn test_completion_latches() {
        let (engine, fs) = build(&[("movie.mkv", 100), ("subs.srt", 10)]).await;
        let torrent = engine.torrent(&fs.handle().info_hash()).unwrap();

        assert!(!fs.is_complete("/movie.mkv"));
        torrent.set_bytes_completed(0, 99);
        assert!(!fs.is_complete("/movie.mkv"));

        torrent.complete_file(0);
        assert!(fs.is_complete("/movie.mkv"));

        // A later regression in engine counters does not un-complete the file
        torrent.set_bytes_completed(0, 0);
        assert!(fs.is_complete("/movie.mkv"));
        assert!(!fs.is_complete("/subs.srt"));
    }

    #[tokio::test]
    async fn test_over_reported_progress_counts_as_complete() {
        let (engine, fs) = build(&[("movie.mkv", 100)]).await;
        let torrent = engine.torrent(&fs.handle().info_hash()).unwrap();

        torrent.set_bytes_completed(0, 150);
        assert!(fs.is_complete("/movie.mkv"));
    }

    #[tokio::test]
    async fn test_unknown_paths_and_directories_are_complete() {
        let (_engine, fs) = build(&[("a/b.txt", 10)]).await;

        assert!(fs.is_complete("/"));
        assert!(fs.is_complete("/a"));
        assert!(fs.is_complete("/nope.txt"));
        assert!(!fs.is_complete("/a/b.txt"));
    }

    #[tokio::test]
    async fn test_mutations_are_denied() {
        let (_engine, fs) = build(&[("a.txt", 1)]).await;

        assert!(matches!(fs.create_dir("/new"), Err(VtfError::PermissionDenied { .. })));
        assert!(matches!(fs.remove("/a.txt"), Err(VtfError::PermissionDenied { .. })));
        assert!(matches!(
            fs.rename("/a.txt", "/b.txt"),
            Err(VtfError::PermissionDenied { .. })
        ));
        assert!(fs.stat("/a.txt").is_ok());
    }

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path("/"), "/");
        assert_eq!(normalize_path(""), "/");
        assert_eq!(normalize_path("/a/b"), "/a/b");
        assert_eq!(normalize_path("a/b/"), "/a/b");
        assert_eq!(normalize_path("//a///b//"), "/a/b");
    }

    proptest! {
        #[test]
        fn prop_every_declared_file_is_reachable(
            paths in proptest::collection::btree_set("[a-c]{1,2}(/[a-c]{1,2}){0,2}\\.f", 1..12)
        ) {
            let files: Vec<(String, u64)> = paths
                .iter()
                .enumerate()
                .map(|(i, p)| (p.clone(), i as u64 + 1))
                .collect();
            let borrowed: Vec<(&str, u64)> =
                files.iter().map(|(p, l)| (p.as_str(), *l)).collect();

            let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
            let (_engine, fs) = runtime.block_on(build(&borrowed));

            for (path, length) in &files {
                let info = fs.stat(&format!("/{path}")).unwrap();
                prop_assert!(!info.is_dir);
                prop_assert_eq!(info.size, *length);

                let segments: Vec<&str> = path.split('/').collect();
                let mut prefix = String::new();
                for dir in &segments[..segments.len() - 1] {
                    prefix.push('/');
                    prefix.push_str(dir);
                    prop_assert!(fs.stat(&prefix).unwrap().is_dir);
                }
            }
        }
    }
}
