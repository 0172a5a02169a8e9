//! Per-open file sessions.

use std::io::SeekFrom;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::Mutex;
use tracing::debug;

use super::node::{NodeId, NodeInfo, NodeKind};
use super::{TorrentFs, VtfError};
use crate::engine::{EngineError, FileReader};

struct SessionState {
    reader: Option<Box<dyn FileReader>>,
    closed: bool,
}

impl SessionState {
    /// Returns the session's reader, creating it on first use.
    fn acquire_reader(
        &mut self,
        open: impl FnOnce() -> Result<Box<dyn FileReader>, EngineError>,
    ) -> Result<&mut Box<dyn FileReader>, VtfError> {
        if self.closed {
            return Err(VtfError::Closed);
        }
        match &mut self.reader {
            Some(reader) => Ok(reader),
            slot @ None => Ok(slot.insert(open()?)),
        }
    }
}

/// An open file or directory of a [`TorrentFs`].
///
/// File sessions own at most one streaming reader, created lazily on the
/// first read or seek. Operations on one session are serialized; distinct
/// sessions on the same file read independently.
pub struct FileSession {
    fs: Arc<TorrentFs>,
    node: NodeId,
    state: Mutex<SessionState>,
}

impl std::fmt::Debug for FileSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileSession")
            .field("node", &self.fs.node(self.node).name)
            .finish()
    }
}

impl FileSession {
    pub(crate) fn new(fs: Arc<TorrentFs>, node: NodeId) -> Self {
        Self {
            fs,
            node,
            state: Mutex::new(SessionState {
                reader: None,
                closed: false,
            }),
        }
    }

    pub fn stat(&self) -> NodeInfo {
        self.fs.node(self.node).info()
    }

    fn file_index(&self) -> Result<usize, VtfError> {
        let node = self.fs.node(self.node);
        match node.kind {
            NodeKind::File { file_index, .. } => Ok(file_index),
            NodeKind::Directory { .. } => Err(VtfError::InvalidOperation {
                path: node.name.clone(),
            }),
        }
    }

    fn open_reader(&self, file_index: usize) -> Result<Box<dyn FileReader>, EngineError> {
        debug!(
            "Opening stream for {} of {}",
            self.fs.node(self.node).name,
            self.fs.handle().name()
        );
        self.fs.handle().open_reader(file_index)
    }

    /// Reads into `buf`, blocking until the pieces covering the range are
    /// available. Returns 0 at end of file.
    ///
    /// # Errors
    /// - `VtfError::InvalidOperation` - Session is on a directory
    /// - `VtfError::Closed` - Session was closed
    /// - `VtfError::Engine` / `VtfError::Io` - Stream failures
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize, VtfError> {
        let file_index = self.file_index()?;
        let mut state = self.state.lock().await;
        let reader = state.acquire_reader(|| self.open_reader(file_index))?;
        Ok(reader.read(buf).await?)
    }

    /// Moves the read position of the session's reader.
    ///
    /// # Errors
    /// - `VtfError::InvalidOperation` - Session is on a directory
    /// - `VtfError::Closed` - Session was closed
    pub async fn seek(&self, pos: SeekFrom) -> Result<u64, VtfError> {
        let file_index = self.file_index()?;
        let mut state = self.state.lock().await;
        let reader = state.acquire_reader(|| self.open_reader(file_index))?;
        Ok(reader.seek(pos).await?)
    }

    /// # Errors
    /// Always `VtfError::PermissionDenied`
    pub fn write(&self, _buf: &[u8]) -> Result<usize, VtfError> {
        Err(VtfError::PermissionDenied {
            path: self.fs.node(self.node).name.clone(),
        })
    }

    /// Lists the children of a directory session in declaration order.
    ///
    /// # Errors
    /// - `VtfError::InvalidOperation` - Session is on a file
    /// - `VtfError::Closed` - Session was closed
    pub async fn read_dir(&self) -> Result<Vec<NodeInfo>, VtfError> {
        let node = self.fs.node(self.node);
        if !node.is_dir() {
            return Err(VtfError::InvalidOperation {
                path: node.name.clone(),
            });
        }
        if self.state.lock().await.closed {
            return Err(VtfError::Closed);
        }
        Ok(self.fs.children(self.node))
    }

    /// Releases the session's reader.
    ///
    /// # Errors
    /// - `VtfError::Closed` - Session was already closed
    pub async fn close(&self) -> Result<(), VtfError> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(VtfError::Closed);
        }
        state.closed = true;
        state.reader = None;
        Ok(())
    }

    pub async fn is_closed(&self) -> bool {
        self.state.lock().await.closed
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;
    use crate::descriptor::TorrentDescriptor;
    use crate::engine::sim::{build_descriptor, sim_file_content};
    use crate::engine::{SimulatedEngine, TorrentEngine};

    async fn build() -> (SimulatedEngine, Arc<TorrentFs>) {
        let engine = SimulatedEngine::new();
        let descriptor = TorrentDescriptor::from_bytes(build_descriptor(
            "root",
            &[("a/b/c.txt", 10), ("a/d.txt", 5)],
            None,
        ))
        .unwrap();
        let handle = engine
            .add_torrent(&descriptor, Path::new("/tmp/root"))
            .await
            .unwrap();
        (engine, Arc::new(TorrentFs::new(handle).unwrap()))
    }

    #[tokio::test]
    async fn test_reader_is_created_lazily_once() {
        let (engine, fs) = build().await;
        let session = fs.open("/a/b/c.txt").unwrap();
        assert_eq!(engine.readers_opened(), 0);

        let mut buf = [0u8; 4];
        assert_eq!(session.read(&mut buf).await.unwrap(), 4);
        assert_eq!(session.read(&mut buf).await.unwrap(), 4);
        assert_eq!(engine.readers_opened(), 1);

        let expected = sim_file_content(0, 10);
        assert_eq!(buf, expected[4..8]);
    }

    #[tokio::test]
    async fn test_seek_then_read() {
        let (_engine, fs) = build().await;
        let session = fs.open("/a/d.txt").unwrap();

        assert_eq!(session.seek(SeekFrom::Start(3)).await.unwrap(), 3);
        let mut buf = [0u8; 8];
        let n = session.read(&mut buf).await.unwrap();

        assert_eq!(n, 2);
        assert_eq!(buf[..n], sim_file_content(1, 5)[3..]);
        assert_eq!(session.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_sessions_read_independently() {
        let (engine, fs) = build().await;
        let first = fs.open("/a/b/c.txt").unwrap();
        let second = fs.open("/a/b/c.txt").unwrap();

        first.seek(SeekFrom::Start(6)).await.unwrap();
        let mut buf = [0u8; 2];
        second.read(&mut buf).await.unwrap();

        assert_eq!(buf, sim_file_content(0, 10)[..2]);
        assert_eq!(engine.readers_opened(), 2);
    }

    #[tokio::test]
    async fn test_read_dir_lists_children() {
        let (_engine, fs) = build().await;
        let session = fs.open("/a/").unwrap();

        let children = session.read_dir().await.unwrap();
        let names: Vec<_> = children.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["b", "d.txt"]);
        assert!(children[0].is_dir);
        assert_eq!(children[1].size, 5);

        let mut buf = [0u8; 1];
        assert!(matches!(
            session.read(&mut buf).await,
            Err(VtfError::InvalidOperation { .. })
        ));
    }

    #[tokio::test]
    async fn test_read_dir_on_file_fails() {
        let (_engine, fs) = build().await;
        let session = fs.open("/a/d.txt").unwrap();

        assert!(matches!(
            session.read_dir().await,
            Err(VtfError::InvalidOperation { .. })
        ));
    }

    #[tokio::test]
    async fn test_write_is_denied() {
        let (_engine, fs) = build().await;
        let session = fs.open("/a/d.txt").unwrap();

        assert!(matches!(
            session.write(b"data"),
            Err(VtfError::PermissionDenied { .. })
        ));
    }

    #[tokio::test]
    async fn test_double_close_is_an_error() {
        let (_engine, fs) = build().await;
        let session = fs.open("/a/d.txt").unwrap();
        let mut buf = [0u8; 1];
        session.read(&mut buf).await.unwrap();

        session.close().await.unwrap();
        assert!(session.is_closed().await);
        assert!(matches!(session.close().await, Err(VtfError::Closed)));
        assert!(matches!(session.read(&mut buf).await, Err(VtfError::Closed)));
    }

    #[tokio::test]
    async fn test_open_twice_and_close_without_reads() {
        let (engine, fs) = build().await;
        let first = fs.open("/a/d.txt").unwrap();
        let second = fs.open("/a/d.txt").unwrap();

        first.close().await.unwrap();
        second.close().await.unwrap();

        assert!(first.is_closed().await);
        assert!(second.is_closed().await);
        assert_eq!(engine.readers_opened(), 0);
    }

    #[tokio::test]
    async fn test_stat_of_session() {
        let (_engine, fs) = build().await;
        let session = fs.open("/a/b/c.txt").unwrap();
        let info = session.stat();

        assert_eq!(info.name, "c.txt");
        assert_eq!(info.size, 10);
        assert!(!info.is_dir);
    }
}
