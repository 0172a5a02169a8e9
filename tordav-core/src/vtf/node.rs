//! Nodes of the virtual tree.

use std::time::SystemTime;

/// Index of a node in the filesystem arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub(crate) usize);

/// The root directory is always the first node.
pub const ROOT: NodeId = NodeId(0);

/// Read-only permission bits reported for files.
pub const FILE_MODE: u32 = 0o444;
/// Read-only permission bits reported for directories.
pub const DIR_MODE: u32 = 0o555;

#[derive(Debug, Clone)]
pub enum NodeKind {
    File {
        /// Position of the file in the torrent's file list
        file_index: usize,
        size: u64,
    },
    Directory {
        children: Vec<NodeId>,
    },
}

#[derive(Debug, Clone)]
pub struct VirtualNode {
    pub name: String,
    pub kind: NodeKind,
    pub modified: SystemTime,
}

impl VirtualNode {
    pub(crate) fn directory(name: impl Into<String>, modified: SystemTime) -> Self {
        Self {
            name: name.into(),
            kind: NodeKind::Directory {
                children: Vec::new(),
            },
            modified,
        }
    }

    pub(crate) fn file(
        name: impl Into<String>,
        file_index: usize,
        size: u64,
        modified: SystemTime,
    ) -> Self {
        Self {
            name: name.into(),
            kind: NodeKind::File { file_index, size },
            modified,
        }
    }

    pub fn is_dir(&self) -> bool {
        matches!(self.kind, NodeKind::Directory { .. })
    }

    /// Declared size for files, zero for directories.
    pub fn size(&self) -> u64 {
        match self.kind {
            NodeKind::File { size, .. } => size,
            NodeKind::Directory { .. } => 0,
        }
    }

    pub fn mode(&self) -> u32 {
        if self.is_dir() { DIR_MODE } else { FILE_MODE }
    }

    pub fn info(&self) -> NodeInfo {
        NodeInfo {
            name: self.name.clone(),
            size: self.size(),
            is_dir: self.is_dir(),
            modified: self.modified,
            mode: self.mode(),
        }
    }
}

/// Owned snapshot of a node's metadata, as handed to protocol layers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInfo {
    pub name: String,
    pub size: u64,
    pub is_dir: bool,
    pub modified: SystemTime,
    pub mode: u32,
}
