//! Filesystem change notifications.

use std::path::{Path, PathBuf};

use notify::event::{EventKind, ModifyKind, RenameMode};
use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, error};

use super::LifecycleError;

/// Classified filesystem change under a watched directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FsChange {
    /// A file or directory appeared, by creation or by being moved in
    Created(PathBuf),
    /// File contents were written
    Written(PathBuf),
    /// A file or directory disappeared, by deletion or by being moved out
    Removed(PathBuf),
}

impl FsChange {
    pub fn path(&self) -> &Path {
        match self {
            FsChange::Created(path) | FsChange::Written(path) | FsChange::Removed(path) => path,
        }
    }

    /// Classifies a raw notify event. Access and metadata-only events
    /// yield nothing.
    pub fn from_event(event: Event) -> Vec<FsChange> {
        let Event { kind, paths, .. } = event;
        match kind {
            EventKind::Create(_) => paths.into_iter().map(FsChange::Created).collect(),
            EventKind::Remove(_) => paths.into_iter().map(FsChange::Removed).collect(),
            EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
                paths.into_iter().map(FsChange::Created).collect()
            }
            EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
                paths.into_iter().map(FsChange::Removed).collect()
            }
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
                let mut paths = paths.into_iter();
                let mut changes = Vec::with_capacity(2);
                if let Some(from) = paths.next() {
                    changes.push(FsChange::Removed(from));
                }
                if let Some(to) = paths.next() {
                    changes.push(FsChange::Created(to));
                }
                changes
            }
            // Platforms that cannot tell the rename direction
            EventKind::Modify(ModifyKind::Name(_)) => paths
                .into_iter()
                .map(|path| {
                    if path.exists() {
                        FsChange::Created(path)
                    } else {
                        FsChange::Removed(path)
                    }
                })
                .collect(),
            EventKind::Modify(ModifyKind::Data(_) | ModifyKind::Any) => {
                paths.into_iter().map(FsChange::Written).collect()
            }
            _ => Vec::new(),
        }
    }
}

/// Non-recursive directory watcher feeding a single change channel.
///
/// Each directory is registered individually, mirroring how the
/// lifecycle walks the tree.
pub struct DirectoryWatcher {
    inner: RecommendedWatcher,
}

impl DirectoryWatcher {
    /// Creates the watcher and the receiving end of its change channel.
    ///
    /// # Errors
    /// - `LifecycleError::Watcher` - The platform watcher could not be created
    pub fn new() -> Result<(Self, mpsc::UnboundedReceiver<FsChange>), LifecycleError> {
        let (tx, rx) = mpsc::unbounded_channel();

        let inner = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) => {
                for change in FsChange::from_event(event) {
                    if tx.send(change).is_err() {
                        debug!("Change channel closed, dropping event");
                        return;
                    }
                }
            }
            Err(e) => error!("Error in watcher: {e}"),
        })?;

        Ok((Self { inner }, rx))
    }

    /// Starts watching `dir`. Watching an already watched directory is a
    /// no-op.
    ///
    /// # Errors
    /// - `LifecycleError::Watcher` - Registration failed
    pub fn watch(&mut self, dir: &Path) -> Result<(), LifecycleError> {
        self.inner.watch(dir, RecursiveMode::NonRecursive)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use notify::event::{CreateKind, DataChange, MetadataKind, RemoveKind};

    use super::*;

    fn event(kind: EventKind, paths: &[&str]) -> Event {
        paths
            .iter()
            .fold(Event::new(kind), |event, path| event.add_path(PathBuf::from(path)))
    }

    #[test]
    fn test_create_and_remove() {
        assert_eq!(
            FsChange::from_event(event(EventKind::Create(CreateKind::File), &["/t/a.torrent"])),
            vec![FsChange::Created(PathBuf::from("/t/a.torrent"))]
        );
        assert_eq!(
            FsChange::from_event(event(EventKind::Remove(RemoveKind::Folder), &["/t/movie"])),
            vec![FsChange::Removed(PathBuf::from("/t/movie"))]
        );
    }

    #[test]
    fn test_renames_split_into_remove_and_create() {
        let both = event(
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)),
            &["/t/old", "/t/new"],
        );
        assert_eq!(
            FsChange::from_event(both),
            vec![
                FsChange::Removed(PathBuf::from("/t/old")),
                FsChange::Created(PathBuf::from("/t/new")),
            ]
        );

        let moved_in = event(EventKind::Modify(ModifyKind::Name(RenameMode::To)), &["/t/in"]);
        assert_eq!(
            FsChange::from_event(moved_in),
            vec![FsChange::Created(PathBuf::from("/t/in"))]
        );

        let moved_out = event(EventKind::Modify(ModifyKind::Name(RenameMode::From)), &["/t/out"]);
        assert_eq!(
            FsChange::from_event(moved_out),
            vec![FsChange::Removed(PathBuf::from("/t/out"))]
        );
    }

    #[test]
    fn test_data_writes_and_ignored_kinds() {
        let written = event(
            EventKind::Modify(ModifyKind::Data(DataChange::Content)),
            &["/t/magnets.txt"],
        );
        assert_eq!(
            FsChange::from_event(written),
            vec![FsChange::Written(PathBuf::from("/t/magnets.txt"))]
        );

        let metadata = event(
            EventKind::Modify(ModifyKind::Metadata(MetadataKind::Permissions)),
            &["/t/x"],
        );
        assert!(FsChange::from_event(metadata).is_empty());
    }
}
