//! dav-server adapters over the virtual torrent filesystem.
//!
//! Only the read side of `DavFileSystem` is implemented; every mutating
//! call is answered with `Forbidden`.

use std::io::SeekFrom;
use std::sync::Arc;
use std::time::SystemTime;

use bytes::Bytes;
use dav_server::davpath::DavPath;
use dav_server::fs::{
    DavDirEntry, DavFile, DavFileSystem, DavMetaData, FsError, FsFuture, FsResult, FsStream,
    OpenOptions, ReadDirMeta,
};
use tordav_core::vtf::{FileSession, NodeInfo, TorrentFs, VtfError};
use tracing::debug;

fn fs_error(err: VtfError) -> FsError {
    match err {
        VtfError::NotFound { .. } => FsError::NotFound,
        VtfError::PermissionDenied { .. } => FsError::Forbidden,
        VtfError::InvalidOperation { .. } => FsError::Forbidden,
        other => {
            debug!("Virtual filesystem failure: {other}");
            FsError::GeneralFailure
        }
    }
}

fn vtf_path(path: &DavPath) -> String {
    String::from_utf8_lossy(path.as_bytes()).into_owned()
}

/// Read-only WebDAV view of one torrent.
#[derive(Clone)]
pub struct TorrentDavFs {
    fs: Arc<TorrentFs>,
}

impl TorrentDavFs {
    pub fn new(fs: Arc<TorrentFs>) -> Box<Self> {
        Box::new(Self { fs })
    }
}

impl DavFileSystem for TorrentDavFs {
    fn open<'a>(
        &'a self,
        path: &'a DavPath,
        options: OpenOptions,
    ) -> FsFuture<'a, Box<dyn DavFile>> {
        Box::pin(async move {
            let mutating = options.write
                || options.append
                || options.truncate
                || options.create
                || options.create_new;
            if mutating {
                return Err(FsError::Forbidden);
            }
            let session = self.fs.open(&vtf_path(path)).map_err(fs_error)?;
            Ok(Box::new(TorrentDavFile { session }) as Box<dyn DavFile>)
        })
    }

    fn read_dir<'a>(
        &'a self,
        path: &'a DavPath,
        _meta: ReadDirMeta,
    ) -> FsFuture<'a, FsStream<Box<dyn DavDirEntry>>> {
        Box::pin(async move {
            let session = self.fs.open(&vtf_path(path)).map_err(fs_error)?;
            let children = session.read_dir().await.map_err(fs_error)?;
            session.close().await.map_err(fs_error)?;

            let entries = children
                .into_iter()
                .map(|info| Ok(Box::new(TorrentDirEntry { info }) as Box<dyn DavDirEntry>));
            Ok(Box::pin(futures::stream::iter(entries)) as FsStream<Box<dyn DavDirEntry>>)
        })
    }

    fn metadata<'a>(&'a self, path: &'a DavPath) -> FsFuture<'a, Box<dyn DavMetaData>> {
        Box::pin(async move {
            let info = self.fs.stat(&vtf_path(path)).map_err(fs_error)?;
            Ok(Box::new(TorrentMeta { info }) as Box<dyn DavMetaData>)
        })
    }

    fn create_dir<'a>(&'a self, _path: &'a DavPath) -> FsFuture<'a, ()> {
        Box::pin(async { Err(FsError::Forbidden) })
    }

    fn remove_dir<'a>(&'a self, _path: &'a DavPath) -> FsFuture<'a, ()> {
        Box::pin(async { Err(FsError::Forbidden) })
    }

    fn remove_file<'a>(&'a self, _path: &'a DavPath) -> FsFuture<'a, ()> {
        Box::pin(async { Err(FsError::Forbidden) })
    }

    fn rename<'a>(&'a self, _from: &'a DavPath, _to: &'a DavPath) -> FsFuture<'a, ()> {
        Box::pin(async { Err(FsError::Forbidden) })
    }

    fn copy<'a>(&'a self, _from: &'a DavPath, _to: &'a DavPath) -> FsFuture<'a, ()> {
        Box::pin(async { Err(FsError::Forbidden) })
    }
}

#[derive(Debug)]
struct TorrentDavFile {
    session: FileSession,
}

impl DavFile for TorrentDavFile {
    fn metadata(&mut self) -> FsFuture<'_, Box<dyn DavMetaData>> {
        let info = self.session.stat();
        Box::pin(async move { Ok(Box::new(TorrentMeta { info }) as Box<dyn DavMetaData>) })
    }

    fn write_buf(&mut self, _buf: Box<dyn bytes::Buf + Send>) -> FsFuture<'_, ()> {
        Box::pin(async { Err(FsError::Forbidden) })
    }

    fn write_bytes(&mut self, _buf: Bytes) -> FsFuture<'_, ()> {
        Box::pin(async { Err(FsError::Forbidden) })
    }

    fn read_bytes(&mut self, count: usize) -> FsFuture<'_, Bytes> {
        Box::pin(async move {
            let mut buf = vec![0u8; count];
            let n = self.session.read(&mut buf).await.map_err(fs_error)?;
            buf.truncate(n);
            Ok(Bytes::from(buf))
        })
    }

    fn seek(&mut self, pos: SeekFrom) -> FsFuture<'_, u64> {
        Box::pin(async move { self.session.seek(pos).await.map_err(fs_error) })
    }

    fn flush(&mut self) -> FsFuture<'_, ()> {
        Box::pin(async { Ok(()) })
    }
}

#[derive(Debug, Clone)]
struct TorrentMeta {
    info: NodeInfo,
}

impl DavMetaData for TorrentMeta {
    fn len(&self) -> u64 {
        self.info.size
    }

    fn modified(&self) -> FsResult<SystemTime> {
        Ok(self.info.modified)
    }

    fn is_dir(&self) -> bool {
        self.info.is_dir
    }
}

struct TorrentDirEntry {
    info: NodeInfo,
}

impl DavDirEntry for TorrentDirEntry {
    fn name(&self) -> Vec<u8> {
        self.info.name.as_bytes().to_vec()
    }

    fn metadata(&self) -> FsFuture<'_, Box<dyn DavMetaData>> {
        let meta = TorrentMeta {
            info: self.info.clone(),
        };
        Box::pin(async move { Ok(Box::new(meta) as Box<dyn DavMetaData>) })
    }
}
