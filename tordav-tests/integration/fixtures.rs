//! Shared setup: a temporary torrents root served by the simulated engine.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use tempfile::TempDir;
use tordav_core::engine::sim::build_descriptor;
use tordav_core::{LifecycleManager, SimulatedEngine, TorDavConfig, TorrentService};

pub const MOVIE_FILES: &[(&str, u64)] = &[("movie.mkv", 40_000), ("subs/en.srt", 300)];

pub fn movie_descriptor() -> Bytes {
    build_descriptor("movie", MOVIE_FILES, Some(1_700_000_000))
}

pub fn single_descriptor(name: &str) -> Bytes {
    let file = format!("{name}.bin");
    build_descriptor(name, &[(file.as_str(), 1_000)], None)
}

pub struct TestEnv {
    _temp: TempDir,
    pub config: TorDavConfig,
    pub engine: SimulatedEngine,
    pub service: Arc<TorrentService>,
}

impl TestEnv {
    pub fn new() -> Self {
        Self::with_config(|_| {})
    }

    pub fn with_config(adjust: impl FnOnce(&mut TorDavConfig)) -> Self {
        let temp = TempDir::new().unwrap();
        let mut config = TorDavConfig::for_testing(temp.path());
        adjust(&mut config);
        config.validate().unwrap();
        std::fs::create_dir_all(&config.storage.torrents_dir).unwrap();

        let engine = SimulatedEngine::new();
        let service = Arc::new(TorrentService::new(Arc::new(engine.clone()), &config));

        Self {
            _temp: temp,
            config,
            engine,
            service,
        }
    }

    pub fn root(&self) -> &Path {
        &self.config.storage.torrents_dir
    }

    pub fn lifecycle(&self) -> LifecycleManager {
        LifecycleManager::new(Arc::clone(&self.service), &self.config)
    }

    /// Creates `relative` below the root holding the canonical descriptor.
    pub fn torrent_dir(&self, relative: &str, descriptor: &[u8]) -> PathBuf {
        let dir = self.root().join(relative);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(&self.config.lifecycle.descriptor_name), descriptor).unwrap();
        dir
    }

    pub fn write(&self, relative: &str, contents: &[u8]) -> PathBuf {
        let path = self.root().join(relative);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(&path, contents).unwrap();
        path
    }
}
