//! Directory lifecycle against the simulated engine.

use std::sync::Arc;
use std::time::Duration;

use tordav_core::lifecycle::{DirectoryWatcher, FsChange, STATUS_PLACEHOLDER, prepare_root};
use tordav_core::{InfoHash, TorrentDescriptor};

use crate::fixtures::{TestEnv, movie_descriptor, single_descriptor};

const ALBUM_MAGNET: &str = "magnet:?xt=urn:btih:0123456789abcdef0123456789abcdef01234567&dn=album";
const UNKNOWN_MAGNET: &str = "magnet:?xt=urn:btih:ffffffffffffffffffffffffffffffffffffffff";

fn info_hash(descriptor: &[u8]) -> InfoHash {
    TorrentDescriptor::from_bytes(descriptor.to_vec())
        .unwrap()
        .info_hash
}

#[tokio::test]
async fn test_startup_scan_reconstructs_state() {
    let env = TestEnv::new();
    env.write(
        &env.config.lifecycle.status_file_name,
        STATUS_PLACEHOLDER.as_bytes(),
    );
    let movie = env.torrent_dir("movie", &movie_descriptor());
    let deep = env.torrent_dir("nested/deep", &single_descriptor("deep"));
    let bare = env.write("series.torrent", &single_descriptor("series"));
    env.engine
        .register_magnet(ALBUM_MAGNET, single_descriptor("album"));
    let batch = env.write(
        "magnets.txt",
        format!("{ALBUM_MAGNET}\n\nnot-a-magnet\n  {UNKNOWN_MAGNET}  \n").as_bytes(),
    );

    let mut lifecycle = env.lifecycle();
    lifecycle.scan_root().await;

    let series = env.root().join("series");
    let album = env.root().join("album");
    for dir in [&movie, &deep, &series, &album] {
        assert!(env.service.is_active(dir), "{} not active", dir.display());
    }
    assert_eq!(env.service.active_count(), 4);
    assert_eq!(env.engine.added_count(), 4);

    assert!(!bare.exists());
    assert!(series.join("this.torrent").is_file());
    assert!(!batch.exists());
    assert!(album.join("this.torrent").is_file());

    assert_eq!(
        std::fs::read_to_string(env.root().join("stats.txt")).unwrap(),
        STATUS_PLACEHOLDER
    );
    assert_eq!(env.service.prefix_for(&deep).unwrap(), "/nested/deep");
    assert!(env.service.routes().lookup("/nested/deep/deep.bin").is_some());
}

#[tokio::test]
async fn test_rescan_is_idempotent() {
    let env = TestEnv::new();
    env.torrent_dir("movie", &movie_descriptor());

    let mut lifecycle = env.lifecycle();
    lifecycle.scan_root().await;
    lifecycle.scan_root().await;

    assert_eq!(env.service.active_count(), 1);
    assert_eq!(env.engine.added_count(), 1);
    assert_eq!(env.service.routes().len(), 1);
}

#[tokio::test]
async fn test_removing_descriptor_drops_torrent() {
    let env = TestEnv::new();
    let dir = env.torrent_dir("movie", &movie_descriptor());
    let mut lifecycle = env.lifecycle();
    lifecycle.scan_root().await;

    let descriptor = dir.join("this.torrent");
    std::fs::remove_file(&descriptor).unwrap();
    lifecycle.handle_change(FsChange::Removed(descriptor)).await;

    assert!(!env.service.is_active(&dir));
    assert!(env.service.routes().is_empty());
    assert_eq!(env.engine.dropped_count(), 1);
    assert!(dir.exists());
}

#[tokio::test]
async fn test_removing_directory_drops_torrent() {
    let env = TestEnv::new();
    let dir = env.torrent_dir("movie", &movie_descriptor());
    let mut lifecycle = env.lifecycle();
    lifecycle.scan_root().await;

    std::fs::remove_dir_all(&dir).unwrap();
    lifecycle.handle_change(FsChange::Removed(dir.clone())).await;

    assert!(!env.service.is_active(&dir));
    assert_eq!(env.engine.dropped_count(), 1);
    assert_eq!(env.engine.active_count(), 0);
}

#[tokio::test]
async fn test_same_torrent_in_two_directories_is_served_once() {
    let env = TestEnv::new();
    let first = env.torrent_dir("first", &movie_descriptor());
    let second = env.torrent_dir("second", &movie_descriptor());
    let mut lifecycle = env.lifecycle();
    lifecycle.scan_root().await;

    assert_eq!(env.service.active_count(), 1);
    assert_eq!(env.engine.active_count(), 1);
    let (winner, loser) = if env.service.is_active(&first) {
        (first, second)
    } else {
        (second, first)
    };
    let winner_url = format!("{}/movie.mkv", env.service.prefix_for(&winner).unwrap());

    let descriptor = loser.join("this.torrent");
    std::fs::remove_file(&descriptor).unwrap();
    lifecycle.handle_change(FsChange::Removed(descriptor)).await;
    std::fs::remove_dir_all(&loser).unwrap();
    lifecycle.handle_change(FsChange::Removed(loser)).await;

    assert!(env.service.is_active(&winner));
    assert!(env.service.routes().lookup(&winner_url).is_some());
    assert_eq!(env.engine.active_count(), 1);
    assert_eq!(env.engine.dropped_count(), 0);
}

#[tokio::test]
async fn test_unreadable_descriptor_left_in_place() {
    let env = TestEnv::new();
    let broken = env.write("broken.torrent", b"this is not bencode");

    let mut lifecycle = env.lifecycle();
    lifecycle.scan_root().await;

    assert!(broken.is_file());
    assert_eq!(env.service.active_count(), 0);
    assert_eq!(env.engine.added_count(), 0);
    let entries = std::fs::read_dir(env.root()).unwrap().count();
    assert_eq!(entries, 1);
}

#[tokio::test]
async fn test_existing_target_directory_blocks_ingest() {
    let env = TestEnv::new();
    std::fs::create_dir_all(env.root().join("movie")).unwrap();
    env.write("movie/notes.txt", b"keep me");
    let bare = env.write("movie.torrent", &movie_descriptor());

    let mut lifecycle = env.lifecycle();
    lifecycle.scan_root().await;

    assert!(bare.is_file());
    assert!(!env.root().join("movie/this.torrent").exists());
    assert_eq!(env.service.active_count(), 0);
}

#[tokio::test]
async fn test_created_descriptor_is_ingested() {
    let env = TestEnv::new();
    let mut lifecycle = env.lifecycle();
    lifecycle.scan_root().await;
    assert_eq!(env.service.active_count(), 0);

    let bare = env.write("fresh.torrent", &single_descriptor("fresh"));
    lifecycle.handle_change(FsChange::Created(bare.clone())).await;

    let dir = env.root().join("fresh");
    assert!(!bare.exists());
    assert!(env.service.is_active(&dir));

    // The later event for the canonical descriptor changes nothing
    lifecycle
        .handle_change(FsChange::Created(dir.join("this.torrent")))
        .await;
    assert_eq!(env.engine.added_count(), 1);
}

#[tokio::test]
async fn test_created_directory_is_scanned() {
    let env = TestEnv::new();
    let mut lifecycle = env.lifecycle();

    let dir = env.torrent_dir("shows/pilot", &single_descriptor("pilot"));
    lifecycle
        .handle_change(FsChange::Created(env.root().join("shows")))
        .await;

    assert!(env.service.is_active(&dir));
}

#[tokio::test]
async fn test_written_magnet_batch_is_processed() {
    let env = TestEnv::new();
    env.engine
        .register_magnet(ALBUM_MAGNET, single_descriptor("album"));
    let mut lifecycle = env.lifecycle();

    let batch = env.write("music/magnets.txt", ALBUM_MAGNET.as_bytes());
    lifecycle.handle_change(FsChange::Written(batch.clone())).await;

    assert!(!batch.exists());
    assert!(env.service.is_active(&env.root().join("music/album")));
}

#[tokio::test]
async fn test_files_inside_torrent_directory_are_ignored() {
    let env = TestEnv::new();
    env.engine
        .register_magnet(ALBUM_MAGNET, single_descriptor("album"));
    let dir = env.torrent_dir("movie", &movie_descriptor());
    let batch = env.write("movie/magnets.txt", ALBUM_MAGNET.as_bytes());
    let extra = env.write("movie/extra.torrent", &single_descriptor("extra"));

    let mut lifecycle = env.lifecycle();
    lifecycle.scan_root().await;
    lifecycle.handle_change(FsChange::Created(batch.clone())).await;
    lifecycle.handle_change(FsChange::Written(batch.clone())).await;
    lifecycle.handle_change(FsChange::Created(extra.clone())).await;

    assert!(batch.is_file());
    assert!(extra.is_file());
    assert!(env.service.is_active(&dir));
    assert_eq!(env.engine.added_count(), 1);
}

#[tokio::test]
async fn test_descriptor_in_root_is_ignored() {
    let env = TestEnv::new();
    let stray = env.write("this.torrent", &single_descriptor("stray"));
    let dir = env.torrent_dir("movie", &movie_descriptor());

    let mut lifecycle = env.lifecycle();
    lifecycle.scan_root().await;
    lifecycle.handle_change(FsChange::Created(stray.clone())).await;

    assert!(stray.is_file());
    assert!(env.service.is_active(&dir));
    assert_eq!(env.service.active_count(), 1);
    assert!(
        env.engine
            .torrent(&info_hash(&single_descriptor("stray")))
            .is_none()
    );
}

#[tokio::test]
async fn test_prepare_root_only_on_first_start() {
    let env = TestEnv::new();
    std::fs::remove_dir_all(env.root()).unwrap();

    assert!(prepare_root(&env.config).await.unwrap());
    std::fs::write(env.root().join("stats.txt"), b"edited").unwrap();
    assert!(!prepare_root(&env.config).await.unwrap());

    assert_eq!(
        std::fs::read_to_string(env.root().join("stats.txt")).unwrap(),
        "edited"
    );
}

#[tokio::test]
async fn test_watcher_drives_lifecycle() {
    let env = TestEnv::new();
    let (watcher, changes) = DirectoryWatcher::new().unwrap();
    let mut lifecycle = env.lifecycle().with_watcher(watcher);
    lifecycle.scan_root().await;
    let service = Arc::clone(lifecycle.service());
    let task = tokio::spawn(lifecycle.run(changes));

    // Stage outside the root so the descriptor appears in one rename
    let staged = env.root().parent().unwrap().join("staged.torrent");
    std::fs::write(&staged, single_descriptor("watched")).unwrap();
    std::fs::rename(&staged, env.root().join("watched.torrent")).unwrap();

    let dir = env.root().join("watched");
    let mut active = false;
    for _ in 0..100 {
        if service.is_active(&dir) {
            active = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(active, "watched torrent never became active");

    std::fs::remove_dir_all(&dir).unwrap();
    let mut dropped = false;
    for _ in 0..100 {
        if !service.is_active(&dir) {
            dropped = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(dropped, "removed torrent stayed active");

    task.abort();
}
