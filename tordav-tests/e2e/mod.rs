//! End-to-end tests for tordav
//!
//! A live server on a loopback port, driven over HTTP with reqwest.

#[path = "../integration/fixtures.rs"]
mod fixtures;

use std::sync::Arc;
use std::time::Duration;

use reqwest::StatusCode;
use tokio::net::TcpListener;
use tordav_core::TorrentDescriptor;
use tordav_core::engine::sim::sim_file_content;
use tordav_core::lifecycle::{DirectoryWatcher, FsChange};
use tordav_web::{Multiplexer, serve};

use fixtures::{TestEnv, movie_descriptor, single_descriptor};

#[tokio::test]
async fn test_stream_then_complete_over_http() {
    let env = TestEnv::with_config(|config| {
        config.server.secret_path = "/vault".to_string();
        config.server.username = "alice".to_string();
        config.server.password = "s3cret".to_string();
    });
    env.torrent_dir("movie", &movie_descriptor());
    env.write("movie/movie.mkv", b"from disk");

    let mut lifecycle = env.lifecycle();
    lifecycle.scan_root().await;

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let multiplexer = Arc::new(Multiplexer::new(Arc::clone(&env.service), &env.config));
    let server = tokio::spawn(serve(listener, multiplexer));

    let client = reqwest::Client::new();
    let url = |path: &str| format!("http://{addr}/vault{path}");

    let response = client.get(url("/movie/movie.mkv")).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert!(response.headers().contains_key("www-authenticate"));

    let response = client
        .get(url("/movie/movie.mkv"))
        .basic_auth("alice", Some("s3cret"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.bytes().await.unwrap(),
        sim_file_content(0, 40_000)
    );

    let info_hash = TorrentDescriptor::from_bytes(movie_descriptor())
        .unwrap()
        .info_hash;
    env.engine.torrent(&info_hash).unwrap().complete_all();

    let response = client
        .get(url("/movie/movie.mkv"))
        .basic_auth("alice", Some("s3cret"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.text().await.unwrap(), "from disk");

    let response = client
        .get(url("/stats.txt"))
        .basic_auth("alice", Some("s3cret"))
        .send()
        .await
        .unwrap();
    let report = response.text().await.unwrap();
    assert!(report.contains("state: finished"));

    server.abort();
}

#[tokio::test]
async fn test_dropped_descriptor_becomes_streamable() {
    let env = TestEnv::new();
    let (watcher, changes) = DirectoryWatcher::new().unwrap();
    let mut lifecycle = env.lifecycle().with_watcher(watcher);
    lifecycle.scan_root().await;

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let multiplexer = Arc::new(Multiplexer::new(Arc::clone(&env.service), &env.config));
    let server = tokio::spawn(serve(listener, multiplexer));
    let task = tokio::spawn(lifecycle.run(changes));

    let staged = env.root().parent().unwrap().join("clip.torrent");
    std::fs::write(&staged, single_descriptor("clip")).unwrap();
    std::fs::rename(&staged, env.root().join("clip.torrent")).unwrap();

    let client = reqwest::Client::new();
    let mut body = None;
    for _ in 0..100 {
        let response = client
            .get(format!("http://{addr}/clip/clip.bin"))
            .send()
            .await
            .unwrap();
        if response.status() == StatusCode::OK {
            body = Some(response.bytes().await.unwrap());
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(body.unwrap(), sim_file_content(0, 1_000));

    task.abort();
    server.abort();
}

#[tokio::test]
async fn test_shutdown_stops_engine() {
    let env = TestEnv::new();
    env.torrent_dir("movie", &movie_descriptor());
    let mut lifecycle = env.lifecycle();
    lifecycle.scan_root().await;
    lifecycle
        .handle_change(FsChange::Created(env.root().join("movie")))
        .await;
    assert_eq!(env.engine.added_count(), 1);

    env.service.stop().await.unwrap();

    assert!(env.engine.is_shut_down());
    assert!(env.service.routes().is_empty());
    assert_eq!(env.service.active_count(), 0);
    // Completion state survives: torrents are forgotten, not dropped
    assert_eq!(env.engine.dropped_count(), 0);
}
