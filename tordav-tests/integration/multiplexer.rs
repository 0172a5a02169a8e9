//! Request routing between streamed torrent content and plain files.

use std::sync::Arc;

use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode, header};
use axum::response::Response;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use tordav_core::engine::sim::{SimulatedTorrent, sim_file_content};
use tordav_core::{TorDavConfig, TorrentDescriptor};
use tordav_web::multiplexer::BOOTSTRAP_PAGE;
use tordav_web::{Multiplexer, router};
use tower::ServiceExt;

use crate::fixtures::{TestEnv, movie_descriptor};

const DISK_MOVIE: &[u8] = b"movie bytes already on disk";

struct Served {
    env: TestEnv,
    app: Router,
}

impl Served {
    async fn start(adjust: impl FnOnce(&mut TorDavConfig)) -> Self {
        let env = TestEnv::with_config(adjust);
        env.torrent_dir("movie", &movie_descriptor());
        env.write("movie/movie.mkv", DISK_MOVIE);
        env.write("movie/subs/en.srt", b"1\n00:00:01,000 --> 00:00:02,000\nhi\n");
        env.write("notes.txt", b"plain file");

        env.lifecycle().scan_root().await;
        assert_eq!(env.service.active_count(), 1);

        let multiplexer = Arc::new(Multiplexer::new(Arc::clone(&env.service), &env.config));
        Self {
            app: router(multiplexer),
            env,
        }
    }

    fn movie(&self) -> Arc<SimulatedTorrent> {
        let info_hash = TorrentDescriptor::from_bytes(movie_descriptor())
            .unwrap()
            .info_hash;
        self.env.engine.torrent(&info_hash).unwrap()
    }

    async fn send(&self, request: Request<Body>) -> Response {
        self.app.clone().oneshot(request).await.unwrap()
    }

    async fn get(&self, uri: &str) -> Response {
        self.send(Request::get(uri).body(Body::empty()).unwrap())
            .await
    }
}

async fn body(response: Response) -> Bytes {
    to_bytes(response.into_body(), usize::MAX).await.unwrap()
}

fn basic(user: &str, pass: &str) -> String {
    format!("Basic {}", STANDARD.encode(format!("{user}:{pass}")))
}

#[tokio::test]
async fn test_incomplete_file_streams_from_torrent() {
    let served = Served::start(|_| {}).await;

    let response = served.get("/movie/movie.mkv").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body(response).await, sim_file_content(0, 40_000));
    assert_eq!(served.movie().readers_opened(), 1);
}

#[tokio::test]
async fn test_range_request_seeks_stream() {
    let served = Served::start(|_| {}).await;

    let request = Request::get("/movie/movie.mkv")
        .header(header::RANGE, "bytes=20000-20009")
        .body(Body::empty())
        .unwrap();
    let response = served.send(request).await;

    assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(
        body(response).await,
        sim_file_content(0, 40_000)[20_000..20_010].to_vec()
    );
}

#[tokio::test]
async fn test_completed_file_falls_through_to_disk() {
    let served = Served::start(|_| {}).await;
    let movie = served.movie();
    movie.complete_file(0);

    let response = served.get("/movie/movie.mkv").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body(response).await, DISK_MOVIE);
    assert_eq!(movie.readers_opened(), 0);

    // Completion is latched even if the engine later reports less
    movie.set_bytes_completed(0, 10);
    let response = served.get("/movie/movie.mkv").await;
    assert_eq!(body(response).await, DISK_MOVIE);
    assert_eq!(movie.readers_opened(), 0);
}

#[tokio::test]
async fn test_unknown_paths_fall_through() {
    let served = Served::start(|_| {}).await;

    let response = served.get("/movie/missing.bin").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = served.get("/notes.txt").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body(response).await, "plain file");

    // Sibling prefix sharing the route's leading characters
    let response = served.get("/movie.mkv").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(served.movie().readers_opened(), 0);
}

#[tokio::test]
async fn test_propfind_does_not_open_reader() {
    let served = Served::start(|_| {}).await;

    let request = Request::builder()
        .method("PROPFIND")
        .uri("/movie/movie.mkv")
        .header("Depth", "0")
        .body(Body::empty())
        .unwrap();
    let response = served.send(request).await;

    assert_eq!(response.status(), StatusCode::MULTI_STATUS);
    let xml = String::from_utf8(body(response).await.to_vec()).unwrap();
    assert!(xml.contains("movie.mkv"));
    assert!(xml.contains("40000"));
    assert_eq!(served.movie().readers_opened(), 0);
}

#[tokio::test]
async fn test_writes_to_streaming_paths_rejected() {
    let served = Served::start(|_| {}).await;

    for method in ["PUT", "DELETE", "MKCOL", "MOVE"] {
        let request = Request::builder()
            .method(method)
            .uri("/movie/movie.mkv")
            .body(Body::from("overwrite"))
            .unwrap();
        let response = served.send(request).await;

        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED, "{method}");
        assert!(response.headers().contains_key(header::ALLOW));
    }
    assert_eq!(
        std::fs::read(served.env.root().join("movie/movie.mkv")).unwrap(),
        DISK_MOVIE
    );
}

#[tokio::test]
async fn test_status_file_is_live() {
    let served = Served::start(|_| {}).await;

    let response = served.get("/stats.txt").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[header::CONTENT_TYPE],
        "text/plain; charset=utf-8"
    );
    let report = String::from_utf8(body(response).await.to_vec()).unwrap();
    assert!(report.starts_with("Active torrents: 1"));
    assert!(report.contains("movie"));

    let head = Request::head("/stats.txt").body(Body::empty()).unwrap();
    let response = served.send(head).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(body(response).await.is_empty());
}

#[tokio::test]
async fn test_collections_get_bootstrap_page() {
    let served = Served::start(|_| {}).await;

    for uri in ["/", "/movie/", "/movie/subs/"] {
        let response = served.get(uri).await;
        assert_eq!(response.status(), StatusCode::OK, "{uri}");
        assert_eq!(body(response).await, BOOTSTRAP_PAGE, "{uri}");
    }
}

#[tokio::test]
async fn test_secret_path_gates_requests() {
    let served = Served::start(|config| config.server.secret_path = "hidden".to_string()).await;

    let response = served.get("/movie/movie.mkv").await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert!(!response.headers().contains_key(header::WWW_AUTHENTICATE));

    let response = served.get("/hiddenx/movie/movie.mkv").await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = served.get("/hidden/movie/movie.mkv").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body(response).await, sim_file_content(0, 40_000));

    let response = served.get("/hidden/notes.txt").await;
    assert_eq!(body(response).await, "plain file");

    let response = served.get("/hidden/stats.txt").await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_basic_auth() {
    let served = Served::start(|config| {
        config.server.username = "alice".to_string();
        config.server.password = "s3cret".to_string();
    })
    .await;

    let response = served.get("/notes.txt").await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(
        response.headers()[header::WWW_AUTHENTICATE],
        "Basic realm=\"Restricted\""
    );

    let wrong = Request::get("/notes.txt")
        .header(header::AUTHORIZATION, basic("alice", "nope"))
        .body(Body::empty())
        .unwrap();
    let response = served.send(wrong).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert!(!response.headers().contains_key(header::WWW_AUTHENTICATE));

    let right = Request::get("/movie/movie.mkv")
        .header(header::AUTHORIZATION, basic("alice", "s3cret"))
        .body(Body::empty())
        .unwrap();
    let response = served.send(right).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body(response).await, sim_file_content(0, 40_000));
}

#[tokio::test]
async fn test_dropped_torrent_serves_from_disk() {
    let served = Served::start(|_| {}).await;
    let movie = served.movie();

    let dir = served.env.root().join("movie");
    assert!(served.env.service.drop_torrent(&dir).await.unwrap());
    assert!(served.env.service.routes().is_empty());

    let response = served.get("/movie/movie.mkv").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body(response).await, DISK_MOVIE);
    assert_eq!(movie.readers_opened(), 0);

    let report = served.env.service.status_report();
    assert!(report.starts_with("Active torrents: 0"));
}
