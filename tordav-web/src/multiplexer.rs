//! Per-request dispatch between torrent streaming and plain files.
//!
//! Content that is still downloading is served through the virtual torrent
//! filesystem so reads wait for pieces. Everything else, including
//! completed torrent files, goes to a WebDAV handler over the torrents
//! directory on disk.

use std::borrow::Cow;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::Request;
use axum::http::{HeaderValue, Method, StatusCode, header};
use axum::response::Response;
use dav_server::DavHandler;
use dav_server::fakels::FakeLs;
use dav_server::localfs::LocalFs;
use dav_server::memls::MemLs;
use tordav_core::TorDavConfig;
use tordav_core::service::{Route, TorrentService, join_url_path, strip_path_prefix};
use tracing::debug;

use crate::auth::{AuthOutcome, BasicAuth, unauthorized};
use crate::dav::TorrentDavFs;

/// Browser UI served for collection URLs.
pub const BOOTSTRAP_PAGE: &str = include_str!("../assets/bootstrap.html");

/// Routes every HTTP request of the server.
pub struct Multiplexer {
    service: Arc<TorrentService>,
    secret: String,
    status_path: String,
    auth: Option<BasicAuth>,
    plain: DavHandler,
}

impl Multiplexer {
    pub fn new(service: Arc<TorrentService>, config: &TorDavConfig) -> Self {
        let secret = config.server.secret_path.clone();

        let mut builder = DavHandler::builder()
            .filesystem(LocalFs::new(
                &config.storage.torrents_dir,
                false,
                false,
                false,
            ))
            .locksystem(MemLs::new());
        if secret != "/" {
            builder = builder.strip_prefix(secret.clone());
        }

        let auth = config
            .server
            .auth_enabled()
            .then(|| BasicAuth::new(&config.server.username, &config.server.password));

        Self {
            service,
            status_path: join_url_path(&secret, &config.lifecycle.status_file_name),
            secret,
            auth,
            plain: builder.build_handler(),
        }
    }

    /// Handles one request end to end.
    pub async fn serve(&self, req: Request) -> Response {
        let path = decode_path(req.uri().path()).into_owned();
        let method = req.method().clone();

        if strip_path_prefix(&self.secret, &path).is_none() {
            debug!("Rejecting {method} {path}: outside secret path");
            return unauthorized(false);
        }

        if let Some(auth) = &self.auth {
            match auth.check(req.headers()) {
                AuthOutcome::Granted => {}
                AuthOutcome::Missing => return unauthorized(true),
                AuthOutcome::Rejected => return unauthorized(false),
            }
        }

        debug!("Web request {method} {path}");

        if is_read(&method) && path == self.status_path {
            return text_response(&method, self.service.status_report());
        }

        if let Some((route, sub_path)) = self.service.routes().lookup(&path) {
            if !route.fs.is_complete(&sub_path) {
                debug!("Streaming {sub_path} from torrent under {}", route.prefix);
                return self.serve_streaming(&route, &method, &path, req).await;
            }
            debug!("Serving completed {sub_path} from disk");
        }

        self.serve_plain(&method, &path, req).await
    }

    async fn serve_streaming(
        &self,
        route: &Route,
        method: &Method,
        path: &str,
        req: Request,
    ) -> Response {
        if !is_streaming_method(method) {
            let mut response = status_response(StatusCode::METHOD_NOT_ALLOWED);
            response.headers_mut().insert(
                header::ALLOW,
                HeaderValue::from_static("GET, HEAD, OPTIONS, PROPFIND"),
            );
            return response;
        }
        if is_read(method) && path.ends_with('/') {
            return bootstrap_response(method);
        }

        let handler = DavHandler::builder()
            .filesystem(TorrentDavFs::new(Arc::clone(&route.fs)))
            .locksystem(FakeLs::new())
            .strip_prefix(route.prefix.clone())
            .build_handler();
        handler.handle(req).await.map(Body::new)
    }

    async fn serve_plain(&self, method: &Method, path: &str, req: Request) -> Response {
        if is_read(method) && path.ends_with('/') {
            return bootstrap_response(method);
        }
        self.plain.handle(req).await.map(Body::new)
    }
}

fn decode_path(raw: &str) -> Cow<'_, str> {
    urlencoding::decode(raw).unwrap_or(Cow::Borrowed(raw))
}

fn is_read(method: &Method) -> bool {
    method == Method::GET || method == Method::HEAD
}

fn is_streaming_method(method: &Method) -> bool {
    is_read(method) || method == Method::OPTIONS || method.as_str() == "PROPFIND"
}

fn status_response(status: StatusCode) -> Response {
    let mut response = Response::new(Body::from(
        status.canonical_reason().unwrap_or_default().to_string(),
    ));
    *response.status_mut() = status;
    response
}

fn text_response(method: &Method, text: String) -> Response {
    let length = text.len();
    let body = if method == Method::HEAD {
        Body::empty()
    } else {
        Body::from(text)
    };
    let mut response = Response::new(body);
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(length));
    response
}

fn bootstrap_response(method: &Method) -> Response {
    let body = if method == Method::HEAD {
        Body::empty()
    } else {
        Body::from(BOOTSTRAP_PAGE)
    };
    let mut response = Response::new(body);
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/html; charset=utf-8"),
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(BOOTSTRAP_PAGE.len()));
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_path() {
        assert_eq!(decode_path("/a%20b/c"), "/a b/c");
        assert_eq!(decode_path("/plain"), "/plain");
        assert_eq!(decode_path("/bad%ff"), "/bad%ff");
    }

    #[test]
    fn test_streaming_methods() {
        assert!(is_streaming_method(&Method::GET));
        assert!(is_streaming_method(&Method::HEAD));
        assert!(is_streaming_method(&Method::OPTIONS));
        assert!(is_streaming_method(
            &Method::from_bytes(b"PROPFIND").unwrap()
        ));
        assert!(!is_streaming_method(&Method::PUT));
        assert!(!is_streaming_method(&Method::DELETE));
        assert!(!is_streaming_method(&Method::from_bytes(b"MKCOL").unwrap()));
    }

    #[test]
    fn test_bootstrap_head_has_no_body() {
        let response = bootstrap_response(&Method::HEAD);
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "text/html; charset=utf-8"
        );
    }
}
