//! HTTP server wiring.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::extract::{Request, State};
use axum::response::Response;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::WebError;
use crate::multiplexer::Multiplexer;

/// Builds the router sending every method and path to the multiplexer.
pub fn router(multiplexer: Arc<Multiplexer>) -> Router {
    Router::new()
        .fallback(dispatch)
        .layer(TraceLayer::new_for_http())
        .with_state(multiplexer)
}

async fn dispatch(State(multiplexer): State<Arc<Multiplexer>>, req: Request) -> Response {
    multiplexer.serve(req).await
}

/// Binds `addr` and serves until the listener fails.
///
/// # Errors
/// - `WebError::Bind` - The address could not be bound
/// - `WebError::Serve` - The server loop failed
pub async fn run_server(addr: SocketAddr, multiplexer: Arc<Multiplexer>) -> Result<(), WebError> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|source| WebError::Bind { addr, source })?;
    serve(listener, multiplexer).await
}

/// Serves on an already bound listener.
///
/// # Errors
/// - `WebError::Serve` - The server loop failed
pub async fn serve(listener: TcpListener, multiplexer: Arc<Multiplexer>) -> Result<(), WebError> {
    if let Ok(addr) = listener.local_addr() {
        info!("WebDAV server listening on http://{addr}");
    }
    axum::serve(listener, router(multiplexer))
        .await
        .map_err(WebError::Serve)
}
