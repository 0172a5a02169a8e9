//! tordav web - WebDAV frontend
//!
//! Serves the torrents directory over WebDAV, streaming content of
//! incomplete torrents straight from the swarm.

pub mod auth;
pub mod dav;
pub mod multiplexer;
pub mod server;

use std::net::SocketAddr;

pub use multiplexer::Multiplexer;
pub use server::{router, run_server, serve};

/// Errors raised by the HTTP server.
#[derive(Debug, thiserror::Error)]
pub enum WebError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },

    #[error("Server error: {0}")]
    Serve(std::io::Error),
}
