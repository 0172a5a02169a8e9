//! Integration tests for tordav
//!
//! Drive the lifecycle manager and the request multiplexer together over a
//! temporary torrents directory and the simulated engine.

#[path = "integration/fixtures.rs"]
mod fixtures;

#[path = "integration/lifecycle.rs"]
mod lifecycle;

#[path = "integration/multiplexer.rs"]
mod multiplexer;
