//! Tethergate - a supervising reverse proxy
//!
//! This library provides a proxy that:
//! - Launches a single backend HTTP server as a child process on demand
//! - Polls the backend's health endpoint until it is ready to serve traffic
//! - Restarts the backend when it is found to have exited
//! - Forwards every inbound request to the backend, streaming bodies both ways
//! - Turns backend failures into plain-text 503/500 responses

pub mod config;
pub mod error;
pub mod proxy;
pub mod supervisor;

/// Package name from Cargo.toml
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");
/// Package version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
