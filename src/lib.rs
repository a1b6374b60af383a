//! Pathgate - a path-prefix reverse proxy that supervises its backends
//!
//! This library provides a small gateway that:
//! - Launches a fixed set of backend subprocesses on private local ports
//! - Routes HTTP traffic to them by URL path prefix (mount points)
//! - Tunnels WebSocket and other Upgrade requests to the matched backend
//! - Answers a static health message on `GET /`
//! - Terminates every backend exactly once on shutdown

pub mod config;
pub mod error;
pub mod gateway;
pub mod pool;
pub mod process;
pub mod proxy;
pub mod router;

/// Package name from Cargo.toml
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");
/// Package version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
