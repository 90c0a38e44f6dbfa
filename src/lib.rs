//! Appgate - a front door that launches sub-applications on demand
//!
//! This library provides a single externally reachable HTTP server that:
//! - Lists a fixed set of configured applications on a landing page
//! - Spawns an application's process lazily, on the first request for it
//! - Guarantees at most one live process per application
//! - Waits for the process to accept connections, serving a self-refreshing
//!   placeholder if it is not ready in time
//! - Proxies traffic to the process over a pooled HTTP client, and tunnels
//!   WebSocket upgrades straight through to it
//! - Answers immediately with an error page when a child exits during startup
//! - Passes one API credential to every child through its environment

pub mod config;
pub mod credentials;
pub mod error;
pub mod frontend;
pub mod html;
pub mod pool;
pub mod probe;
pub mod process;
pub mod proxy;

/// Package name from Cargo.toml
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");
/// Package version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
