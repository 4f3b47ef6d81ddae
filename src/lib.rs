//! Rebuildgate - A reverse proxy that rebuilds its backend on demand
//!
//! This library provides a development-time reverse proxy that:
//! - Runs a freshness check command before every request
//! - Rebuilds and/or restarts the backend process when the check asks for it
//! - Waits for the backend to accept HTTP before forwarding
//! - Captures build and run output and returns it on server errors
//! - Serializes all rebuilds behind a single lock so concurrent requests queue

pub mod config;
pub mod diagnostics;
pub mod error;
pub mod freshness;
pub mod output;
pub mod pool;
pub mod process;
pub mod proxy;
pub mod readiness;
pub mod supervisor;

/// Crate version for the startup banner
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
/// Crate name for the startup banner
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");
