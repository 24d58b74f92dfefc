//! Load-balancing reverse proxy core for LLM APIs.
//!
//! End clients speak the upstream vendor protocol unchanged; the proxy picks
//! one of many configured accounts, forwards the request, streams the
//! response back, and records telemetry through an async writer. The CLI,
//! TUI and dashboard front-ends consume this crate.

pub mod accounts;
pub mod auth;
pub mod config;
pub mod constants;
pub mod db;
pub mod error;
pub mod maintenance;
pub mod pricing;
pub mod providers;
pub mod proxy;
pub mod routes;
pub mod scheduler;
pub mod transforms;
pub mod usage;
pub mod usage_cache;
pub mod writer;

use std::sync::Arc;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const GIT_HASH: &str = env!("GIT_HASH");
pub const BUILD_TIME: &str = env!("BUILD_TIME");

pub struct AppState {
    pub engine: Arc<proxy::ProxyEngine>,
}
