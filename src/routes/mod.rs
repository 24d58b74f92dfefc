pub mod health;
pub mod proxy;

use std::sync::Arc;

use axum::{
    Router,
    routing::{any, get},
};

use crate::AppState;

/// Core routes: everything under the provider API prefix goes to the proxy
/// engine, plus health/version. Front-ends (dashboard API under `/api`,
/// admin UI) merge their own routers with this one.
pub fn core_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health::health))
        .route("/version", get(health::version))
        .route("/v1/{*path}", any(proxy::forward))
        .with_state(state)
}
