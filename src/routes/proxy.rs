//! `/v1/*` entry point: everything under the provider API prefix goes to the
//! proxy engine untouched.

use std::sync::Arc;

use axum::{extract::State, response::Response};

use crate::AppState;

pub async fn forward(
    State(state): State<Arc<AppState>>,
    req: axum::extract::Request,
) -> Response {
    state.engine.handle(req).await
}
