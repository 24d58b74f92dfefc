use axum::Json;
use serde_json::{Value, json};

pub async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

pub async fn version() -> Json<Value> {
    Json(json!({
        "version": crate::VERSION,
        "git_hash": crate::GIT_HASH,
        "build_time": crate::BUILD_TIME,
    }))
}
