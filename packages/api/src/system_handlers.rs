// ABOUTME: Health and daemon-info endpoints

use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::AppState;

/// GET /v1/health - liveness plus the agent runtime state.
pub async fn health(State(state): State<AppState>) -> Json<Value> {
    let runtime = *state.runtime_state.borrow();
    Json(json!({
        "status": "ok",
        "codexRuntime": runtime.as_str(),
    }))
}

/// GET /v1/info - static facts about this daemon instance.
pub async fn info(State(state): State<AppState>) -> Json<Value> {
    Json(serde_json::to_value(state.info.as_ref()).unwrap_or_default())
}
