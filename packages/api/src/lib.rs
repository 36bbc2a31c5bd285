// ABOUTME: HTTP API layer for codexd providing the /v1 surface and routing
// ABOUTME: Stateless handlers over the run manager, store, broadcaster, and backlog

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;

use codexd_agent::RuntimeState;
use codexd_events::{EventBroadcaster, NotificationBacklog};
use codexd_runs::RunManager;
use codexd_storage::RunStore;

pub mod error;
pub mod events_handlers;
pub mod messages_handlers;
pub mod runs_handlers;
pub mod sse;
pub mod system_handlers;

pub use error::ApiError;

/// Static facts about this daemon instance, served by `/v1/info`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerInfo {
    pub started_at_utc: DateTime<Utc>,
    pub runner_id: String,
    pub version: String,
    pub informational_version: String,
    pub listen: String,
    pub port: u16,
    pub require_auth: bool,
    pub state_dir: String,
    pub base_url: String,
}

/// Shared state for every handler.
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<RunManager>,
    pub store: Arc<RunStore>,
    pub broadcaster: Arc<EventBroadcaster>,
    pub backlog: Arc<NotificationBacklog>,
    pub runtime_state: watch::Receiver<RuntimeState>,
    pub info: Arc<ServerInfo>,
}

/// Creates the `/v1` API router.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/v1/health", get(system_handlers::health))
        .route("/v1/info", get(system_handlers::info))
        .route(
            "/v1/runs",
            post(runs_handlers::create_run).get(runs_handlers::list_runs),
        )
        .route("/v1/runs/{id}", get(runs_handlers::get_run))
        .route("/v1/runs/{id}/interrupt", post(runs_handlers::interrupt_run))
        .route("/v1/runs/{id}/stop", post(runs_handlers::stop_run))
        .route("/v1/runs/{id}/resume", post(runs_handlers::resume_run))
        .route("/v1/runs/{id}/steer", post(runs_handlers::steer_run))
        .route("/v1/runs/{id}/messages", get(messages_handlers::list_messages))
        .route(
            "/v1/runs/{id}/thinking-summaries",
            get(messages_handlers::thinking_summaries),
        )
        .route("/v1/runs/{id}/events", get(events_handlers::run_events))
        .with_state(state)
}
