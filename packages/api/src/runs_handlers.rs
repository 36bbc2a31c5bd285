// ABOUTME: HTTP handlers for the run lifecycle: create, list, detail, and control operations

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use codexd_core::{normalize_cwd, CreateRunRequest};
use codexd_runs::RunError;

use crate::error::ApiError;
use crate::AppState;

/// Parse a lenient boolean query value; anything else is a 400.
pub(crate) fn parse_bool_param(
    name: &'static str,
    value: Option<&str>,
    default: bool,
) -> Result<bool, ApiError> {
    match value {
        None => Ok(default),
        Some("true") | Some("1") => Ok(true),
        Some("false") | Some("0") => Ok(false),
        Some(other) => Err(ApiError::bad_request(
            "invalid_query",
            format!("{name} must be a boolean, got {other:?}"),
        )),
    }
}

/// Parse a positive integer query value, clamped to `cap`. Zero is rejected.
pub(crate) fn parse_positive_param(
    name: &'static str,
    value: Option<&str>,
    cap: usize,
) -> Result<Option<usize>, ApiError> {
    match value {
        None => Ok(None),
        Some(raw) => {
            let parsed: usize = raw.parse().map_err(|_| {
                ApiError::bad_request(
                    "invalid_query",
                    format!("{name} must be a positive integer, got {raw:?}"),
                )
            })?;
            if parsed == 0 {
                return Err(ApiError::bad_request(
                    "invalid_query",
                    format!("{name} must be greater than zero"),
                ));
            }
            Ok(Some(parsed.min(cap)))
        }
    }
}

fn map_create_error(error: RunError) -> ApiError {
    match error {
        RunError::Validation(e) => ApiError::bad_request(e.code(), e.to_string()),
        RunError::Store(e) => ApiError::internal(e.to_string()),
        other => ApiError::internal(other.to_string()),
    }
}

/// POST /v1/runs - create a run and launch its executor.
pub async fn create_run(
    State(state): State<AppState>,
    Json(request): Json<CreateRunRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let run = state
        .manager
        .create_and_start(request)
        .await
        .map_err(map_create_error)?;
    Ok(Json(json!({ "runId": run.run_id, "status": run.status })))
}

#[derive(Deserialize)]
pub struct ListRunsQuery {
    cwd: Option<String>,
    all: Option<String>,
}

/// GET /v1/runs?cwd=&all= - list runs for a working directory, or all of them.
pub async fn list_runs(
    State(state): State<AppState>,
    Query(query): Query<ListRunsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let all = parse_bool_param("all", query.all.as_deref(), false)?;
    let cwd = query
        .cwd
        .as_deref()
        .map(normalize_cwd)
        .filter(|cwd| !cwd.is_empty());
    if !all && cwd.is_none() {
        return Err(ApiError::bad_request(
            "cwd_required_unless_all",
            "pass cwd= or all=true",
        ));
    }
    let filter = if all { None } else { cwd.as_deref() };
    let runs = state
        .store
        .list_by_cwd(filter)
        .await
        .map_err(|e| ApiError::internal(e.to_string()))?;
    debug!(count = runs.len(), "listed runs");
    Ok(Json(json!({ "items": runs })))
}

/// GET /v1/runs/{id} - run detail.
pub async fn get_run(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let run = state
        .store
        .try_get(&run_id)
        .await
        .map_err(|e| ApiError::internal(e.to_string()))?
        .ok_or_else(|| ApiError::not_found("not_found"))?;
    Ok(Json(run))
}

/// POST /v1/runs/{id}/interrupt - best-effort interrupt of a live run.
pub async fn interrupt_run(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    if state.manager.try_interrupt(&run_id).await {
        Ok(StatusCode::ACCEPTED)
    } else {
        Err(ApiError::not_found("not_found_or_not_running"))
    }
}

/// POST /v1/runs/{id}/stop - stop a live exec run into `paused`.
pub async fn stop_run(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    if state.manager.try_stop(&run_id).await {
        Ok(StatusCode::ACCEPTED)
    } else {
        Err(ApiError::not_found("not_found_or_not_running"))
    }
}

#[derive(Deserialize, Default)]
pub struct ResumeRequest {
    prompt: Option<String>,
    effort: Option<String>,
}

/// POST /v1/runs/{id}/resume - requeue a paused exec run.
pub async fn resume_run(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
    body: Option<Json<ResumeRequest>>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(request) = body.unwrap_or_default();
    let run = state
        .manager
        .resume(&run_id, request.prompt, request.effort)
        .await
        .map_err(|error| match error {
            RunError::NotFound | RunError::NotResumable => {
                ApiError::not_found("not_found_or_not_resumable")
            }
            other => ApiError::internal(other.to_string()),
        })?;
    Ok(Json(json!({ "runId": run.run_id, "status": run.status })))
}

#[derive(Deserialize, Default)]
pub struct SteerRequest {
    prompt: Option<String>,
}

/// POST /v1/runs/{id}/steer - inject steering input into the current turn.
pub async fn steer_run(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
    body: Option<Json<SteerRequest>>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(request) = body.unwrap_or_default();
    let prompt = request.prompt.as_deref().map(str::trim).unwrap_or_default();
    if prompt.is_empty() {
        return Err(ApiError::bad_request("prompt_required", "prompt is required"));
    }
    state
        .manager
        .steer(&run_id, prompt)
        .await
        .map_err(|error| match error {
            RunError::NotFound => ApiError::not_found("not_found"),
            RunError::MissingCodexIds => ApiError::conflict("run_missing_codex_ids"),
            RunError::Steer(message) => ApiError::bad_request("steer_failed", message),
            other => ApiError::internal(other.to_string()),
        })?;
    Ok(Json(json!({ "status": "ok" })))
}
