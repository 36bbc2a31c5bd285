// ABOUTME: Agent-message listing and thinking-summary extraction endpoints
// ABOUTME: Both read the derived rollup log, never the raw event log

use axum::{
    extract::{Path, Query, State},
    response::IntoResponse,
    Json,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;

use codexd_core::{RollupKind, RunRollupRecord};
use codexd_storage::TAIL_CAP;

use crate::error::ApiError;
use crate::runs_handlers::{parse_bool_param, parse_positive_param};
use crate::AppState;

const MAX_MESSAGE_COUNT: usize = 50;
const DEFAULT_TAIL_EVENTS: usize = 5_000;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagesQuery {
    count: Option<String>,
    tail_events: Option<String>,
}

/// GET /v1/runs/{id}/messages?count=&tailEvents=
pub async fn list_messages(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
    Query(query): Query<MessagesQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let count = parse_positive_param("count", query.count.as_deref(), MAX_MESSAGE_COUNT)?
        .unwrap_or(1);
    let tail_events =
        parse_positive_param("tailEvents", query.tail_events.as_deref(), TAIL_CAP)?
            .unwrap_or(DEFAULT_TAIL_EVENTS);

    ensure_run_exists(&state, &run_id).await?;
    let records = state
        .store
        .read_rollup(&run_id, Some(tail_events))
        .await
        .map_err(|e| ApiError::internal(e.to_string()))?;

    let messages: Vec<_> = records
        .iter()
        .filter(|r| r.kind == RollupKind::AgentMessage)
        .collect();
    let items: Vec<_> = messages
        .iter()
        .rev()
        .take(count)
        .rev()
        .map(|r| json!({ "createdAt": r.created_at, "text": r.text }))
        .collect();
    Ok(Json(json!({ "items": items })))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThinkingSummariesQuery {
    tail_events: Option<String>,
    timestamps: Option<String>,
}

/// GET /v1/runs/{id}/thinking-summaries?tailEvents=&timestamps=
pub async fn thinking_summaries(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
    Query(query): Query<ThinkingSummariesQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let tail_events =
        parse_positive_param("tailEvents", query.tail_events.as_deref(), TAIL_CAP)?
            .unwrap_or(DEFAULT_TAIL_EVENTS);
    let timestamps = parse_bool_param("timestamps", query.timestamps.as_deref(), false)?;

    ensure_run_exists(&state, &run_id).await?;
    let records = state
        .store
        .read_rollup(&run_id, Some(tail_events))
        .await
        .map_err(|e| ApiError::internal(e.to_string()))?;

    let summaries = extract_thinking_summaries(&records);
    let items = if timestamps {
        json!(summaries
            .iter()
            .map(|(created_at, text)| json!({ "createdAt": created_at, "text": text }))
            .collect::<Vec<_>>())
    } else {
        json!(summaries.iter().map(|(_, text)| text).collect::<Vec<_>>())
    };
    Ok(Json(json!({ "items": items })))
}

async fn ensure_run_exists(state: &AppState, run_id: &str) -> Result<(), ApiError> {
    state
        .store
        .try_get(run_id)
        .await
        .map_err(|e| ApiError::internal(e.to_string()))?
        .map(|_| ())
        .ok_or_else(|| ApiError::not_found("not_found"))
}

/// Within spans opened by a `thinking` control marker and closed by `final`
/// (or on any line that itself mentions "thinking"), every trimmed line
/// wrapped in `**` yields a summary. Consecutive duplicates are suppressed.
pub(crate) fn extract_thinking_summaries(
    records: &[RunRollupRecord],
) -> Vec<(DateTime<Utc>, String)> {
    let mut out: Vec<(DateTime<Utc>, String)> = Vec::new();
    let mut in_span = false;
    let mut last: Option<String> = None;
    for record in records {
        if record.kind != RollupKind::OutputLine {
            continue;
        }
        if record.is_control() {
            let marker = record.text.trim().to_ascii_lowercase();
            if marker == "thinking" {
                in_span = true;
            } else if marker == "final" {
                in_span = false;
            }
            continue;
        }
        let eligible = in_span || record.text.contains("thinking");
        if !eligible {
            continue;
        }
        for line in record.text.split('\n') {
            let line = line.trim();
            if line.len() > 4 && line.starts_with("**") && line.ends_with("**") {
                let summary = line[2..line.len() - 2].trim().to_string();
                if last.as_deref() != Some(summary.as_str()) {
                    last = Some(summary.clone());
                    out.push((record.created_at, summary));
                }
            }
        }
    }
    out
}
