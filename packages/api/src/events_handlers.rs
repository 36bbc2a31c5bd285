// ABOUTME: The replay+follow SSE endpoint: persisted history and live events, no gaps
// ABOUTME: Subscribes before replaying, dedups on maxReplayedAt, ends on terminal envelopes

use std::convert::Infallible;
use std::path::PathBuf;

use async_stream::stream;
use axum::{
    extract::{Path, Query, State},
    response::IntoResponse,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use codexd_core::{event_type, RunEventEnvelope, RunStatus};
use codexd_storage::{RolloutKind, RolloutReader, TAIL_CAP};

use crate::error::ApiError;
use crate::runs_handlers::{parse_bool_param, parse_positive_param};
use crate::sse::{create_sse_response, envelope_event, json_event};
use crate::AppState;

#[derive(Debug, Clone, Copy, PartialEq)]
enum ReplayFormat {
    Auto,
    Raw,
    Rollup,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventsQuery {
    replay: Option<String>,
    follow: Option<String>,
    tail: Option<String>,
    replay_format: Option<String>,
}

/// GET /v1/runs/{id}/events?replay=&follow=&tail=&replayFormat=
pub async fn run_events(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
    Query(query): Query<EventsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let replay = parse_bool_param("replay", query.replay.as_deref(), true)?;
    let follow = parse_bool_param("follow", query.follow.as_deref(), true)?;
    let tail = parse_positive_param("tail", query.tail.as_deref(), TAIL_CAP)?;
    let format = match query.replay_format.as_deref() {
        None | Some("auto") => ReplayFormat::Auto,
        Some("raw") => ReplayFormat::Raw,
        Some("rollup") => ReplayFormat::Rollup,
        Some(other) => {
            return Err(ApiError::bad_request(
                "invalid_query",
                format!("replayFormat must be auto, raw, or rollup, got {other:?}"),
            ))
        }
    };

    let run = state
        .store
        .try_get(&run_id)
        .await
        .map_err(|e| ApiError::internal(e.to_string()))?
        .ok_or_else(|| ApiError::not_found("not_found"))?;

    let stream = stream! {
        // Subscribe before touching history so nothing published during the
        // replay can be missed; the dedup guard handles the overlap.
        let mut subscription = if follow && !run.status.is_terminal() {
            Some(state.broadcaster.subscribe(&run_id))
        } else {
            None
        };

        if let Ok(event) = json_event(event_type::RUN_META, &run) {
            yield Ok::<_, Infallible>(event);
        }

        let mut max_replayed_at: Option<DateTime<Utc>> = None;
        let mut last_event_type: Option<String> = None;

        let rollout_path = run.codex_rollout_path.clone().map(PathBuf::from);
        let rollout_exists = match &rollout_path {
            Some(path) => tokio::fs::metadata(path).await.is_ok(),
            None => false,
        };

        if replay {
            let use_rollup = match format {
                ReplayFormat::Rollup => true,
                ReplayFormat::Auto => rollout_exists,
                ReplayFormat::Raw => false,
            };
            if use_rollup {
                let mut rollout_max: Option<DateTime<Utc>> = None;
                if let Some(path) = rollout_path.filter(|_| rollout_exists) {
                    match RolloutReader::open(&path).await {
                        Ok(Some(mut reader)) => loop {
                            match reader.next_entry().await {
                                Ok(Some(entry)) => {
                                    if let Some(ts) = entry.timestamp {
                                        rollout_max =
                                            Some(rollout_max.map_or(ts, |max| max.max(ts)));
                                    }
                                    let name = match entry.kind {
                                        RolloutKind::AgentMessage => "codex.rollup.agentMessage",
                                        RolloutKind::OutputLine => "codex.rollup.outputLine",
                                    };
                                    let data = json!({
                                        "createdAt": entry.timestamp,
                                        "text": entry.text,
                                    });
                                    last_event_type = Some(name.to_string());
                                    if let Ok(event) = json_event(name, &data) {
                                        yield Ok(event);
                                    }
                                }
                                Ok(None) => break,
                                Err(e) => {
                                    warn!(run_id = %run_id, error = %e, "rollout replay failed");
                                    break;
                                }
                            }
                        },
                        Ok(None) => {}
                        Err(e) => warn!(run_id = %run_id, error = %e, "rollout open failed"),
                    }
                }
                // Bridge the rollout's materialization lag with buffered
                // notifications newer than anything it contained.
                if follow {
                    for envelope in state.backlog.snapshot_after(&run_id, rollout_max).await {
                        max_replayed_at = Some(
                            max_replayed_at
                                .map_or(envelope.created_at, |max| max.max(envelope.created_at)),
                        );
                        last_event_type = Some(envelope.event_type.clone());
                        if let Ok(event) = envelope_event(&envelope) {
                            yield Ok(event);
                        }
                    }
                }
            } else {
                let explicit_raw = format == ReplayFormat::Raw;
                if explicit_raw || !rollout_exists {
                    match replay_raw(&state, &run_id, tail).await {
                        Ok(envelopes) => {
                            for envelope in envelopes {
                                if envelope.event_type == event_type::RUN_META {
                                    continue;
                                }
                                max_replayed_at = Some(
                                    max_replayed_at.map_or(envelope.created_at, |max| {
                                        max.max(envelope.created_at)
                                    }),
                                );
                                last_event_type = Some(envelope.event_type.clone());
                                if let Ok(event) = envelope_event(&envelope) {
                                    yield Ok(event);
                                }
                            }
                        }
                        Err(e) => warn!(run_id = %run_id, error = %e, "raw replay failed"),
                    }
                }
            }
        }

        // Re-read the record: it may have finished while we replayed.
        let current = state
            .store
            .try_get(&run_id)
            .await
            .ok()
            .flatten()
            .unwrap_or_else(|| run.clone());
        let settled = current.status.is_terminal() || current.status == RunStatus::Paused;
        if settled {
            let name = if current.status == RunStatus::Paused {
                event_type::RUN_PAUSED
            } else {
                event_type::RUN_COMPLETED
            };
            let already_emitted = matches!(
                last_event_type.as_deref(),
                Some(event_type::RUN_COMPLETED) | Some(event_type::RUN_PAUSED)
            );
            if !already_emitted {
                let synthesized =
                    RunEventEnvelope::new(name, Utc::now(), json!(&current));
                if let Ok(event) = envelope_event(&synthesized) {
                    yield Ok(event);
                }
            }
            return;
        }
        if !follow {
            return;
        }

        if let Some(subscription) = subscription.as_mut() {
            while let Some(envelope) = subscription.recv().await {
                if envelope.event_type == event_type::RUN_META {
                    continue;
                }
                // Dedup against the replay: strictly-older events were already
                // sent; ties are re-sent so boundary events are never lost.
                if let Some(max) = max_replayed_at {
                    if envelope.created_at < max {
                        continue;
                    }
                }
                let ends = envelope.ends_stream();
                if let Ok(event) = envelope_event(&envelope) {
                    yield Ok(event);
                }
                if ends {
                    debug!(run_id = %run_id, "follow stream ended on terminal envelope");
                    break;
                }
            }
        }
    };

    Ok(create_sse_response(stream))
}

async fn replay_raw(
    state: &AppState,
    run_id: &str,
    tail: Option<usize>,
) -> Result<Vec<RunEventEnvelope>, codexd_storage::StoreError> {
    match tail {
        Some(tail) => state.store.read_raw_events(run_id, Some(tail)).await,
        None => {
            // Full replay, streamed off disk with the corrupt-line-tolerant reader.
            let mut envelopes = Vec::new();
            if let Some(mut reader) = state.store.open_raw_events(run_id).await? {
                while let Some(envelope) = reader.next_record().await? {
                    envelopes.push(envelope);
                }
            }
            Ok(envelopes)
        }
    }
}
