// ABOUTME: Event envelope and run-index entry types
// ABOUTME: Envelopes wrap every persisted raw event and every SSE frame

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Well-known envelope event types.
pub mod event_type {
    pub const RUN_META: &str = "run.meta";
    pub const RUN_COMPLETED: &str = "run.completed";
    pub const RUN_PAUSED: &str = "run.paused";
    pub const CODEX_NOTIFICATION: &str = "codex.notification";
}

/// Common wrapper for raw-log lines and SSE frames: `{type, createdAt, data}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunEventEnvelope {
    #[serde(rename = "type")]
    pub event_type: String,
    pub created_at: DateTime<Utc>,
    pub data: serde_json::Value,
}

impl RunEventEnvelope {
    pub fn new(
        event_type: impl Into<String>,
        created_at: DateTime<Utc>,
        data: serde_json::Value,
    ) -> Self {
        Self {
            event_type: event_type.into(),
            created_at,
            data,
        }
    }

    /// Envelopes that end a follow stream.
    pub fn ends_stream(&self) -> bool {
        self.event_type == event_type::RUN_COMPLETED || self.event_type == event_type::RUN_PAUSED
    }
}

/// One line of the global `runs/index.jsonl`, mapping run id to its directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunIndexEntry {
    pub run_id: String,
    pub created_at: DateTime<Utc>,
    pub cwd: String,
    pub relative_dir: String,
}
