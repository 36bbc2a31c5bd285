// ABOUTME: Rollup record type, the daemon's derived line-oriented log entries
// ABOUTME: Written to rollup.jsonl by the rollup writer and served by /messages

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RollupKind {
    OutputLine,
    AgentMessage,
}

/// One line of `rollup.jsonl`: a completed output line or a full agent message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRollupRecord {
    #[serde(rename = "type")]
    pub kind: RollupKind,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ends_with_newline: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_control: Option<bool>,
}

impl RunRollupRecord {
    pub fn output_line(
        created_at: DateTime<Utc>,
        source: Option<String>,
        text: impl Into<String>,
        ends_with_newline: bool,
    ) -> Self {
        Self {
            kind: RollupKind::OutputLine,
            created_at,
            source,
            text: text.into(),
            ends_with_newline: Some(ends_with_newline),
            is_control: Some(false),
        }
    }

    pub fn control(created_at: DateTime<Utc>, source: Option<String>, marker: impl Into<String>) -> Self {
        Self {
            kind: RollupKind::OutputLine,
            created_at,
            source,
            text: marker.into(),
            ends_with_newline: None,
            is_control: Some(true),
        }
    }

    pub fn agent_message(created_at: DateTime<Utc>, text: impl Into<String>) -> Self {
        Self {
            kind: RollupKind::AgentMessage,
            created_at,
            source: None,
            text: text.into(),
            ends_with_newline: None,
            is_control: None,
        }
    }

    pub fn is_control(&self) -> bool {
        self.is_control.unwrap_or(false)
    }
}
