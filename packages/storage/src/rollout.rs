// ABOUTME: Reader for the agent's own rollout JSONL file
// ABOUTME: The rollout is long-term truth for a thread; the daemon only ever reads it

use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncSeekExt, BufReader, Lines};
use tracing::debug;

use crate::error::StoreError;

/// How much of the rollout tail is scanned when refreshing the
/// materialization watermark.
pub const ROLLOUT_TAIL_BYTES: u64 = 512 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RolloutKind {
    OutputLine,
    AgentMessage,
}

/// One interpreted rollout line. Lines the daemon cannot interpret are
/// dropped by the reader.
#[derive(Debug, Clone)]
pub struct RolloutEntry {
    pub timestamp: Option<DateTime<Utc>>,
    pub kind: RolloutKind,
    pub text: String,
}

fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    value
        .get("timestamp")
        .and_then(Value::as_str)
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|ts| ts.with_timezone(&Utc))
}

/// Interpret one rollout line. Agent messages surface as `AgentMessage`;
/// any other payload with text becomes an `OutputLine`.
fn parse_entry(line: &str) -> Option<RolloutEntry> {
    let value: Value = serde_json::from_str(line).ok()?;
    let timestamp = parse_timestamp(&value);
    let payload = value.get("payload").unwrap_or(&value);
    let item_type = payload
        .get("type")
        .and_then(Value::as_str)
        .or_else(|| value.get("type").and_then(Value::as_str))
        .unwrap_or_default();
    let text = payload
        .get("text")
        .or_else(|| payload.get("message"))
        .and_then(Value::as_str)?;
    let kind = match item_type {
        "agent_message" | "agentMessage" => RolloutKind::AgentMessage,
        _ => RolloutKind::OutputLine,
    };
    Some(RolloutEntry {
        timestamp,
        kind,
        text: text.to_string(),
    })
}

/// Latest `timestamp` observed in the last [`ROLLOUT_TAIL_BYTES`] of the
/// rollout file. `None` when the file is missing or carries no timestamps.
pub async fn read_rollout_watermark(path: &Path) -> Option<DateTime<Utc>> {
    let mut file = match File::open(path).await {
        Ok(file) => file,
        Err(_) => return None,
    };
    let len = file.metadata().await.ok()?.len();
    let start = len.saturating_sub(ROLLOUT_TAIL_BYTES);
    if file.seek(SeekFrom::Start(start)).await.is_err() {
        return None;
    }
    let mut buf = String::new();
    if file.read_to_string(&mut buf).await.is_err() {
        debug!(path = %path.display(), "rollout tail was not valid utf-8");
        return None;
    }
    let mut watermark: Option<DateTime<Utc>> = None;
    // The first line after a mid-file seek is usually partial; serde just
    // fails it and we move on.
    for line in buf.lines() {
        if let Ok(value) = serde_json::from_str::<Value>(line) {
            if let Some(ts) = parse_timestamp(&value) {
                watermark = Some(watermark.map_or(ts, |w| w.max(ts)));
            }
        }
    }
    watermark
}

/// Forward reader over a full rollout file, yielding interpreted entries.
pub struct RolloutReader {
    path: PathBuf,
    lines: Lines<BufReader<File>>,
}

impl RolloutReader {
    pub async fn open(path: &Path) -> Result<Option<Self>, StoreError> {
        let file = match File::open(path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StoreError::io(path, e)),
        };
        Ok(Some(Self {
            path: path.to_path_buf(),
            lines: BufReader::new(file).lines(),
        }))
    }

    pub async fn next_entry(&mut self) -> Result<Option<RolloutEntry>, StoreError> {
        loop {
            let line = self
                .lines
                .next_line()
                .await
                .map_err(|e| StoreError::io(&self.path, e))?;
            let Some(line) = line else {
                return Ok(None);
            };
            if let Some(entry) = parse_entry(&line) {
                return Ok(Some(entry));
            }
        }
    }
}
