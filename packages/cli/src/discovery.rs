// ABOUTME: daemon.runtime.json discovery file so local CLIs can find a running daemon

use std::path::Path;

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

const RUNTIME_FILE: &str = "daemon.runtime.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeFile {
    pub base_url: String,
    pub port: u16,
    pub pid: u32,
    pub started_at_utc: DateTime<Utc>,
    pub state_dir: String,
    pub version: String,
}

pub async fn write_runtime_file(state_dir: &Path, runtime: &RuntimeFile) -> anyhow::Result<()> {
    let path = state_dir.join(RUNTIME_FILE);
    let json = serde_json::to_vec_pretty(runtime)?;
    tokio::fs::write(&path, json)
        .await
        .with_context(|| format!("writing {}", path.display()))?;
    debug!(path = %path.display(), "wrote daemon runtime file");
    Ok(())
}

pub async fn remove_runtime_file(state_dir: &Path) {
    let path = state_dir.join(RUNTIME_FILE);
    if tokio::fs::remove_file(&path).await.is_ok() {
        debug!(path = %path.display(), "removed daemon runtime file");
    }
}
