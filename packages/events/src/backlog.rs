// ABOUTME: Short-lived per-run ring of recently published agent notifications
// ABOUTME: Bridges the agent rollout's materialization lag during replay and restart

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

use codexd_core::RunEventEnvelope;
use codexd_storage::read_rollout_watermark;

/// Most recent notifications retained per run.
pub const BACKLOG_CAPACITY: usize = 50_000;

/// The rollout file persists events a little behind the live stream; events
/// older than the watermark minus this lag are considered materialized.
const MATERIALIZATION_LAG_SECS: i64 = 2;

/// Minimum interval between rollout tail reads.
const MIN_REFRESH_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Default)]
struct RunBacklog {
    events: VecDeque<RunEventEnvelope>,
    rollout_path: Option<PathBuf>,
    materialized_at: Option<DateTime<Utc>>,
    last_refresh: Option<Instant>,
}

impl RunBacklog {
    fn push(&mut self, envelope: RunEventEnvelope) {
        if self.events.len() == BACKLOG_CAPACITY {
            self.events.pop_front();
        }
        self.events.push_back(envelope);
    }

    fn prune(&mut self) {
        let Some(materialized_at) = self.materialized_at else {
            return;
        };
        let cutoff = materialized_at - chrono::Duration::seconds(MATERIALIZATION_LAG_SECS);
        while let Some(front) = self.events.front() {
            if front.created_at <= cutoff {
                self.events.pop_front();
            } else {
                break;
            }
        }
    }

    fn apply_watermark(&mut self, watermark: Option<DateTime<Utc>>) {
        if let Some(watermark) = watermark {
            self.materialized_at = Some(match self.materialized_at {
                Some(current) => current.max(watermark),
                None => watermark,
            });
        }
    }
}

/// In-memory backlog of `codex.notification` envelopes keyed by run id.
#[derive(Default)]
pub struct NotificationBacklog {
    runs: RwLock<HashMap<String, Arc<Mutex<RunBacklog>>>>,
}

impl NotificationBacklog {
    pub fn new() -> Self {
        Self::default()
    }

    async fn entry(&self, run_id: &str) -> Arc<Mutex<RunBacklog>> {
        {
            let runs = self.runs.read().await;
            if let Some(entry) = runs.get(run_id) {
                return Arc::clone(entry);
            }
        }
        let mut runs = self.runs.write().await;
        Arc::clone(runs.entry(run_id.to_string()).or_default())
    }

    /// Remember where the agent's rollout for this run lives.
    pub async fn set_rollout_path(&self, run_id: &str, path: impl Into<PathBuf>) {
        let entry = self.entry(run_id).await;
        let mut backlog = entry.lock().await;
        backlog.rollout_path = Some(path.into());
    }

    /// Buffer a freshly published notification, opportunistically refresh the
    /// materialization watermark, and prune everything already materialized.
    pub async fn add(&self, run_id: &str, envelope: RunEventEnvelope) {
        let entry = self.entry(run_id).await;
        let mut backlog = entry.lock().await;
        backlog.push(envelope);

        let due = backlog
            .last_refresh
            .map_or(true, |at| at.elapsed() >= MIN_REFRESH_INTERVAL);
        if due {
            if let Some(path) = backlog.rollout_path.clone() {
                backlog.last_refresh = Some(Instant::now());
                let watermark = read_rollout_watermark(&path).await;
                backlog.apply_watermark(watermark);
            }
        }
        backlog.prune();
    }

    /// Buffered events strictly newer than the cutoff, oldest first.
    pub async fn snapshot_after(
        &self,
        run_id: &str,
        after_exclusive: Option<DateTime<Utc>>,
    ) -> Vec<RunEventEnvelope> {
        let entry = self.entry(run_id).await;
        let backlog = entry.lock().await;
        backlog
            .events
            .iter()
            .filter(|e| after_exclusive.map_or(true, |cutoff| e.created_at > cutoff))
            .cloned()
            .collect()
    }

    /// Everything still buffered, i.e. not yet known to be materialized.
    pub async fn snapshot_pending(&self, run_id: &str) -> Vec<RunEventEnvelope> {
        self.snapshot_after(run_id, None).await
    }

    /// Timestamp of the most recent buffered notification.
    pub async fn last_notification_at(&self, run_id: &str) -> Option<DateTime<Utc>> {
        let entry = self.entry(run_id).await;
        let backlog = entry.lock().await;
        backlog.events.back().map(|e| e.created_at)
    }

    /// Drop a run's backlog once it can no longer produce notifications.
    pub async fn remove_run(&self, run_id: &str) {
        let mut runs = self.runs.write().await;
        if runs.remove(run_id).is_some() {
            debug!(run_id, "dropped notification backlog");
        }
    }

    #[cfg(test)]
    pub(crate) async fn force_watermark(&self, run_id: &str, watermark: DateTime<Utc>) {
        let entry = self.entry(run_id).await;
        let mut backlog = entry.lock().await;
        backlog.apply_watermark(Some(watermark));
        backlog.prune();
    }
}
