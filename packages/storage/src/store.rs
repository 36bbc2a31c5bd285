// ABOUTME: The run store: atomic run.json, append-only event and rollup logs, global index
// ABOUTME: Writes serialize through one mutex; readers share the files

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use codexd_core::{
    cwd_equal, generate_run_id, NewRunSpec, Run, RunEventEnvelope, RunIndexEntry, RunRollupRecord,
    RunStatus,
};

use crate::error::StoreError;
use crate::jsonl::{append_line, read_tail, JsonlReader};

/// Hard cap on tail reads of the raw event and rollup logs.
pub const TAIL_CAP: usize = 200_000;

/// Upper bound on day directories visited when repairing a missing index entry.
const MAX_DAY_DIR_SCAN: usize = 5_000;

#[derive(Debug, Clone)]
pub struct RunStoreOptions {
    /// When false, `append_raw_event` becomes a no-op; the rollup is always written.
    pub persist_raw_events: bool,
}

impl Default for RunStoreOptions {
    fn default() -> Self {
        Self {
            persist_raw_events: true,
        }
    }
}

pub struct RunStore {
    state_dir: PathBuf,
    persist_raw_events: bool,
    write_lock: Mutex<()>,
}

impl RunStore {
    pub fn new(state_dir: impl Into<PathBuf>, options: RunStoreOptions) -> Self {
        Self {
            state_dir: state_dir.into(),
            persist_raw_events: options.persist_raw_events,
            write_lock: Mutex::new(()),
        }
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    pub fn raw_events_enabled(&self) -> bool {
        self.persist_raw_events
    }

    fn runs_dir(&self) -> PathBuf {
        self.state_dir.join("runs")
    }

    fn index_path(&self) -> PathBuf {
        self.runs_dir().join("index.jsonl")
    }

    fn dir_from_relative(&self, relative_dir: &str) -> PathBuf {
        self.state_dir.join(relative_dir)
    }

    /// Allocate a run id, create the dated directory, append the index entry,
    /// and persist the initial `queued` record.
    pub async fn create(&self, spec: &NewRunSpec) -> Result<(Run, PathBuf), StoreError> {
        let run_id = generate_run_id();
        let created_at = Utc::now();
        let relative_dir = format!("runs/{}/{}", created_at.format("%Y/%m/%d"), run_id);
        let dir = self.dir_from_relative(&relative_dir);

        let run = Run {
            run_id: run_id.clone(),
            created_at,
            started_at: None,
            completed_at: None,
            cwd: spec.cwd.clone(),
            status: RunStatus::Queued,
            kind: spec.kind,
            prompt: spec.prompt.clone(),
            review: spec.review.clone(),
            codex_thread_id: None,
            codex_turn_id: None,
            codex_rollout_path: None,
            codex_last_notification_at: None,
            model: spec.model.clone(),
            effort: spec.effort.clone(),
            sandbox: spec.sandbox.clone(),
            approval_policy: spec.approval_policy.clone(),
            error: None,
        };
        let entry = RunIndexEntry {
            run_id: run_id.clone(),
            created_at,
            cwd: spec.cwd.clone(),
            relative_dir,
        };

        let _guard = self.write_lock.lock().await;
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| StoreError::io(&dir, e))?;
        append_line(&self.index_path(), &entry).await?;
        write_json_atomic(&dir.join("run.json"), &run).await?;
        debug!(run_id = %run_id, dir = %dir.display(), "created run");
        Ok((run, dir))
    }

    /// Latest run record, or `None` for unknown ids. A read that races the
    /// atomic rename is retried once.
    pub async fn try_get(&self, run_id: &str) -> Result<Option<Run>, StoreError> {
        let Some(dir) = self.resolve_run_directory(run_id).await? else {
            return Ok(None);
        };
        let path = dir.join("run.json");
        match read_run(&path).await {
            Ok(run) => Ok(Some(run)),
            Err(_) => {
                tokio::time::sleep(Duration::from_millis(10)).await;
                match read_run(&path).await {
                    Ok(run) => Ok(Some(run)),
                    Err(StoreError::Io { source, .. })
                        if source.kind() == std::io::ErrorKind::NotFound =>
                    {
                        Ok(None)
                    }
                    Err(e) => Err(e),
                }
            }
        }
    }

    /// Replace `run.json` atomically. The index is never rewritten.
    pub async fn update(&self, run: &Run) -> Result<(), StoreError> {
        let dir = self
            .resolve_run_directory(&run.run_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(run.run_id.clone()))?;
        let _guard = self.write_lock.lock().await;
        write_json_atomic(&dir.join("run.json"), run).await
    }

    /// Append one envelope to `events.jsonl`. No-op when raw-event
    /// persistence is disabled.
    pub async fn append_raw_event(
        &self,
        run_id: &str,
        envelope: &RunEventEnvelope,
    ) -> Result<(), StoreError> {
        if !self.persist_raw_events {
            return Ok(());
        }
        let dir = self
            .resolve_run_directory(run_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(run_id.to_string()))?;
        let _guard = self.write_lock.lock().await;
        append_line(&dir.join("events.jsonl"), envelope).await
    }

    /// Append one record to `rollup.jsonl`.
    pub async fn append_rollup_record(
        &self,
        run_id: &str,
        record: &RunRollupRecord,
    ) -> Result<(), StoreError> {
        let dir = self
            .resolve_run_directory(run_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(run_id.to_string()))?;
        let _guard = self.write_lock.lock().await;
        append_line(&dir.join("rollup.jsonl"), record).await
    }

    /// Last `tail` raw envelopes, capped at [`TAIL_CAP`].
    pub async fn read_raw_events(
        &self,
        run_id: &str,
        tail: Option<usize>,
    ) -> Result<Vec<RunEventEnvelope>, StoreError> {
        let Some(dir) = self.resolve_run_directory(run_id).await? else {
            return Ok(Vec::new());
        };
        let cap = tail.unwrap_or(TAIL_CAP).min(TAIL_CAP);
        read_tail(&dir.join("events.jsonl"), cap).await
    }

    /// Streaming reader over `events.jsonl`, or `None` when the log does not exist.
    pub async fn open_raw_events(
        &self,
        run_id: &str,
    ) -> Result<Option<JsonlReader<RunEventEnvelope>>, StoreError> {
        let Some(dir) = self.resolve_run_directory(run_id).await? else {
            return Ok(None);
        };
        JsonlReader::open(&dir.join("events.jsonl")).await
    }

    /// Streaming reader over `rollup.jsonl`, or `None` when it does not exist.
    pub async fn open_rollup(
        &self,
        run_id: &str,
    ) -> Result<Option<JsonlReader<RunRollupRecord>>, StoreError> {
        let Some(dir) = self.resolve_run_directory(run_id).await? else {
            return Ok(None);
        };
        JsonlReader::open(&dir.join("rollup.jsonl")).await
    }

    /// Last `tail` rollup records, capped at [`TAIL_CAP`].
    pub async fn read_rollup(
        &self,
        run_id: &str,
        tail: Option<usize>,
    ) -> Result<Vec<RunRollupRecord>, StoreError> {
        let Some(dir) = self.resolve_run_directory(run_id).await? else {
            return Ok(Vec::new());
        };
        let cap = tail.unwrap_or(TAIL_CAP).min(TAIL_CAP);
        read_tail(&dir.join("rollup.jsonl"), cap).await
    }

    /// All index entries, corrupt lines skipped, duplicates preserved in
    /// append order (resolution is last-wins).
    pub async fn list_index_entries(&self) -> Result<Vec<RunIndexEntry>, StoreError> {
        read_tail(&self.index_path(), usize::MAX).await
    }

    /// Load every run, optionally filtered to one working directory.
    /// Entries whose record has vanished are skipped. Newest first.
    pub async fn list_by_cwd(&self, cwd: Option<&str>) -> Result<Vec<Run>, StoreError> {
        let entries = self.list_index_entries().await?;
        let mut latest: HashMap<String, RunIndexEntry> = HashMap::new();
        for entry in entries {
            latest.insert(entry.run_id.clone(), entry);
        }

        let mut runs = Vec::new();
        for entry in latest.into_values() {
            if let Some(filter) = cwd {
                if !cwd_equal(&entry.cwd, filter) {
                    continue;
                }
            }
            let path = self.dir_from_relative(&entry.relative_dir).join("run.json");
            match read_run(&path).await {
                Ok(run) => runs.push(run),
                Err(e) => debug!(run_id = %entry.run_id, error = %e, "skipping unreadable run record"),
            }
        }
        runs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(runs)
    }

    /// Resolve a run's directory via the index; fall back to a bounded scan
    /// of the dated directories and repair the index when the entry is missing.
    pub async fn resolve_run_directory(&self, run_id: &str) -> Result<Option<PathBuf>, StoreError> {
        let entries = self.list_index_entries().await?;
        if let Some(entry) = entries.iter().rev().find(|e| e.run_id == run_id) {
            let dir = self.dir_from_relative(&entry.relative_dir);
            if fs::metadata(dir.join("run.json")).await.is_ok() {
                return Ok(Some(dir));
            }
        }
        self.scan_and_repair(run_id).await
    }

    async fn scan_and_repair(&self, run_id: &str) -> Result<Option<PathBuf>, StoreError> {
        let runs_dir = self.runs_dir();
        let mut visited = 0usize;
        let mut years = read_dir_sorted(&runs_dir).await;
        years.reverse();
        for year in years {
            let mut months = read_dir_sorted(&year).await;
            months.reverse();
            for month in months {
                let mut days = read_dir_sorted(&month).await;
                days.reverse();
                for day in days {
                    visited += 1;
                    if visited > MAX_DAY_DIR_SCAN {
                        warn!(run_id, "index repair scan hit the day-directory cap");
                        return Ok(None);
                    }
                    let candidate = day.join(run_id);
                    let record = candidate.join("run.json");
                    if fs::metadata(&record).await.is_ok() {
                        if let Ok(run) = read_run(&record).await {
                            let relative_dir = candidate
                                .strip_prefix(&self.state_dir)
                                .map(|p| p.to_string_lossy().replace('\\', "/"))
                                .unwrap_or_default();
                            let entry = RunIndexEntry {
                                run_id: run.run_id.clone(),
                                created_at: run.created_at,
                                cwd: run.cwd.clone(),
                                relative_dir,
                            };
                            let _guard = self.write_lock.lock().await;
                            if let Err(e) = append_line(&self.index_path(), &entry).await {
                                warn!(run_id, error = %e, "failed to repair run index");
                            } else {
                                debug!(run_id, "repaired missing index entry");
                            }
                        }
                        return Ok(Some(candidate));
                    }
                }
            }
        }
        Ok(None)
    }
}

async fn read_run(path: &Path) -> Result<Run, StoreError> {
    let bytes = fs::read(path).await.map_err(|e| StoreError::io(path, e))?;
    Ok(serde_json::from_slice(&bytes)?)
}

async fn write_json_atomic<T: serde::Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    let json = serde_json::to_vec_pretty(value)?;
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let tmp = path.with_file_name(format!("{}.tmp-{}", file_name, nanoid::nanoid!(6)));
    fs::write(&tmp, &json)
        .await
        .map_err(|e| StoreError::io(&tmp, e))?;
    fs::rename(&tmp, path)
        .await
        .map_err(|e| StoreError::io(path, e))?;
    Ok(())
}

async fn read_dir_sorted(path: &Path) -> Vec<PathBuf> {
    let mut out = Vec::new();
    let Ok(mut entries) = fs::read_dir(path).await else {
        return out;
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        if let Ok(file_type) = entry.file_type().await {
            if file_type.is_dir() {
                out.push(entry.path());
            }
        }
    }
    out.sort();
    out
}
