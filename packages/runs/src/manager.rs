// ABOUTME: The run manager: active-run table, state machine, and event-flow discipline
// ABOUTME: Owns every run transition from creation to terminal state or pause

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use codexd_agent::{AgentNotification, AgentProvider};
use codexd_core::{
    event_type, validate_create_request, CreateRunRequest, MonotonicClock, Run, RunEventEnvelope,
    RunKind, RunStatus, ValidationError,
};
use codexd_events::{EventBroadcaster, NotificationBacklog, RollupWriter};
use codexd_storage::{RunStore, StoreError};

use crate::executor::{
    execute_run, ExecutionOutcome, ExecutorConfig, ExecutorError, RunHooks, RunInterrupt,
};

/// Error message used when a previous daemon instance left a run `running`.
const ORPHANED_ERROR: &str =
    "orphaned after runner restart (was running during previous server instance)";

/// Error message for an agent connection lost mid-run.
const DISCONNECTED_ERROR: &str = "codex runtime disconnected";

/// Grace period in seconds before a `running` record predating this server
/// counts as orphaned.
const ORPHAN_GRACE_SECS: i64 = 5;

#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("run not found")]
    NotFound,

    #[error("run is not resumable")]
    NotResumable,

    #[error("run has no codex thread/turn to steer")]
    MissingCodexIds,

    #[error("steer failed: {0}")]
    Steer(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Book-keeping for a run whose executor task is alive.
struct ActiveRun {
    /// Outer cancellation, linked to daemon shutdown and bulk transitions.
    cancel: CancellationToken,
    /// Child of `cancel`; tripped additionally by interrupt/stop.
    interrupt_cancel: CancellationToken,
    interrupt: Mutex<Option<Arc<dyn RunInterrupt>>>,
    stop_requested: AtomicBool,
}

impl ActiveRun {
    fn new(outer: CancellationToken) -> Self {
        let interrupt_cancel = outer.child_token();
        Self {
            cancel: outer,
            interrupt_cancel,
            interrupt: Mutex::new(None),
            stop_requested: AtomicBool::new(false),
        }
    }
}

pub struct RunManager {
    store: Arc<RunStore>,
    broadcaster: Arc<EventBroadcaster>,
    backlog: Arc<NotificationBacklog>,
    rollup: Arc<RollupWriter>,
    agent: Arc<dyn AgentProvider>,
    clock: Arc<MonotonicClock>,
    shutdown: CancellationToken,
    executor_config: ExecutorConfig,
    active: RwLock<HashMap<String, Arc<ActiveRun>>>,
}

impl RunManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<RunStore>,
        broadcaster: Arc<EventBroadcaster>,
        backlog: Arc<NotificationBacklog>,
        rollup: Arc<RollupWriter>,
        agent: Arc<dyn AgentProvider>,
        clock: Arc<MonotonicClock>,
        shutdown: CancellationToken,
        executor_config: ExecutorConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            broadcaster,
            backlog,
            rollup,
            agent,
            clock,
            shutdown,
            executor_config,
            active: RwLock::new(HashMap::new()),
        })
    }

    pub fn store(&self) -> &Arc<RunStore> {
        &self.store
    }

    pub async fn is_active(&self, run_id: &str) -> bool {
        self.active.read().await.contains_key(run_id)
    }

    /// Validate, persist, announce, and launch a new run.
    pub async fn create_and_start(
        self: &Arc<Self>,
        request: CreateRunRequest,
    ) -> Result<Run, RunError> {
        let spec = validate_create_request(&request)?;
        if tokio::fs::metadata(&spec.cwd).await.is_err() {
            return Err(RunError::Validation(ValidationError::CwdNotFound(spec.cwd)));
        }

        let (run, _dir) = self.store.create(&spec).await?;
        info!(run_id = %run.run_id, kind = ?run.kind, cwd = %run.cwd, "created run");
        self.append_and_publish(&run.run_id, event_type::RUN_META, run_to_value(&run))
            .await;
        self.spawn_executor(run.clone()).await;
        Ok(run)
    }

    /// Resume a paused exec run with a fresh executor task on the same thread.
    pub async fn resume(
        self: &Arc<Self>,
        run_id: &str,
        prompt: Option<String>,
        effort: Option<String>,
    ) -> Result<Run, RunError> {
        let run = self
            .store
            .try_get(run_id)
            .await?
            .ok_or(RunError::NotFound)?;
        if run.kind != RunKind::Exec
            || run.status.is_terminal()
            || self.is_active(run_id).await
        {
            return Err(RunError::NotResumable);
        }

        let run = run.with(|r| {
            r.status = RunStatus::Queued;
            r.error = None;
            r.completed_at = None;
            if let Some(prompt) = prompt.as_deref().map(str::trim).filter(|p| !p.is_empty()) {
                r.prompt = prompt.to_string();
            }
            if let Some(effort) = effort.clone() {
                r.effort = Some(effort);
            }
        });
        self.store.update(&run).await?;
        info!(run_id, "resuming run");
        self.append_and_publish(run_id, event_type::RUN_META, run_to_value(&run))
            .await;
        self.spawn_executor(run.clone()).await;
        Ok(run)
    }

    /// Trip the interrupt cancellation and the registered hook, if any.
    /// Returns whether the run was active.
    pub async fn try_interrupt(&self, run_id: &str) -> bool {
        let Some(active) = self.active.read().await.get(run_id).cloned() else {
            return false;
        };
        active.interrupt_cancel.cancel();
        let hook = active.interrupt.lock().await.clone();
        if let Some(hook) = hook {
            if let Err(e) = hook.interrupt().await {
                warn!(run_id, error = %e, "interrupt hook failed");
            }
        }
        true
    }

    /// Like interrupt, but the resulting `interrupted` outcome lands as
    /// `paused` for exec runs: the user pressed stop, nothing went wrong.
    pub async fn try_stop(&self, run_id: &str) -> bool {
        let Some(active) = self.active.read().await.get(run_id).cloned() else {
            return false;
        };
        active.stop_requested.store(true, Ordering::SeqCst);
        active.interrupt_cancel.cancel();
        let hook = active.interrupt.lock().await.clone();
        if let Some(hook) = hook {
            if let Err(e) = hook.interrupt().await {
                warn!(run_id, error = %e, "interrupt hook failed during stop");
            }
        }
        true
    }

    /// Forward steering input into the run's current turn.
    pub async fn steer(&self, run_id: &str, prompt: &str) -> Result<(), RunError> {
        let run = self
            .store
            .try_get(run_id)
            .await?
            .ok_or(RunError::NotFound)?;
        let (Some(thread_id), Some(turn_id)) = (&run.codex_thread_id, &run.codex_turn_id) else {
            return Err(RunError::MissingCodexIds);
        };
        let client = self
            .agent
            .client()
            .await
            .map_err(|e| RunError::Steer(e.to_string()))?;
        client
            .steer_turn(thread_id, turn_id, prompt)
            .await
            .map_err(|e| RunError::Steer(e.to_string()))
    }

    /// Bulk-pause every in-progress exec run; non-exec runs fail instead.
    /// Used when the agent runtime restarts or the daemon shuts down.
    pub async fn pause_all_in_progress(&self, reason: &str) {
        let entries: Vec<(String, Arc<ActiveRun>)> = self
            .active
            .read()
            .await
            .iter()
            .map(|(id, active)| (id.clone(), Arc::clone(active)))
            .collect();
        for (run_id, active) in entries {
            let Ok(Some(run)) = self.store.try_get(&run_id).await else {
                continue;
            };
            if run.status.is_terminal() || run.status == RunStatus::Paused {
                continue;
            }
            if run.kind == RunKind::Exec {
                let updated = run.with(|r| {
                    r.status = RunStatus::Paused;
                    r.set_error(reason);
                });
                if let Err(e) = self.store.update(&updated).await {
                    error!(run_id = %run_id, error = %e, "failed to persist bulk pause");
                    continue;
                }
                self.append_and_publish(&run_id, event_type::RUN_PAUSED, run_to_value(&updated))
                    .await;
            } else {
                self.finalize_failed(&run, reason).await;
            }
            active.cancel.cancel();
        }
    }

    /// Bulk-fail every in-progress run. Runs already `paused` (by stop, a
    /// disconnect, or a preceding bulk pause) stay paused and resumable.
    pub async fn fail_all_in_progress(&self, reason: &str) {
        let entries: Vec<(String, Arc<ActiveRun>)> = self
            .active
            .read()
            .await
            .iter()
            .map(|(id, active)| (id.clone(), Arc::clone(active)))
            .collect();
        for (run_id, active) in entries {
            let Ok(Some(run)) = self.store.try_get(&run_id).await else {
                continue;
            };
            if !run.status.is_terminal() && run.status != RunStatus::Paused {
                self.finalize_failed(&run, reason).await;
            }
            active.cancel.cancel();
        }
    }

    /// Startup reconciliation: a `running` record from before this server
    /// instance, with no active executor, goes to `paused`.
    pub async fn reconcile_orphans(&self, server_started_at: DateTime<Utc>) -> usize {
        let entries = match self.store.list_index_entries().await {
            Ok(entries) => entries,
            Err(e) => {
                error!(error = %e, "orphan reconciliation could not read the index");
                return 0;
            }
        };
        let mut seen: HashSet<String> = HashSet::new();
        let cutoff = server_started_at - chrono::Duration::seconds(ORPHAN_GRACE_SECS);
        let mut reconciled = 0usize;
        for entry in entries.into_iter().rev() {
            if !seen.insert(entry.run_id.clone()) {
                continue;
            }
            let Ok(Some(run)) = self.store.try_get(&entry.run_id).await else {
                continue;
            };
            if run.status != RunStatus::Running || self.is_active(&run.run_id).await {
                continue;
            }
            if run.started_at.unwrap_or(run.created_at) >= cutoff {
                continue;
            }
            let updated = run.with(|r| {
                r.status = RunStatus::Paused;
                r.set_error(ORPHANED_ERROR);
            });
            match self.store.update(&updated).await {
                Ok(()) => {
                    warn!(run_id = %updated.run_id, "paused orphaned run from previous instance");
                    self.append_and_publish(
                        &updated.run_id,
                        event_type::RUN_PAUSED,
                        run_to_value(&updated),
                    )
                    .await;
                    reconciled += 1;
                }
                Err(e) => error!(run_id = %updated.run_id, error = %e, "failed to pause orphan"),
            }
        }
        reconciled
    }

    /// Event-flow discipline: broadcast first, then the raw log, then the
    /// backlog, then the rollup writer. Terminal envelopes also flush and
    /// stop the run's rollup accumulator.
    pub async fn append_and_publish(&self, run_id: &str, event_type: &str, data: Value) {
        let envelope = RunEventEnvelope::new(event_type, self.clock.now(), data);
        self.broadcaster.publish(run_id, &envelope);
        if self.store.raw_events_enabled() {
            if let Err(e) = self.store.append_raw_event(run_id, &envelope).await {
                warn!(run_id, error = %e, "raw event append failed");
            }
        }
        if envelope.event_type == codexd_core::event_type::CODEX_NOTIFICATION {
            self.backlog.add(run_id, envelope.clone()).await;
        }
        self.rollup.handle_envelope(run_id, &envelope).await;
        if envelope.ends_stream() {
            self.rollup.finish(run_id).await;
        }
    }

    async fn spawn_executor(self: &Arc<Self>, run: Run) {
        let active = Arc::new(ActiveRun::new(self.shutdown.child_token()));
        self.active
            .write()
            .await
            .insert(run.run_id.clone(), Arc::clone(&active));
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            manager.run_to_completion(run, active).await;
        });
    }

    async fn run_to_completion(self: Arc<Self>, run: Run, active: Arc<ActiveRun>) {
        let run_id = run.run_id.clone();
        let run = run.with(|r| {
            r.status = RunStatus::Running;
            if r.started_at.is_none() {
                r.started_at = Some(Utc::now());
            }
        });
        match self.store.update(&run).await {
            Ok(()) => {
                self.append_and_publish(&run_id, event_type::RUN_META, run_to_value(&run))
                    .await;
                let hooks = ManagerHooks {
                    manager: Arc::clone(&self),
                    run_id: run_id.clone(),
                    active: Arc::clone(&active),
                };
                let result = execute_run(
                    &run,
                    self.agent.as_ref(),
                    &hooks,
                    &active.interrupt_cancel,
                    &self.executor_config,
                )
                .await;
                self.complete_run(&run_id, &active, result).await;
            }
            Err(e) => {
                error!(run_id = %run_id, error = %e, "failed to mark run running");
                self.complete_run(
                    &run_id,
                    &active,
                    Err(ExecutorError::Failed(e.to_string())),
                )
                .await;
            }
        }
        self.active.write().await.remove(&run_id);
    }

    async fn complete_run(
        &self,
        run_id: &str,
        active: &ActiveRun,
        result: Result<ExecutionOutcome, ExecutorError>,
    ) {
        let current = match self.store.try_get(run_id).await {
            Ok(Some(run)) => run,
            Ok(None) => {
                warn!(run_id, "run record vanished before completion");
                return;
            }
            Err(e) => {
                error!(run_id, error = %e, "failed to reload run for completion");
                return;
            }
        };
        // Bulk pause/fail already transitioned and published; terminal is final.
        if current.status.is_terminal() || current.status == RunStatus::Paused {
            debug!(run_id, status = ?current.status, "run already finalized");
            return;
        }

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(ExecutorError::Agent(e)) if e.is_disconnect() => {
                if current.kind == RunKind::Exec && current.codex_thread_id.is_some() {
                    ExecutionOutcome {
                        status: RunStatus::Paused,
                        error: Some(DISCONNECTED_ERROR.to_string()),
                    }
                } else {
                    ExecutionOutcome {
                        status: RunStatus::Failed,
                        error: Some(DISCONNECTED_ERROR.to_string()),
                    }
                }
            }
            Err(e) => ExecutionOutcome {
                status: RunStatus::Failed,
                error: Some(e.to_string()),
            },
        };

        let mut status = outcome.status;
        if status == RunStatus::Interrupted
            && current.kind == RunKind::Exec
            && active.stop_requested.load(Ordering::SeqCst)
        {
            status = RunStatus::Paused;
        }

        let last_notification = self.backlog.last_notification_at(run_id).await;
        let updated = current.with(|r| {
            r.status = status;
            if let Some(at) = last_notification {
                r.codex_last_notification_at = Some(at);
            }
            if let Some(error) = &outcome.error {
                r.set_error(error);
            }
            if status.is_terminal() {
                r.completed_at = Some(Utc::now());
            }
        });

        // The persisted record is authoritative; write it before announcing.
        if let Err(e) = self.store.update(&updated).await {
            error!(run_id, error = %e, "failed to persist final run state");
        }
        let event = if status == RunStatus::Paused {
            event_type::RUN_PAUSED
        } else {
            event_type::RUN_COMPLETED
        };
        info!(run_id, status = status.as_str(), "run finished");
        self.append_and_publish(run_id, event, run_to_value(&updated))
            .await;
        if status.is_terminal() {
            self.backlog.remove_run(run_id).await;
        }
    }

    async fn finalize_failed(&self, run: &Run, reason: &str) {
        let updated = run.clone().with(|r| {
            r.status = RunStatus::Failed;
            r.completed_at = Some(Utc::now());
            r.set_error(reason);
        });
        if let Err(e) = self.store.update(&updated).await {
            error!(run_id = %updated.run_id, error = %e, "failed to persist bulk failure");
            return;
        }
        self.append_and_publish(
            &updated.run_id,
            event_type::RUN_COMPLETED,
            run_to_value(&updated),
        )
        .await;
        self.backlog.remove_run(&updated.run_id).await;
    }
}

fn run_to_value(run: &Run) -> Value {
    serde_json::to_value(run).unwrap_or_default()
}

struct ManagerHooks {
    manager: Arc<RunManager>,
    run_id: String,
    active: Arc<ActiveRun>,
}

#[async_trait]
impl RunHooks for ManagerHooks {
    async fn publish_notification(&self, notification: AgentNotification) {
        let data = json!({
            "method": notification.method,
            "params": notification.params,
        });
        self.manager
            .append_and_publish(&self.run_id, event_type::CODEX_NOTIFICATION, data)
            .await;
    }

    async fn set_codex_ids(
        &self,
        thread_id: Option<&str>,
        turn_id: Option<&str>,
        rollout_path: Option<&str>,
    ) {
        if thread_id.is_none() && turn_id.is_none() && rollout_path.is_none() {
            return;
        }
        match self.manager.store.try_get(&self.run_id).await {
            Ok(Some(run)) => {
                let updated = run.with(|r| {
                    if let Some(thread_id) = thread_id {
                        r.codex_thread_id = Some(thread_id.to_string());
                    }
                    if let Some(turn_id) = turn_id {
                        r.codex_turn_id = Some(turn_id.to_string());
                    }
                    if let Some(rollout_path) = rollout_path {
                        r.codex_rollout_path = Some(rollout_path.to_string());
                    }
                });
                if let Err(e) = self.manager.store.update(&updated).await {
                    warn!(run_id = %self.run_id, error = %e, "failed to persist codex ids");
                }
            }
            other => {
                warn!(run_id = %self.run_id, ?other, "run missing while recording codex ids");
            }
        }
        if let Some(rollout_path) = rollout_path {
            self.manager
                .backlog
                .set_rollout_path(&self.run_id, rollout_path)
                .await;
        }
    }

    async fn set_interrupt(&self, interrupt: Arc<dyn RunInterrupt>) {
        *self.active.interrupt.lock().await = Some(interrupt);
    }
}
