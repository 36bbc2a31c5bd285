// ABOUTME: End-to-end run lifecycle tests against a scripted fake agent client

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use codexd_agent::{
    AgentClient, AgentError, AgentNotification, AgentProvider, ReviewTarget, StartedTurn,
    ThreadHandle, ThreadOptions, TurnOptions, TurnOutcome,
};
use codexd_core::{
    event_type, CreateRunRequest, MonotonicClock, Run, RunStatus, ReviewRequest,
};
use codexd_events::{EventBroadcaster, NotificationBacklog, RollupWriter};
use codexd_runs::{ExecutorConfig, RunError, RunManager};
use codexd_storage::{RunStore, RunStoreOptions};

struct LiveTurn {
    notifications: mpsc::UnboundedSender<AgentNotification>,
    outcome: Option<oneshot::Sender<TurnOutcome>>,
}

#[derive(Default)]
struct FakeState {
    resumed_threads: Vec<String>,
    steered: Vec<(String, String, String)>,
    turns: HashMap<String, LiveTurn>,
}

/// Scripted agent: every turn emits two notifications, then either completes
/// on its own or waits to be interrupted.
#[derive(Default)]
struct FakeAgentClient {
    auto_complete: AtomicBool,
    drop_turn_channels: AtomicBool,
    counter: AtomicU32,
    state: Mutex<FakeState>,
}

impl FakeAgentClient {
    fn new(auto_complete: bool) -> Arc<Self> {
        let client = Self::default();
        client.auto_complete.store(auto_complete, Ordering::SeqCst);
        Arc::new(client)
    }

    fn set_auto_complete(&self, value: bool) {
        self.auto_complete.store(value, Ordering::SeqCst);
    }

    fn resumed_threads(&self) -> Vec<String> {
        self.state.lock().unwrap().resumed_threads.clone()
    }

    fn steered(&self) -> Vec<(String, String, String)> {
        self.state.lock().unwrap().steered.clone()
    }

    fn begin_turn(&self, thread_id: &str) -> Result<StartedTurn, AgentError> {
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        let turn_id = format!("turn-{n}");
        let (ntx, nrx) = mpsc::unbounded_channel();
        let (otx, orx) = oneshot::channel();

        if self.drop_turn_channels.load(Ordering::SeqCst) {
            // Simulated disconnect: both channels close immediately.
            return Ok(StartedTurn {
                turn_id,
                notifications: nrx,
                outcome: orx,
            });
        }

        let _ = ntx.send(AgentNotification {
            method: "turn/started".to_string(),
            params: json!({ "threadId": thread_id, "turnId": turn_id }),
        });
        let _ = ntx.send(AgentNotification {
            method: "item/agentMessage/delta".to_string(),
            params: json!({ "threadId": thread_id, "delta": "hello\n" }),
        });

        if self.auto_complete.load(Ordering::SeqCst) {
            let _ = ntx.send(AgentNotification {
                method: "item/completed".to_string(),
                params: json!({
                    "threadId": thread_id,
                    "item": { "type": "agentMessage", "text": "hello" }
                }),
            });
            let _ = otx.send(TurnOutcome {
                status: Some("completed".to_string()),
                error: None,
            });
        } else {
            self.state.lock().unwrap().turns.insert(
                turn_id.clone(),
                LiveTurn {
                    notifications: ntx,
                    outcome: Some(otx),
                },
            );
        }
        Ok(StartedTurn {
            turn_id,
            notifications: nrx,
            outcome: orx,
        })
    }
}

#[async_trait]
impl AgentClient for FakeAgentClient {
    async fn start_thread(&self, _options: ThreadOptions) -> Result<ThreadHandle, AgentError> {
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        Ok(ThreadHandle {
            thread_id: format!("t-{n}"),
            rollout_path: None,
        })
    }

    async fn resume_thread(&self, thread_id: &str) -> Result<ThreadHandle, AgentError> {
        self.state
            .lock()
            .unwrap()
            .resumed_threads
            .push(thread_id.to_string());
        Ok(ThreadHandle {
            thread_id: thread_id.to_string(),
            rollout_path: None,
        })
    }

    async fn start_turn(
        &self,
        thread_id: &str,
        _options: TurnOptions,
    ) -> Result<StartedTurn, AgentError> {
        self.begin_turn(thread_id)
    }

    async fn start_review(
        &self,
        thread_id: &str,
        _delivery: Option<codexd_core::ReviewDelivery>,
        _target: ReviewTarget,
    ) -> Result<StartedTurn, AgentError> {
        self.begin_turn(thread_id)
    }

    async fn interrupt_turn(&self, _thread_id: &str, turn_id: &str) -> Result<(), AgentError> {
        let mut state = self.state.lock().unwrap();
        if let Some(turn) = state.turns.get_mut(turn_id) {
            if let Some(outcome) = turn.outcome.take() {
                let _ = outcome.send(TurnOutcome {
                    status: Some("interrupted".to_string()),
                    error: None,
                });
            }
        }
        state.turns.remove(turn_id);
        Ok(())
    }

    async fn steer_turn(
        &self,
        thread_id: &str,
        turn_id: &str,
        prompt: &str,
    ) -> Result<(), AgentError> {
        self.state.lock().unwrap().steered.push((
            thread_id.to_string(),
            turn_id.to_string(),
            prompt.to_string(),
        ));
        Ok(())
    }
}

struct FakeAgentProvider {
    client: Arc<FakeAgentClient>,
}

#[async_trait]
impl AgentProvider for FakeAgentProvider {
    async fn client(&self) -> Result<Arc<dyn AgentClient>, AgentError> {
        Ok(Arc::clone(&self.client) as Arc<dyn AgentClient>)
    }
}

struct Harness {
    manager: Arc<RunManager>,
    store: Arc<RunStore>,
    broadcaster: Arc<EventBroadcaster>,
    client: Arc<FakeAgentClient>,
    _state_dir: tempfile::TempDir,
    cwd_dir: tempfile::TempDir,
}

fn harness(client: Arc<FakeAgentClient>) -> Harness {
    let state_dir = tempfile::tempdir().unwrap();
    let cwd_dir = tempfile::tempdir().unwrap();
    let store = Arc::new(RunStore::new(state_dir.path(), RunStoreOptions::default()));
    let clock = Arc::new(MonotonicClock::new());
    let broadcaster = Arc::new(EventBroadcaster::new());
    let backlog = Arc::new(NotificationBacklog::new());
    let rollup = Arc::new(RollupWriter::new(Arc::clone(&store), Arc::clone(&clock)));
    let manager = RunManager::new(
        Arc::clone(&store),
        Arc::clone(&broadcaster),
        backlog,
        rollup,
        Arc::new(FakeAgentProvider {
            client: Arc::clone(&client),
        }),
        clock,
        CancellationToken::new(),
        ExecutorConfig::default(),
    );
    Harness {
        manager,
        store,
        broadcaster,
        client,
        _state_dir: state_dir,
        cwd_dir,
    }
}

impl Harness {
    fn request(&self) -> CreateRunRequest {
        CreateRunRequest {
            cwd: self.cwd_dir.path().to_string_lossy().to_string(),
            prompt: "hello".to_string(),
            ..Default::default()
        }
    }

    async fn wait_for(&self, run_id: &str, predicate: impl Fn(&Run) -> bool) -> Run {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            if let Ok(Some(run)) = self.store.try_get(run_id).await {
                if predicate(&run) {
                    return run;
                }
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting for run {run_id}"
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

#[tokio::test]
async fn exec_run_completes_and_logs_events() {
    let h = harness(FakeAgentClient::new(true));
    let run = h.manager.create_and_start(h.request()).await.unwrap();
    assert_eq!(run.status, RunStatus::Queued);

    let finished = h
        .wait_for(&run.run_id, |r| r.status.is_terminal())
        .await;
    assert_eq!(finished.status, RunStatus::Succeeded);
    assert!(finished.started_at.is_some());
    assert!(finished.completed_at.is_some());
    assert!(finished.codex_thread_id.is_some());
    assert!(finished.codex_turn_id.is_some());

    let events = h.store.read_raw_events(&run.run_id, None).await.unwrap();
    let types: Vec<&str> = events.iter().map(|e| e.event_type.as_str()).collect();
    assert_eq!(types.first(), Some(&event_type::RUN_META));
    assert_eq!(types.last(), Some(&event_type::RUN_COMPLETED));
    assert!(types.contains(&event_type::CODEX_NOTIFICATION));
    // createdAt is non-decreasing along the log
    for window in events.windows(2) {
        assert!(window[0].created_at <= window[1].created_at);
    }
}

#[tokio::test]
async fn stop_converts_interrupt_to_paused_and_resume_requeues() {
    let h = harness(FakeAgentClient::new(false));
    let run = h.manager.create_and_start(h.request()).await.unwrap();
    h.wait_for(&run.run_id, |r| r.codex_turn_id.is_some()).await;

    assert!(h.manager.try_stop(&run.run_id).await);
    let paused = h
        .wait_for(&run.run_id, |r| r.status == RunStatus::Paused)
        .await;
    assert!(paused.completed_at.is_none());
    assert!(paused.error.is_none());

    let events = h.store.read_raw_events(&run.run_id, None).await.unwrap();
    assert_eq!(
        events.last().unwrap().event_type,
        event_type::RUN_PAUSED
    );

    // Resume reuses the codex thread and runs to completion.
    h.client.set_auto_complete(true);
    let resumed = h
        .manager
        .resume(&run.run_id, Some("continue".to_string()), None)
        .await
        .unwrap();
    assert_eq!(resumed.status, RunStatus::Queued);
    assert_eq!(resumed.prompt, "continue");

    let finished = h
        .wait_for(&run.run_id, |r| r.status.is_terminal())
        .await;
    assert_eq!(finished.status, RunStatus::Succeeded);
    assert_eq!(
        h.client.resumed_threads(),
        vec![paused.codex_thread_id.unwrap()]
    );
}

#[tokio::test]
async fn interrupt_lands_terminal_interrupted() {
    let h = harness(FakeAgentClient::new(false));
    let run = h.manager.create_and_start(h.request()).await.unwrap();
    h.wait_for(&run.run_id, |r| r.codex_turn_id.is_some()).await;

    assert!(h.manager.try_interrupt(&run.run_id).await);
    let finished = h
        .wait_for(&run.run_id, |r| r.status.is_terminal())
        .await;
    assert_eq!(finished.status, RunStatus::Interrupted);
    assert!(finished.completed_at.is_some());

    // Interrupt on a finished run reports not-running.
    assert!(!h.manager.try_interrupt(&run.run_id).await);
}

#[tokio::test]
async fn disconnect_mid_run_pauses_with_error() {
    let client = FakeAgentClient::new(false);
    client.drop_turn_channels.store(true, Ordering::SeqCst);
    let h = harness(client);
    let run = h.manager.create_and_start(h.request()).await.unwrap();

    let paused = h
        .wait_for(&run.run_id, |r| r.status == RunStatus::Paused)
        .await;
    assert_eq!(paused.error.as_deref(), Some("codex runtime disconnected"));
    assert!(paused.codex_thread_id.is_some());
}

#[tokio::test]
async fn resume_is_rejected_while_active_or_terminal() {
    let h = harness(FakeAgentClient::new(false));
    let run = h.manager.create_and_start(h.request()).await.unwrap();
    h.wait_for(&run.run_id, |r| r.codex_turn_id.is_some()).await;

    // Still running: not resumable.
    assert!(matches!(
        h.manager.resume(&run.run_id, None, None).await,
        Err(RunError::NotResumable)
    ));

    h.manager.try_interrupt(&run.run_id).await;
    h.wait_for(&run.run_id, |r| r.status.is_terminal()).await;

    // Terminal: not resumable either.
    assert!(matches!(
        h.manager.resume(&run.run_id, None, None).await,
        Err(RunError::NotResumable)
    ));

    assert!(matches!(
        h.manager.resume("run-unknown", None, None).await,
        Err(RunError::NotFound)
    ));
}

#[tokio::test]
async fn steer_requires_codex_ids() {
    let h = harness(FakeAgentClient::new(false));
    let run = h.manager.create_and_start(h.request()).await.unwrap();
    let with_ids = h
        .wait_for(&run.run_id, |r| r.codex_turn_id.is_some())
        .await;

    h.manager.steer(&run.run_id, "look at the tests").await.unwrap();
    let steered = h.client.steered();
    assert_eq!(steered.len(), 1);
    assert_eq!(steered[0].0, with_ids.codex_thread_id.unwrap());
    assert_eq!(steered[0].2, "look at the tests");

    assert!(matches!(
        h.manager.steer("run-unknown", "x").await,
        Err(RunError::NotFound)
    ));
}

#[tokio::test]
async fn pause_all_pauses_active_exec_runs() {
    let h = harness(FakeAgentClient::new(false));
    let run = h.manager.create_and_start(h.request()).await.unwrap();
    h.wait_for(&run.run_id, |r| r.codex_turn_id.is_some()).await;

    let mut subscription = h.broadcaster.subscribe(&run.run_id);
    h.manager.pause_all_in_progress("codex runtime disconnected").await;

    let paused = h
        .wait_for(&run.run_id, |r| r.status == RunStatus::Paused)
        .await;
    assert_eq!(paused.error.as_deref(), Some("codex runtime disconnected"));

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let envelope = tokio::time::timeout_at(deadline, subscription.recv())
            .await
            .expect("paused envelope")
            .expect("stream open");
        if envelope.event_type == event_type::RUN_PAUSED {
            break;
        }
    }
}

#[tokio::test]
async fn fail_all_fails_active_runs() {
    let h = harness(FakeAgentClient::new(false));
    let run = h.manager.create_and_start(h.request()).await.unwrap();
    h.wait_for(&run.run_id, |r| r.codex_turn_id.is_some()).await;

    h.manager.fail_all_in_progress("runner shutting down").await;
    let failed = h
        .wait_for(&run.run_id, |r| r.status.is_terminal())
        .await;
    assert_eq!(failed.status, RunStatus::Failed);
    assert_eq!(failed.error.as_deref(), Some("runner shutting down"));
}

#[tokio::test]
async fn shutdown_pause_then_fail_leaves_paused_runs_paused() {
    let h = harness(FakeAgentClient::new(false));
    let exec_run = h.manager.create_and_start(h.request()).await.unwrap();
    h.wait_for(&exec_run.run_id, |r| r.codex_turn_id.is_some()).await;

    let mut review_request = h.request();
    review_request.kind = Some("review".to_string());
    review_request.prompt = String::new();
    review_request.review = Some(ReviewRequest {
        mode: Some("appserver".to_string()),
        ..Default::default()
    });
    let review_run = h.manager.create_and_start(review_request).await.unwrap();
    h.wait_for(&review_run.run_id, |r| r.codex_turn_id.is_some()).await;

    // The shutdown path: pause what can pause, then fail the rest.
    h.manager.pause_all_in_progress("runner shutting down").await;
    h.manager.fail_all_in_progress("runner shutting down").await;

    // Let both executor tasks observe cancellation and clean up.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while h.manager.is_active(&exec_run.run_id).await
        || h.manager.is_active(&review_run.run_id).await
    {
        assert!(tokio::time::Instant::now() < deadline, "executors never exited");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    // The exec run paused and stayed paused; the fail sweep must not touch it.
    let paused = h.store.try_get(&exec_run.run_id).await.unwrap().unwrap();
    assert_eq!(paused.status, RunStatus::Paused);
    assert_eq!(paused.error.as_deref(), Some("runner shutting down"));
    assert!(paused.completed_at.is_none());
    let events = h.store.read_raw_events(&exec_run.run_id, None).await.unwrap();
    let paused_count = events
        .iter()
        .filter(|e| e.event_type == event_type::RUN_PAUSED)
        .count();
    let completed_count = events
        .iter()
        .filter(|e| e.event_type == event_type::RUN_COMPLETED)
        .count();
    assert_eq!(paused_count, 1);
    assert_eq!(completed_count, 0);

    // The review run cannot pause and was failed instead.
    let failed = h.store.try_get(&review_run.run_id).await.unwrap().unwrap();
    assert_eq!(failed.status, RunStatus::Failed);
    assert_eq!(failed.error.as_deref(), Some("runner shutting down"));
}

#[tokio::test]
async fn orphaned_running_record_is_paused_on_startup() {
    let h = harness(FakeAgentClient::new(true));
    let spec = codexd_core::validate_create_request(&h.request()).unwrap();
    let (run, _) = h.store.create(&spec).await.unwrap();
    let stale = run.with(|r| {
        r.status = RunStatus::Running;
        r.started_at = Some("2024-01-01T00:00:00Z".parse::<DateTime<Utc>>().unwrap());
    });
    h.store.update(&stale).await.unwrap();

    let reconciled = h.manager.reconcile_orphans(Utc::now()).await;
    assert_eq!(reconciled, 1);

    let paused = h.store.try_get(&stale.run_id).await.unwrap().unwrap();
    assert_eq!(paused.status, RunStatus::Paused);
    assert_eq!(
        paused.error.as_deref(),
        Some("orphaned after runner restart (was running during previous server instance)")
    );

    // A second pass leaves it alone.
    assert_eq!(h.manager.reconcile_orphans(Utc::now()).await, 0);
}

#[tokio::test]
async fn terminal_run_is_never_mutated_back() {
    let h = harness(FakeAgentClient::new(true));
    let run = h.manager.create_and_start(h.request()).await.unwrap();
    let finished = h
        .wait_for(&run.run_id, |r| r.status.is_terminal())
        .await;

    // Control operations on a finished run are refused.
    assert!(!h.manager.try_stop(&run.run_id).await);
    assert!(matches!(
        h.manager.resume(&run.run_id, None, None).await,
        Err(RunError::NotResumable)
    ));
    let reloaded = h.store.try_get(&run.run_id).await.unwrap().unwrap();
    assert_eq!(reloaded.status, finished.status);
}

#[tokio::test]
async fn review_appserver_run_completes() {
    let h = harness(FakeAgentClient::new(true));
    let mut request = h.request();
    request.kind = Some("review".to_string());
    request.prompt = "focus on concurrency".to_string();
    request.review = Some(ReviewRequest {
        mode: Some("exec".to_string()),
        uncommitted: Some(true),
        ..Default::default()
    });
    let run = h.manager.create_and_start(request).await.unwrap();
    // Prompt + target promoted the review onto the app-server transport.
    assert_eq!(
        run.review.as_ref().unwrap().mode,
        codexd_core::ReviewMode::Appserver
    );
    assert_eq!(run.sandbox.as_deref(), Some("read-only"));

    let finished = h
        .wait_for(&run.run_id, |r| r.status.is_terminal())
        .await;
    assert_eq!(finished.status, RunStatus::Succeeded);
}
