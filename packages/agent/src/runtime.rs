// ABOUTME: Supervisor for the codex app-server child process
// ABOUTME: Owns the stdio JSON-RPC connection, restarts on exit, exposes a watchable state

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Map, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, oneshot, watch, Mutex, RwLock};
use tracing::{debug, error, info, warn};

use codexd_core::ReviewDelivery;

use crate::client::{
    AgentClient, AgentNotification, AgentProvider, ReviewTarget, StartedTurn, ThreadHandle,
    ThreadOptions, TurnOptions, TurnOutcome,
};
use crate::error::AgentError;
use crate::protocol::{JsonRpcMessage, JsonRpcRequest, ThreadStartResult, TurnStartResult};

/// Lifecycle of the agent runtime, surfaced through `/v1/health`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeState {
    Disabled,
    Starting,
    Ready,
    Restarting,
    Faulted,
    Disposed,
}

impl RuntimeState {
    pub fn as_str(self) -> &'static str {
        match self {
            RuntimeState::Disabled => "disabled",
            RuntimeState::Starting => "starting",
            RuntimeState::Ready => "ready",
            RuntimeState::Restarting => "restarting",
            RuntimeState::Faulted => "faulted",
            RuntimeState::Disposed => "disposed",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CodexRuntimeConfig {
    pub enabled: bool,
    pub binary: String,
    pub args: Vec<String>,
    pub max_restart_attempts: u32,
}

impl Default for CodexRuntimeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            binary: "codex".to_string(),
            args: vec!["app-server".to_string()],
            max_restart_attempts: 5,
        }
    }
}

/// A child considered stable after this uptime resets the restart counter.
const STABLE_UPTIME: Duration = Duration::from_secs(60);

/// One live stdio connection to the app-server.
#[derive(Debug)]
pub(crate) struct Connection {
    stdin: Option<Mutex<ChildStdin>>,
    next_id: AtomicU64,
    pending: StdMutex<HashMap<u64, oneshot::Sender<Result<Value, AgentError>>>>,
    routes: StdMutex<HashMap<String, mpsc::UnboundedSender<AgentNotification>>>,
    turn_waiters: StdMutex<HashMap<String, oneshot::Sender<TurnOutcome>>>,
}

impl Connection {
    pub(crate) fn new(stdin: Option<ChildStdin>) -> Self {
        Self {
            stdin: stdin.map(Mutex::new),
            next_id: AtomicU64::new(1),
            pending: StdMutex::new(HashMap::new()),
            routes: StdMutex::new(HashMap::new()),
            turn_waiters: StdMutex::new(HashMap::new()),
        }
    }

    pub(crate) async fn request(&self, method: &str, params: Value) -> Result<Value, AgentError> {
        let Some(stdin) = &self.stdin else {
            return Err(AgentError::Disconnected);
        };
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        lock(&self.pending).insert(id, tx);

        let mut line = serde_json::to_string(&JsonRpcRequest::new(id, method, params))?;
        line.push('\n');
        {
            let mut stdin = stdin.lock().await;
            if let Err(e) = stdin.write_all(line.as_bytes()).await {
                lock(&self.pending).remove(&id);
                warn!(method, error = %e, "app-server write failed");
                return Err(AgentError::Disconnected);
            }
            if stdin.flush().await.is_err() {
                lock(&self.pending).remove(&id);
                return Err(AgentError::Disconnected);
            }
        }
        rx.await.map_err(|_| AgentError::Disconnected)?
    }

    pub(crate) fn subscribe_thread(
        &self,
        thread_id: &str,
    ) -> mpsc::UnboundedReceiver<AgentNotification> {
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.routes).insert(thread_id.to_string(), tx);
        rx
    }

    pub(crate) fn register_turn_waiter(&self, turn_id: &str) -> oneshot::Receiver<TurnOutcome> {
        let (tx, rx) = oneshot::channel();
        lock(&self.turn_waiters).insert(turn_id.to_string(), tx);
        rx
    }

    /// Dispatch one inbound stdout line.
    pub(crate) fn handle_line(&self, line: &str) {
        let message: JsonRpcMessage = match serde_json::from_str(line) {
            Ok(message) => message,
            Err(e) => {
                debug!(error = %e, "ignoring unparseable app-server line");
                return;
            }
        };

        if let Some(id) = message.id {
            if let Some(tx) = lock(&self.pending).remove(&id) {
                let result = match message.error {
                    Some(err) => Err(AgentError::Rpc(err.message)),
                    None => Ok(message.result.unwrap_or(Value::Null)),
                };
                let _ = tx.send(result);
            }
            return;
        }

        let Some(method) = message.method else {
            return;
        };
        let params = message.params.unwrap_or(Value::Null);

        if let Some(turn_id) = params.get("turnId").and_then(Value::as_str) {
            let outcome = match method.as_str() {
                "turn/completed" => Some(TurnOutcome {
                    status: params
                        .get("status")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                    error: None,
                }),
                "turn/failed" => Some(TurnOutcome {
                    status: Some("failed".to_string()),
                    error: params
                        .get("error")
                        .map(|e| match e.as_str() {
                            Some(s) => s.to_string(),
                            None => e
                                .get("message")
                                .and_then(Value::as_str)
                                .unwrap_or("turn failed")
                                .to_string(),
                        }),
                }),
                _ => None,
            };
            if let Some(outcome) = outcome {
                if let Some(tx) = lock(&self.turn_waiters).remove(turn_id) {
                    let _ = tx.send(outcome);
                }
            }
        }

        if let Some(thread_id) = params.get("threadId").and_then(Value::as_str) {
            let mut routes = lock(&self.routes);
            if let Some(tx) = routes.get(thread_id) {
                if tx
                    .send(AgentNotification {
                        method,
                        params: params.clone(),
                    })
                    .is_err()
                {
                    routes.remove(thread_id);
                }
            }
        }
    }

    /// Abort everything in flight: pending requests fail, notification and
    /// outcome channels close.
    pub(crate) fn teardown(&self) {
        for (_, tx) in lock(&self.pending).drain() {
            let _ = tx.send(Err(AgentError::Disconnected));
        }
        lock(&self.routes).clear();
        lock(&self.turn_waiters).clear();
    }
}

fn lock<T>(mutex: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug)]
struct RuntimeShared {
    state_tx: watch::Sender<RuntimeState>,
    connection: RwLock<Option<Arc<Connection>>>,
}

impl RuntimeShared {
    fn set_state(&self, state: RuntimeState) {
        // send_replace stores the state even when nobody is watching yet.
        self.state_tx.send_replace(state);
    }
}

/// The daemon's handle on the codex app-server lifecycle.
pub struct CodexRuntime {
    shared: Arc<RuntimeShared>,
    dispose_tx: watch::Sender<bool>,
}

impl CodexRuntime {
    /// Build the runtime and, when enabled, spawn the supervision task.
    pub fn start(config: CodexRuntimeConfig) -> Arc<Self> {
        let initial = if config.enabled {
            RuntimeState::Starting
        } else {
            RuntimeState::Disabled
        };
        let (state_tx, _) = watch::channel(initial);
        let (dispose_tx, dispose_rx) = watch::channel(false);
        let shared = Arc::new(RuntimeShared {
            state_tx,
            connection: RwLock::new(None),
        });
        let runtime = Arc::new(Self {
            shared: Arc::clone(&shared),
            dispose_tx,
        });
        if config.enabled {
            tokio::spawn(supervise(config, shared, dispose_rx));
        }
        runtime
    }

    pub fn state(&self) -> RuntimeState {
        *self.shared.state_tx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<RuntimeState> {
        self.shared.state_tx.subscribe()
    }

    /// Stop the child and refuse further clients.
    pub fn dispose(&self) {
        self.dispose_tx.send_replace(true);
    }

    /// Wait out an in-flight (re)start and hand back a client bound to the
    /// live connection.
    pub async fn app_server_client(&self) -> Result<Arc<AppServerClient>, AgentError> {
        let mut state_rx = self.shared.state_tx.subscribe();
        loop {
            let state = *state_rx.borrow_and_update();
            match state {
                RuntimeState::Ready => {
                    return Ok(Arc::new(AppServerClient {
                        shared: Arc::clone(&self.shared),
                    }));
                }
                RuntimeState::Disabled => return Err(AgentError::Disabled),
                RuntimeState::Faulted => {
                    return Err(AgentError::Unavailable("runtime faulted".to_string()))
                }
                RuntimeState::Disposed => {
                    return Err(AgentError::Unavailable("runtime disposed".to_string()))
                }
                RuntimeState::Starting | RuntimeState::Restarting => {
                    if state_rx.changed().await.is_err() {
                        return Err(AgentError::Disconnected);
                    }
                }
            }
        }
    }
}

#[async_trait]
impl AgentProvider for CodexRuntime {
    async fn client(&self) -> Result<Arc<dyn AgentClient>, AgentError> {
        let client = self.app_server_client().await?;
        Ok(client as Arc<dyn AgentClient>)
    }
}

async fn supervise(
    config: CodexRuntimeConfig,
    shared: Arc<RuntimeShared>,
    mut dispose_rx: watch::Receiver<bool>,
) {
    let mut attempts = 0u32;
    loop {
        if *dispose_rx.borrow() {
            shared.set_state(RuntimeState::Disposed);
            return;
        }
        match spawn_app_server(&config) {
            Err(e) => {
                error!(error = %e, "failed to spawn codex app-server");
            }
            Ok((mut child, connection)) => {
                let started = Instant::now();
                *shared.connection.write().await = Some(Arc::clone(&connection));
                shared.set_state(RuntimeState::Ready);
                info!(binary = %config.binary, "codex app-server ready");

                tokio::select! {
                    status = child.wait() => {
                        warn!(?status, "codex app-server exited");
                    }
                    _ = dispose_rx.changed() => {
                        let _ = child.start_kill();
                        let _ = child.wait().await;
                        connection.teardown();
                        *shared.connection.write().await = None;
                        shared.set_state(RuntimeState::Disposed);
                        return;
                    }
                }
                connection.teardown();
                *shared.connection.write().await = None;
                if started.elapsed() >= STABLE_UPTIME {
                    attempts = 0;
                }
            }
        }

        attempts += 1;
        if attempts > config.max_restart_attempts {
            shared.set_state(RuntimeState::Faulted);
            error!("codex app-server restart budget exhausted");
            return;
        }
        shared.set_state(RuntimeState::Restarting);
        tokio::time::sleep(Duration::from_millis(200 * u64::from(attempts))).await;
    }
}

fn spawn_app_server(
    config: &CodexRuntimeConfig,
) -> Result<(Child, Arc<Connection>), AgentError> {
    let mut child = Command::new(&config.binary)
        .args(&config.args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| AgentError::Spawn(e.to_string()))?;

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| AgentError::Spawn("failed to capture stdin".to_string()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| AgentError::Spawn("failed to capture stdout".to_string()))?;

    let connection = Arc::new(Connection::new(Some(stdin)));
    let reader_connection = Arc::clone(&connection);
    tokio::spawn(async move {
        let mut lines = BufReader::new(stdout).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            reader_connection.handle_line(&line);
        }
        debug!("app-server stdout closed");
    });

    Ok((child, connection))
}

/// [`AgentClient`] over the live app-server connection.
#[derive(Debug)]
pub struct AppServerClient {
    shared: Arc<RuntimeShared>,
}

impl AppServerClient {
    async fn connection(&self) -> Result<Arc<Connection>, AgentError> {
        self.shared
            .connection
            .read()
            .await
            .clone()
            .ok_or(AgentError::Disconnected)
    }
}

fn optional(params: &mut Map<String, Value>, key: &str, value: &Option<String>) {
    if let Some(value) = value {
        params.insert(key.to_string(), Value::String(value.clone()));
    }
}

#[async_trait]
impl AgentClient for AppServerClient {
    async fn start_thread(&self, options: ThreadOptions) -> Result<ThreadHandle, AgentError> {
        let connection = self.connection().await?;
        let mut params = Map::new();
        optional(&mut params, "cwd", &options.cwd);
        optional(
            &mut params,
            "developerInstructions",
            &options.developer_instructions,
        );
        let result = connection
            .request("thread/start", Value::Object(params))
            .await?;
        let result: ThreadStartResult = serde_json::from_value(result)?;
        Ok(ThreadHandle {
            thread_id: result.thread_id,
            rollout_path: result.rollout_path,
        })
    }

    async fn resume_thread(&self, thread_id: &str) -> Result<ThreadHandle, AgentError> {
        let connection = self.connection().await?;
        let result = connection
            .request("thread/resume", json!({ "threadId": thread_id }))
            .await?;
        let result: ThreadStartResult = serde_json::from_value(result)?;
        Ok(ThreadHandle {
            thread_id: result.thread_id,
            rollout_path: result.rollout_path,
        })
    }

    async fn start_turn(
        &self,
        thread_id: &str,
        options: TurnOptions,
    ) -> Result<StartedTurn, AgentError> {
        let connection = self.connection().await?;
        let notifications = connection.subscribe_thread(thread_id);
        let mut params = Map::new();
        params.insert("threadId".to_string(), Value::String(thread_id.to_string()));
        params.insert("input".to_string(), Value::String(options.prompt.clone()));
        params.insert("cwd".to_string(), Value::String(options.cwd.clone()));
        optional(&mut params, "model", &options.model);
        optional(&mut params, "effort", &options.effort);
        optional(&mut params, "sandbox", &options.sandbox);
        optional(&mut params, "approvalPolicy", &options.approval_policy);
        let result = connection
            .request("turn/start", Value::Object(params))
            .await?;
        let result: TurnStartResult = serde_json::from_value(result)?;
        let outcome = connection.register_turn_waiter(&result.turn_id);
        Ok(StartedTurn {
            turn_id: result.turn_id,
            notifications,
            outcome,
        })
    }

    async fn start_review(
        &self,
        thread_id: &str,
        delivery: Option<ReviewDelivery>,
        target: ReviewTarget,
    ) -> Result<StartedTurn, AgentError> {
        let connection = self.connection().await?;
        let notifications = connection.subscribe_thread(thread_id);
        let target = match target {
            ReviewTarget::Uncommitted => json!({ "type": "uncommitted" }),
            ReviewTarget::BaseBranch(branch) => json!({ "type": "baseBranch", "branch": branch }),
            ReviewTarget::Commit { sha, title } => {
                json!({ "type": "commit", "sha": sha, "title": title })
            }
        };
        let mut params = Map::new();
        params.insert("threadId".to_string(), Value::String(thread_id.to_string()));
        params.insert("target".to_string(), target);
        if let Some(delivery) = delivery {
            params.insert(
                "delivery".to_string(),
                serde_json::to_value(delivery)?,
            );
        }
        let result = connection
            .request("review/start", Value::Object(params))
            .await?;
        let result: TurnStartResult = serde_json::from_value(result)?;
        let outcome = connection.register_turn_waiter(&result.turn_id);
        Ok(StartedTurn {
            turn_id: result.turn_id,
            notifications,
            outcome,
        })
    }

    async fn interrupt_turn(&self, thread_id: &str, turn_id: &str) -> Result<(), AgentError> {
        let connection = self.connection().await?;
        connection
            .request(
                "turn/interrupt",
                json!({ "threadId": thread_id, "turnId": turn_id }),
            )
            .await?;
        Ok(())
    }

    async fn steer_turn(
        &self,
        thread_id: &str,
        turn_id: &str,
        prompt: &str,
    ) -> Result<(), AgentError> {
        let connection = self.connection().await?;
        connection
            .request(
                "turn/steer",
                json!({
                    "threadId": thread_id,
                    "expectedTurnId": turn_id,
                    "input": prompt,
                }),
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn notifications_route_by_thread_id() {
        let connection = Connection::new(None);
        let mut rx = connection.subscribe_thread("t-1");
        connection.handle_line(
            "{\"jsonrpc\":\"2.0\",\"method\":\"item/agentMessage/delta\",\"params\":{\"threadId\":\"t-1\",\"delta\":\"hi\"}}",
        );
        connection.handle_line(
            "{\"jsonrpc\":\"2.0\",\"method\":\"item/agentMessage/delta\",\"params\":{\"threadId\":\"t-other\",\"delta\":\"no\"}}",
        );
        let notification = rx.recv().await.unwrap();
        assert_eq!(notification.method, "item/agentMessage/delta");
        assert_eq!(notification.params["delta"], "hi");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn turn_completed_resolves_the_waiter() {
        let connection = Connection::new(None);
        let waiter = connection.register_turn_waiter("turn-1");
        connection.handle_line(
            "{\"jsonrpc\":\"2.0\",\"method\":\"turn/completed\",\"params\":{\"threadId\":\"t-1\",\"turnId\":\"turn-1\",\"status\":\"completed\"}}",
        );
        let outcome = waiter.await.unwrap();
        assert_eq!(outcome.status.as_deref(), Some("completed"));
        assert!(outcome.error.is_none());
    }

    #[tokio::test]
    async fn turn_failed_carries_the_error() {
        let connection = Connection::new(None);
        let waiter = connection.register_turn_waiter("turn-1");
        connection.handle_line(
            "{\"jsonrpc\":\"2.0\",\"method\":\"turn/failed\",\"params\":{\"threadId\":\"t-1\",\"turnId\":\"turn-1\",\"error\":{\"message\":\"model overloaded\"}}}",
        );
        let outcome = waiter.await.unwrap();
        assert_eq!(outcome.status.as_deref(), Some("failed"));
        assert_eq!(outcome.error.as_deref(), Some("model overloaded"));
    }

    #[tokio::test]
    async fn teardown_fails_pending_and_closes_streams() {
        let connection = Arc::new(Connection::new(None));
        let mut rx = connection.subscribe_thread("t-1");
        let waiter = connection.register_turn_waiter("turn-1");
        connection.teardown();
        assert!(rx.recv().await.is_none());
        assert!(waiter.await.is_err());
    }

    #[tokio::test]
    async fn request_without_stdin_is_disconnected() {
        let connection = Connection::new(None);
        let err = connection.request("thread/start", json!({})).await.unwrap_err();
        assert!(err.is_disconnect());
    }

    #[tokio::test]
    async fn disabled_runtime_refuses_clients() {
        let runtime = CodexRuntime::start(CodexRuntimeConfig {
            enabled: false,
            ..Default::default()
        });
        assert_eq!(runtime.state(), RuntimeState::Disabled);
        let err = runtime.app_server_client().await.unwrap_err();
        assert!(matches!(err, AgentError::Disabled));
    }

    #[tokio::test]
    async fn unspawnable_binary_faults_the_runtime() {
        let runtime = CodexRuntime::start(CodexRuntimeConfig {
            enabled: true,
            binary: "codexd-no-such-binary".to_string(),
            args: vec![],
            max_restart_attempts: 0,
        });
        let mut state_rx = runtime.subscribe_state();
        tokio::time::timeout(Duration::from_secs(5), async {
            while *state_rx.borrow_and_update() != RuntimeState::Faulted {
                state_rx.changed().await.unwrap();
            }
        })
        .await
        .expect("runtime should fault");
        assert!(runtime.app_server_client().await.is_err());
    }
}
