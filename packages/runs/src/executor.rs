// ABOUTME: Executor strategies: drive one run against the agent until it finishes
// ABOUTME: Exec runs use app-server threads/turns; review runs dispatch on their sub-mode

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use codexd_agent::{
    AgentClient, AgentError, AgentNotification, AgentProvider, StartedTurn, ThreadOptions,
    TurnOptions, TurnOutcome,
};
use codexd_core::{Run, RunKind, RunStatus};

use crate::review::run_review;

/// Knobs the executor needs beyond the run record itself.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Binary used for review subprocesses.
    pub codex_binary: String,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            codex_binary: "codex".to_string(),
        }
    }
}

/// How an executor finished: a proposed status plus an optional error message.
/// The manager applies stop/disconnect adjustments before persisting.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionOutcome {
    pub status: RunStatus,
    pub error: Option<String>,
}

impl ExecutionOutcome {
    pub fn new(status: RunStatus) -> Self {
        Self {
            status,
            error: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error(transparent)]
    Agent(#[from] AgentError),

    #[error("{0}")]
    Failed(String),
}

/// Best-effort interrupt hook registered by the executor once it knows how to
/// stop its work. Idempotent; repeated calls are safe.
#[async_trait]
pub trait RunInterrupt: Send + Sync {
    async fn interrupt(&self) -> Result<(), AgentError>;
}

/// Callbacks the manager lends to the executor. The executor never touches
/// the store or broadcaster directly.
#[async_trait]
pub trait RunHooks: Send + Sync {
    /// Publish one agent notification as a `codex.notification` envelope.
    async fn publish_notification(&self, notification: AgentNotification);

    /// Record agent correlation ids on the run. `None` leaves a field as is.
    async fn set_codex_ids(
        &self,
        thread_id: Option<&str>,
        turn_id: Option<&str>,
        rollout_path: Option<&str>,
    );

    /// Register the interrupt hook for control operations.
    async fn set_interrupt(&self, interrupt: Arc<dyn RunInterrupt>);
}

/// Dispatch a run to its strategy.
pub(crate) async fn execute_run(
    run: &Run,
    provider: &dyn AgentProvider,
    hooks: &dyn RunHooks,
    cancel: &CancellationToken,
    config: &ExecutorConfig,
) -> Result<ExecutionOutcome, ExecutorError> {
    match run.kind {
        RunKind::Exec => run_exec(run, provider, hooks, cancel).await,
        RunKind::Review => run_review(run, provider, hooks, cancel, config).await,
    }
}

pub(crate) struct TurnInterrupt {
    pub(crate) client: Arc<dyn AgentClient>,
    pub(crate) thread_id: String,
    pub(crate) turn_id: String,
}

#[async_trait]
impl RunInterrupt for TurnInterrupt {
    async fn interrupt(&self) -> Result<(), AgentError> {
        self.client
            .interrupt_turn(&self.thread_id, &self.turn_id)
            .await
    }
}

/// Exec strategy: resume or start a thread, run one turn, stream notifications.
async fn run_exec(
    run: &Run,
    provider: &dyn AgentProvider,
    hooks: &dyn RunHooks,
    cancel: &CancellationToken,
) -> Result<ExecutionOutcome, ExecutorError> {
    let client = provider.client().await?;

    let thread = match &run.codex_thread_id {
        Some(thread_id) => client.resume_thread(thread_id).await?,
        None => {
            client
                .start_thread(ThreadOptions {
                    cwd: Some(run.cwd.clone()),
                    developer_instructions: None,
                })
                .await?
        }
    };
    hooks
        .set_codex_ids(Some(&thread.thread_id), None, thread.rollout_path.as_deref())
        .await;

    let turn = client
        .start_turn(
            &thread.thread_id,
            TurnOptions {
                prompt: run.prompt.clone(),
                cwd: run.cwd.clone(),
                model: run.model.clone(),
                effort: run.effort.clone(),
                sandbox: run.sandbox.clone(),
                approval_policy: run.approval_policy.clone(),
            },
        )
        .await?;
    hooks
        .set_codex_ids(None, Some(&turn.turn_id), None)
        .await;

    let interrupt: Arc<dyn RunInterrupt> = Arc::new(TurnInterrupt {
        client: Arc::clone(&client),
        thread_id: thread.thread_id.clone(),
        turn_id: turn.turn_id.clone(),
    });
    hooks.set_interrupt(Arc::clone(&interrupt)).await;

    drive_turn(turn, hooks, interrupt, cancel).await
}

/// Shared notification/outcome loop for app-server turns.
pub(crate) async fn drive_turn(
    turn: StartedTurn,
    hooks: &dyn RunHooks,
    interrupt: Arc<dyn RunInterrupt>,
    cancel: &CancellationToken,
) -> Result<ExecutionOutcome, ExecutorError> {
    let StartedTurn {
        turn_id,
        mut notifications,
        outcome,
    } = turn;
    let mut outcome = outcome;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!(turn_id, "turn cancelled; sending best-effort interrupt");
                if let Err(e) = interrupt.interrupt().await {
                    debug!(turn_id, error = %e, "interrupt after cancellation failed");
                }
                return Ok(ExecutionOutcome::new(RunStatus::Interrupted));
            }
            notification = notifications.recv() => {
                match notification {
                    Some(notification) => hooks.publish_notification(notification).await,
                    None => break,
                }
            }
            result = &mut outcome => {
                while let Ok(notification) = notifications.try_recv() {
                    hooks.publish_notification(notification).await;
                }
                return match result {
                    Ok(outcome) => Ok(map_turn_outcome(outcome)),
                    Err(_) => Err(ExecutorError::Agent(AgentError::Disconnected)),
                };
            }
        }
    }

    // Notification stream closed first; the outcome decides.
    match outcome.await {
        Ok(outcome) => Ok(map_turn_outcome(outcome)),
        Err(_) => {
            warn!(turn_id, "turn outcome channel closed without a result");
            Err(ExecutorError::Agent(AgentError::Disconnected))
        }
    }
}

/// Map the agent's completion status onto a run status. Unknown statuses are
/// treated as success.
fn map_turn_outcome(outcome: TurnOutcome) -> ExecutionOutcome {
    let status = outcome
        .status
        .as_deref()
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    match status.as_str() {
        "failed" | "error" => ExecutionOutcome {
            status: RunStatus::Failed,
            error: Some(outcome.error.unwrap_or_else(|| "turn failed".to_string())),
        },
        "interrupted" | "aborted" | "canceled" | "cancelled" => {
            ExecutionOutcome::new(RunStatus::Interrupted)
        }
        _ => ExecutionOutcome::new(RunStatus::Succeeded),
    }
}
