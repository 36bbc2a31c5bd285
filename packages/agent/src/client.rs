// ABOUTME: Abstract agent client interface the run executor drives
// ABOUTME: The daemon core only ever sees these types, never a concrete transport

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

use codexd_core::ReviewDelivery;

use crate::error::AgentError;

/// One notification from the agent's stream, forwarded verbatim.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentNotification {
    pub method: String,
    pub params: Value,
}

/// A started or resumed thread.
#[derive(Debug, Clone)]
pub struct ThreadHandle {
    pub thread_id: String,
    /// Path of the agent's own rollout file for this thread, when reported.
    pub rollout_path: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ThreadOptions {
    pub cwd: Option<String>,
    pub developer_instructions: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct TurnOptions {
    pub prompt: String,
    pub cwd: String,
    pub model: Option<String>,
    pub effort: Option<String>,
    pub sandbox: Option<String>,
    pub approval_policy: Option<String>,
}

/// Review target, exactly one per review turn.
#[derive(Debug, Clone)]
pub enum ReviewTarget {
    Uncommitted,
    BaseBranch(String),
    Commit { sha: String, title: Option<String> },
}

/// How the agent reported a finished turn. `status` is the agent's own word
/// for it; the executor maps it onto a run status.
#[derive(Debug, Clone, Default)]
pub struct TurnOutcome {
    pub status: Option<String>,
    pub error: Option<String>,
}

/// A live turn: its notification stream and eventual outcome. Dropped
/// connections close both channels.
pub struct StartedTurn {
    pub turn_id: String,
    pub notifications: mpsc::UnboundedReceiver<AgentNotification>,
    pub outcome: oneshot::Receiver<TurnOutcome>,
}

#[async_trait]
pub trait AgentClient: Send + Sync {
    async fn start_thread(&self, options: ThreadOptions) -> Result<ThreadHandle, AgentError>;

    async fn resume_thread(&self, thread_id: &str) -> Result<ThreadHandle, AgentError>;

    async fn start_turn(
        &self,
        thread_id: &str,
        options: TurnOptions,
    ) -> Result<StartedTurn, AgentError>;

    async fn start_review(
        &self,
        thread_id: &str,
        delivery: Option<ReviewDelivery>,
        target: ReviewTarget,
    ) -> Result<StartedTurn, AgentError>;

    async fn interrupt_turn(&self, thread_id: &str, turn_id: &str) -> Result<(), AgentError>;

    async fn steer_turn(
        &self,
        thread_id: &str,
        turn_id: &str,
        prompt: &str,
    ) -> Result<(), AgentError>;
}

/// Source of agent clients. Awaits an in-flight restart before handing one
/// out; fails fast when the runtime is disabled or faulted.
#[async_trait]
pub trait AgentProvider: Send + Sync {
    async fn client(&self) -> Result<Arc<dyn AgentClient>, AgentError>;
}
