// ABOUTME: Error types for agent runtime and client operations

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AgentError {
    /// The runtime was started with the agent disabled.
    #[error("codex runtime is disabled")]
    Disabled,

    /// The app-server connection dropped mid-operation.
    #[error("codex runtime disconnected")]
    Disconnected,

    /// The runtime cannot currently serve clients (faulted or disposed).
    #[error("codex runtime is not available: {0}")]
    Unavailable(String),

    /// The agent answered a request with an error.
    #[error("agent request failed: {0}")]
    Rpc(String),

    /// The app-server (or review) subprocess could not be spawned.
    #[error("failed to spawn agent process: {0}")]
    Spawn(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl AgentError {
    pub fn is_disconnect(&self) -> bool {
        matches!(self, AgentError::Disconnected)
    }
}
