// ABOUTME: Agent integration for codexd
// ABOUTME: The abstract client interface plus the codex app-server runtime supervisor

mod client;
mod error;
mod protocol;
mod runtime;

pub use client::{
    AgentClient, AgentNotification, AgentProvider, ReviewTarget, StartedTurn, ThreadHandle,
    ThreadOptions, TurnOptions, TurnOutcome,
};
pub use error::AgentError;
pub use runtime::{AppServerClient, CodexRuntime, CodexRuntimeConfig, RuntimeState};
