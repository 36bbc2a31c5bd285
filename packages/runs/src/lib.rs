// ABOUTME: Run lifecycle engine for codexd
// ABOUTME: The run manager, executor strategies, and control-operation plumbing

mod executor;
mod manager;
mod review;

pub use executor::{ExecutionOutcome, ExecutorConfig, ExecutorError, RunHooks, RunInterrupt};
pub use manager::{RunError, RunManager};
