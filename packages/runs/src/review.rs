// ABOUTME: Review strategies: one-shot review subprocess or an app-server review turn
// ABOUTME: Subprocess output batches into delta notifications at newline or 2048 chars

use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use codexd_agent::{
    AgentError, AgentNotification, AgentProvider, ReviewTarget, ThreadOptions,
};
use codexd_core::{truncate_utf8, Review, ReviewMode, Run, RunStatus, MAX_ERROR_BYTES};

use crate::executor::{
    drive_turn, ExecutionOutcome, ExecutorConfig, ExecutorError, RunHooks, RunInterrupt,
    TurnInterrupt,
};

/// Output chunks are cut at a newline or once they reach this many characters.
const REVIEW_CHUNK_CHARS: usize = 2_048;

const STDOUT_METHOD: &str = "item/agentMessage/delta";
const STDERR_METHOD: &str = "item/commandExecution/outputDelta";

pub(crate) async fn run_review(
    run: &Run,
    provider: &dyn AgentProvider,
    hooks: &dyn RunHooks,
    cancel: &CancellationToken,
    config: &ExecutorConfig,
) -> Result<ExecutionOutcome, ExecutorError> {
    let review = run
        .review
        .clone()
        .ok_or_else(|| ExecutorError::Failed("review run without review options".to_string()))?;
    match review.mode {
        ReviewMode::Exec => run_review_exec(run, &review, hooks, cancel, config).await,
        ReviewMode::Appserver => run_review_appserver(run, &review, provider, hooks, cancel).await,
    }
}

fn review_target(review: &Review) -> ReviewTarget {
    if let Some(branch) = &review.base_branch {
        ReviewTarget::BaseBranch(branch.clone())
    } else if let Some(sha) = &review.commit_sha {
        ReviewTarget::Commit {
            sha: sha.clone(),
            title: review.title.clone(),
        }
    } else {
        ReviewTarget::Uncommitted
    }
}

/// App-server sub-mode: ephemeral thread, then a review turn on it.
async fn run_review_appserver(
    run: &Run,
    review: &Review,
    provider: &dyn AgentProvider,
    hooks: &dyn RunHooks,
    cancel: &CancellationToken,
) -> Result<ExecutionOutcome, ExecutorError> {
    let client = provider.client().await?;
    let developer_instructions = if run.prompt.is_empty() {
        None
    } else {
        Some(run.prompt.clone())
    };
    let thread = client
        .start_thread(ThreadOptions {
            cwd: Some(run.cwd.clone()),
            developer_instructions,
        })
        .await?;
    hooks
        .set_codex_ids(Some(&thread.thread_id), None, thread.rollout_path.as_deref())
        .await;

    let turn = client
        .start_review(&thread.thread_id, review.delivery, review_target(review))
        .await?;
    hooks.set_codex_ids(None, Some(&turn.turn_id), None).await;

    let interrupt: Arc<dyn RunInterrupt> = Arc::new(TurnInterrupt {
        client: Arc::clone(&client),
        thread_id: thread.thread_id.clone(),
        turn_id: turn.turn_id.clone(),
    });
    hooks.set_interrupt(Arc::clone(&interrupt)).await;

    drive_turn(turn, hooks, interrupt, cancel).await
}

struct KillInterrupt {
    token: CancellationToken,
}

#[async_trait]
impl RunInterrupt for KillInterrupt {
    async fn interrupt(&self) -> Result<(), AgentError> {
        self.token.cancel();
        Ok(())
    }
}

/// Exec sub-mode: spawn the review subprocess and relay its output.
async fn run_review_exec(
    run: &Run,
    review: &Review,
    hooks: &dyn RunHooks,
    cancel: &CancellationToken,
    config: &ExecutorConfig,
) -> Result<ExecutionOutcome, ExecutorError> {
    let mut command = Command::new(&config.codex_binary);
    command.arg("review").current_dir(&run.cwd);
    if let Some(branch) = &review.base_branch {
        command.arg("--base").arg(branch);
    } else if let Some(sha) = &review.commit_sha {
        command.arg("--commit").arg(sha);
        if let Some(title) = &review.title {
            command.arg("--title").arg(title);
        }
    } else {
        command.arg("--uncommitted");
    }
    for option in &review.additional_options {
        command.arg(option);
    }
    if !run.prompt.is_empty() {
        command.arg(&run.prompt);
    }
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = command
        .spawn()
        .map_err(|e| ExecutorError::Agent(AgentError::Spawn(e.to_string())))?;
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let kill_token = CancellationToken::new();
    let interrupt: Arc<dyn RunInterrupt> = Arc::new(KillInterrupt {
        token: kill_token.clone(),
    });
    hooks.set_interrupt(Arc::clone(&interrupt)).await;

    let (chunk_tx, mut chunk_rx) = mpsc::unbounded_channel::<(&'static str, String)>();
    let stderr_tail = Arc::new(std::sync::Mutex::new(String::new()));

    if let Some(stdout) = stdout {
        let tx = chunk_tx.clone();
        tokio::spawn(async move {
            relay_output(stdout, STDOUT_METHOD, tx, None).await;
        });
    }
    if let Some(stderr) = stderr {
        let tx = chunk_tx.clone();
        let tail = Arc::clone(&stderr_tail);
        tokio::spawn(async move {
            relay_output(stderr, STDERR_METHOD, tx, Some(tail)).await;
        });
    }
    drop(chunk_tx);

    let mut interrupted = false;
    let mut chunks_open = true;
    let status = loop {
        tokio::select! {
            chunk = chunk_rx.recv(), if chunks_open => {
                match chunk {
                    Some((method, delta)) => publish_delta(hooks, method, &delta).await,
                    None => chunks_open = false,
                }
            }
            _ = kill_token.cancelled(), if !interrupted => {
                interrupted = true;
                let _ = child.start_kill();
            }
            _ = cancel.cancelled(), if !interrupted => {
                interrupted = true;
                let _ = child.start_kill();
            }
            status = child.wait() => {
                break status.map_err(|e| ExecutorError::Agent(AgentError::Io(e)))?;
            }
        }
    };

    // Drain whatever the readers still have buffered.
    while let Some((method, delta)) = chunk_rx.recv().await {
        publish_delta(hooks, method, &delta).await;
    }

    if interrupted {
        return Ok(ExecutionOutcome::new(RunStatus::Interrupted));
    }
    if status.success() {
        Ok(ExecutionOutcome::new(RunStatus::Succeeded))
    } else {
        let tail = stderr_tail
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        let code = status.code().unwrap_or(-1);
        let message = if tail.is_empty() {
            format!("review subprocess exited with code {code}")
        } else {
            tail
        };
        Ok(ExecutionOutcome {
            status: RunStatus::Failed,
            error: Some(message),
        })
    }
}

async fn publish_delta(hooks: &dyn RunHooks, method: &str, delta: &str) {
    hooks
        .publish_notification(AgentNotification {
            method: method.to_string(),
            params: json!({ "delta": delta }),
        })
        .await;
}

/// Read a subprocess pipe into newline/threshold-bounded chunks.
async fn relay_output<R: AsyncReadExt + Unpin>(
    mut reader: R,
    method: &'static str,
    tx: mpsc::UnboundedSender<(&'static str, String)>,
    tail: Option<Arc<std::sync::Mutex<String>>>,
) {
    let mut assembler = ChunkAssembler::default();
    let mut buf = [0u8; 8 * 1024];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                for chunk in assembler.push(&buf[..n]) {
                    record_tail(&tail, &chunk);
                    if tx.send((method, chunk)).is_err() {
                        return;
                    }
                }
            }
            Err(e) => {
                debug!(method, error = %e, "subprocess pipe read failed");
                break;
            }
        }
    }
    if let Some(chunk) = assembler.flush() {
        record_tail(&tail, &chunk);
        let _ = tx.send((method, chunk));
    }
}

fn record_tail(tail: &Option<Arc<std::sync::Mutex<String>>>, chunk: &str) {
    if let Some(tail) = tail {
        let mut tail = tail.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if tail.len() < MAX_ERROR_BYTES {
            let budget = MAX_ERROR_BYTES - tail.len();
            tail.push_str(truncate_utf8(chunk, budget));
        }
    }
}

/// Accumulates pipe bytes into text chunks cut at `\n` or the size threshold.
/// Incomplete UTF-8 at a read boundary stays pending until the next read.
#[derive(Default)]
struct ChunkAssembler {
    bytes: Vec<u8>,
    chunk: String,
    chunk_chars: usize,
}

impl ChunkAssembler {
    fn push(&mut self, input: &[u8]) -> Vec<String> {
        self.bytes.extend_from_slice(input);
        let decoded = match std::str::from_utf8(&self.bytes) {
            Ok(s) => {
                let s = s.to_string();
                self.bytes.clear();
                s
            }
            Err(e) => {
                let valid = e.valid_up_to();
                let s = String::from_utf8_lossy(&self.bytes[..valid]).into_owned();
                self.bytes.drain(..valid);
                s
            }
        };

        let mut out = Vec::new();
        for c in decoded.chars() {
            self.chunk.push(c);
            self.chunk_chars += 1;
            if c == '\n' || self.chunk_chars >= REVIEW_CHUNK_CHARS {
                self.chunk_chars = 0;
                out.push(std::mem::take(&mut self.chunk));
            }
        }
        out
    }

    fn flush(&mut self) -> Option<String> {
        if !self.bytes.is_empty() {
            warn!("dropping incomplete utf-8 tail from subprocess output");
            self.bytes.clear();
        }
        if self.chunk.is_empty() {
            None
        } else {
            self.chunk_chars = 0;
            Some(std::mem::take(&mut self.chunk))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn chunks_cut_at_newlines() {
        let mut assembler = ChunkAssembler::default();
        let chunks = assembler.push(b"one\ntwo\npartial");
        assert_eq!(chunks, vec!["one\n".to_string(), "two\n".to_string()]);
        assert_eq!(assembler.flush(), Some("partial".to_string()));
    }

    #[test]
    fn chunks_cut_at_threshold() {
        let mut assembler = ChunkAssembler::default();
        let long = "x".repeat(REVIEW_CHUNK_CHARS + 10);
        let chunks = assembler.push(long.as_bytes());
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].len(), REVIEW_CHUNK_CHARS);
        assert_eq!(assembler.flush(), Some("x".repeat(10)));
    }

    #[test]
    fn split_utf8_is_reassembled() {
        let mut assembler = ChunkAssembler::default();
        let text = "héllo\n".as_bytes();
        // Split inside the two-byte 'é'
        let chunks_a = assembler.push(&text[..2]);
        assert!(chunks_a.is_empty());
        let chunks_b = assembler.push(&text[2..]);
        assert_eq!(chunks_b, vec!["héllo\n".to_string()]);
    }

    #[test]
    fn review_target_prefers_explicit_targets() {
        let review = Review {
            base_branch: Some("main".to_string()),
            ..Default::default()
        };
        assert!(matches!(review_target(&review), ReviewTarget::BaseBranch(b) if b == "main"));

        let review = Review {
            commit_sha: Some("abc123".to_string()),
            title: Some("fix".to_string()),
            ..Default::default()
        };
        assert!(matches!(review_target(&review), ReviewTarget::Commit { .. }));

        let review = Review {
            uncommitted: true,
            ..Default::default()
        };
        assert!(matches!(review_target(&review), ReviewTarget::Uncommitted));
    }
}
