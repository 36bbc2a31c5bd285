// ABOUTME: Rollup writer: converts streaming output deltas into line-oriented records
// ABOUTME: Handles CR/LF splits across deltas, control markers, and per-run self-disable

use std::collections::HashMap;
use std::mem;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::warn;

use codexd_core::{event_type, MonotonicClock, RunEventEnvelope, RunRollupRecord};
use codexd_storage::RunStore;

/// A buffered line is force-flushed once it reaches this many characters.
pub const MAX_BUFFERED_LINE_CHARS: usize = 64_000;

#[derive(Default)]
struct RunRollupState {
    buffer: String,
    buffered_chars: usize,
    pending_cr: bool,
    disabled: bool,
}

impl RunRollupState {
    fn emit_line(
        &mut self,
        source: Option<&str>,
        now: DateTime<Utc>,
        ends_with_newline: bool,
    ) -> RunRollupRecord {
        let text = mem::take(&mut self.buffer);
        self.buffered_chars = 0;
        RunRollupRecord::output_line(now, source.map(str::to_string), text, ends_with_newline)
    }

    /// Flush whatever is buffered ahead of a control marker. A held CR acted
    /// as a line terminator; plain partial content flushes without one.
    fn flush_partial(&mut self, source: Option<&str>, now: DateTime<Utc>) -> Option<RunRollupRecord> {
        if self.pending_cr {
            self.pending_cr = false;
            Some(self.emit_line(source, now, true))
        } else if !self.buffer.is_empty() {
            Some(self.emit_line(source, now, false))
        } else {
            None
        }
    }

    fn push_delta(
        &mut self,
        source: Option<&str>,
        delta: &str,
        now: DateTime<Utc>,
    ) -> Vec<RunRollupRecord> {
        let mut records = Vec::new();

        if delta.eq_ignore_ascii_case("thinking") || delta.eq_ignore_ascii_case("final") {
            records.extend(self.flush_partial(source, now));
            records.push(RunRollupRecord::control(
                now,
                source.map(str::to_string),
                delta,
            ));
            return records;
        }

        let mut chars = delta.chars().peekable();
        if self.pending_cr {
            // A CR held from the previous delta: merge with a leading LF into
            // CRLF, otherwise it terminated a line on its own.
            self.pending_cr = false;
            if chars.peek() == Some(&'\n') {
                chars.next();
            }
            records.push(self.emit_line(source, now, true));
        }

        while let Some(c) = chars.next() {
            match c {
                '\n' => records.push(self.emit_line(source, now, true)),
                '\r' => {
                    if chars.peek() == Some(&'\n') {
                        chars.next();
                        records.push(self.emit_line(source, now, true));
                    } else if chars.peek().is_none() {
                        self.pending_cr = true;
                    } else {
                        records.push(self.emit_line(source, now, true));
                    }
                }
                c => {
                    self.buffer.push(c);
                    self.buffered_chars += 1;
                    if self.buffered_chars >= MAX_BUFFERED_LINE_CHARS {
                        records.push(self.emit_line(source, now, false));
                    }
                }
            }
        }
        records
    }

    /// Terminal flush: the trailing CR is trimmed and leftover content goes
    /// out as a final non-newline line.
    fn finish(&mut self, now: DateTime<Utc>) -> Option<RunRollupRecord> {
        self.pending_cr = false;
        if self.buffer.is_empty() {
            None
        } else {
            Some(self.emit_line(None, now, false))
        }
    }
}

/// Per-run accumulator turning `codex.notification` envelopes into rollup
/// records, persisting them best-effort through the run store.
pub struct RollupWriter {
    store: Arc<RunStore>,
    clock: Arc<MonotonicClock>,
    runs: Mutex<HashMap<String, RunRollupState>>,
}

impl RollupWriter {
    pub fn new(store: Arc<RunStore>, clock: Arc<MonotonicClock>) -> Self {
        Self {
            store,
            clock,
            runs: Mutex::new(HashMap::new()),
        }
    }

    /// Feed one published envelope. Only `codex.notification` envelopes
    /// produce rollup records.
    pub async fn handle_envelope(&self, run_id: &str, envelope: &RunEventEnvelope) {
        if envelope.event_type != event_type::CODEX_NOTIFICATION {
            return;
        }
        let mut records = Vec::new();
        {
            let mut runs = self.runs.lock().await;
            let state = runs.entry(run_id.to_string()).or_default();
            if state.disabled {
                return;
            }
            if let Some((source, delta)) = extract_delta(&envelope.data) {
                records = state.push_delta(source.as_deref(), delta, self.clock.now());
            } else if let Some(text) = extract_agent_message(&envelope.data) {
                records.push(RunRollupRecord::agent_message(self.clock.now(), text));
            }
        }
        self.persist(run_id, records).await;
    }

    /// Flush the run's buffered content and drop its accumulator state.
    pub async fn finish(&self, run_id: &str) {
        let record = {
            let mut runs = self.runs.lock().await;
            match runs.remove(run_id) {
                Some(mut state) if !state.disabled => state.finish(self.clock.now()),
                _ => None,
            }
        };
        if let Some(record) = record {
            self.persist(run_id, vec![record]).await;
        }
    }

    async fn persist(&self, run_id: &str, records: Vec<RunRollupRecord>) {
        for record in records {
            if let Err(e) = self.store.append_rollup_record(run_id, &record).await {
                warn!(run_id, error = %e, "rollup persistence failed; disabling for this run");
                let mut runs = self.runs.lock().await;
                if let Some(state) = runs.get_mut(run_id) {
                    state.disabled = true;
                    state.buffer.clear();
                    state.buffered_chars = 0;
                    state.pending_cr = false;
                }
                return;
            }
        }
    }
}

/// `method` ending in `/delta` or `/outputDelta` carries streaming text in
/// `params.delta`; `source` is the item segment of the method.
fn extract_delta(data: &Value) -> Option<(Option<String>, &str)> {
    let method = data.get("method")?.as_str()?;
    if !method.ends_with("/outputDelta") && !method.ends_with("/delta") {
        return None;
    }
    let delta = data.get("params")?.get("delta")?.as_str()?;
    let source = method.split('/').nth(1).map(str::to_string);
    Some((source, delta))
}

/// A completed `agentMessage` item becomes a single agentMessage record.
fn extract_agent_message(data: &Value) -> Option<&str> {
    let method = data.get("method")?.as_str()?;
    if method != "item/completed" {
        return None;
    }
    let item = data.get("params")?.get("item")?;
    if item.get("type")?.as_str()? != "agentMessage" {
        return None;
    }
    item.get("text")?.as_str()
}

#[cfg(test)]
mod tests {
    use super::*;
    use codexd_core::{NewRunSpec, RollupKind, RunKind};
    use codexd_storage::RunStoreOptions;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn delta_envelope(delta: &str) -> RunEventEnvelope {
        RunEventEnvelope::new(
            event_type::CODEX_NOTIFICATION,
            Utc::now(),
            json!({
                "method": "item/agentMessage/delta",
                "params": { "delta": delta }
            }),
        )
    }

    async fn writer_with_run() -> (Arc<RunStore>, RollupWriter, String) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(RunStore::new(dir.into_path(), RunStoreOptions::default()));
        let (run, _) = store
            .create(&NewRunSpec {
                cwd: "/tmp/proj".to_string(),
                prompt: "hello".to_string(),
                kind: RunKind::Exec,
                review: None,
                model: None,
                effort: None,
                sandbox: None,
                approval_policy: None,
            })
            .await
            .unwrap();
        let writer = RollupWriter::new(Arc::clone(&store), Arc::new(MonotonicClock::new()));
        (store, writer, run.run_id)
    }

    #[tokio::test]
    async fn control_markers_segment_the_stream() {
        let (store, writer, run_id) = writer_with_run().await;
        for delta in ["partial ", "line\n", "thinking", "**Plan**\n", "final", "done\n"] {
            writer.handle_envelope(&run_id, &delta_envelope(delta)).await;
        }
        let records = store.read_rollup(&run_id, None).await.unwrap();
        let expected: Vec<(&str, Option<bool>, bool)> = vec![
            ("partial line", Some(true), false),
            ("thinking", None, true),
            ("**Plan**", Some(true), false),
            ("final", None, true),
            ("done", Some(true), false),
        ];
        assert_eq!(records.len(), expected.len());
        for (record, (text, ends, control)) in records.iter().zip(expected) {
            assert_eq!(record.text, text);
            assert_eq!(record.ends_with_newline, ends);
            assert_eq!(record.is_control(), control);
        }
    }

    #[tokio::test]
    async fn crlf_split_across_deltas_is_one_line() {
        let (store, writer, run_id) = writer_with_run().await;
        writer.handle_envelope(&run_id, &delta_envelope("one\r")).await;
        writer.handle_envelope(&run_id, &delta_envelope("\ntwo\n")).await;
        let records = store.read_rollup(&run_id, None).await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].text, "one");
        assert_eq!(records[0].ends_with_newline, Some(true));
        assert_eq!(records[1].text, "two");
    }

    #[tokio::test]
    async fn held_cr_without_lf_still_ends_the_line() {
        let (store, writer, run_id) = writer_with_run().await;
        writer.handle_envelope(&run_id, &delta_envelope("one\r")).await;
        writer.handle_envelope(&run_id, &delta_envelope("two\n")).await;
        let records = store.read_rollup(&run_id, None).await.unwrap();
        assert_eq!(records[0].text, "one");
        assert_eq!(records[0].ends_with_newline, Some(true));
        assert_eq!(records[1].text, "two");
    }

    #[tokio::test]
    async fn oversized_line_is_flushed_without_newline() {
        let (store, writer, run_id) = writer_with_run().await;
        let big = "x".repeat(MAX_BUFFERED_LINE_CHARS + 10);
        writer.handle_envelope(&run_id, &delta_envelope(&big)).await;
        let records = store.read_rollup(&run_id, None).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].text.len(), MAX_BUFFERED_LINE_CHARS);
        assert_eq!(records[0].ends_with_newline, Some(false));
    }

    #[tokio::test]
    async fn finish_flushes_and_trims_trailing_cr() {
        let (store, writer, run_id) = writer_with_run().await;
        writer.handle_envelope(&run_id, &delta_envelope("tail")).await;
        writer.finish(&run_id).await;
        let records = store.read_rollup(&run_id, None).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].text, "tail");
        assert_eq!(records[0].ends_with_newline, Some(false));
    }

    #[tokio::test]
    async fn completed_agent_message_becomes_one_record() {
        let (store, writer, run_id) = writer_with_run().await;
        let envelope = RunEventEnvelope::new(
            event_type::CODEX_NOTIFICATION,
            Utc::now(),
            json!({
                "method": "item/completed",
                "params": { "item": { "type": "agentMessage", "text": "all done" } }
            }),
        );
        writer.handle_envelope(&run_id, &envelope).await;
        let records = store.read_rollup(&run_id, None).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].kind, RollupKind::AgentMessage);
        assert_eq!(records[0].text, "all done");
    }

    #[tokio::test]
    async fn stderr_deltas_carry_their_source() {
        let (store, writer, run_id) = writer_with_run().await;
        let envelope = RunEventEnvelope::new(
            event_type::CODEX_NOTIFICATION,
            Utc::now(),
            json!({
                "method": "item/commandExecution/outputDelta",
                "params": { "delta": "warning\n" }
            }),
        );
        writer.handle_envelope(&run_id, &envelope).await;
        let records = store.read_rollup(&run_id, None).await.unwrap();
        assert_eq!(records[0].source.as_deref(), Some("commandExecution"));
    }

    #[tokio::test]
    async fn text_reconstruction_is_lossless() {
        let (store, writer, run_id) = writer_with_run().await;
        let deltas = ["abc", "def\nghi", "\njkl\n", "mno"];
        for delta in deltas {
            writer.handle_envelope(&run_id, &delta_envelope(delta)).await;
        }
        writer.finish(&run_id).await;
        let records = store.read_rollup(&run_id, None).await.unwrap();
        let mut rebuilt = String::new();
        for record in &records {
            rebuilt.push_str(&record.text);
            if record.ends_with_newline == Some(true) {
                rebuilt.push('\n');
            }
        }
        assert_eq!(rebuilt, deltas.concat());
    }
}
