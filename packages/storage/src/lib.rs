// ABOUTME: Durable per-run state for codexd
// ABOUTME: run.json records, append-only JSONL logs, the global index, and rollout reading

mod error;
mod jsonl;
mod rollout;
mod store;

pub use error::StoreError;
pub use jsonl::JsonlReader;
pub use rollout::{read_rollout_watermark, RolloutEntry, RolloutKind, RolloutReader, ROLLOUT_TAIL_BYTES};
pub use store::{RunStore, RunStoreOptions, TAIL_CAP};
