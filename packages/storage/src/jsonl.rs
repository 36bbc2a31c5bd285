// ABOUTME: Line-oriented JSON helpers shared by the store
// ABOUTME: Appends, bounded tail reads, and a forward reader that skips corrupt lines

use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tracing::warn;

use crate::error::StoreError;

/// Serialize one value and append it as a single line.
pub(crate) async fn append_line<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    let mut line = serde_json::to_string(value)?;
    line.push('\n');
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .map_err(|e| StoreError::io(path, e))?;
    file.write_all(line.as_bytes())
        .await
        .map_err(|e| StoreError::io(path, e))?;
    file.flush().await.map_err(|e| StoreError::io(path, e))?;
    Ok(())
}

/// Read the last `cap` records of a JSONL file. Missing files read as empty;
/// corrupt lines are skipped with a single warning per read.
pub(crate) async fn read_tail<T: DeserializeOwned>(
    path: &Path,
    cap: usize,
) -> Result<Vec<T>, StoreError> {
    let mut reader = match JsonlReader::<T>::open(path).await? {
        Some(reader) => reader,
        None => return Ok(Vec::new()),
    };
    let mut tail: VecDeque<T> = VecDeque::new();
    while let Some(record) = reader.next_record().await? {
        if tail.len() == cap {
            tail.pop_front();
        }
        tail.push_back(record);
    }
    Ok(tail.into())
}

/// Forward reader over a JSONL file that tolerates corruption: unparseable
/// lines are dropped and the file keeps streaming.
pub struct JsonlReader<T> {
    path: PathBuf,
    lines: Lines<BufReader<File>>,
    warned: bool,
    _marker: std::marker::PhantomData<T>,
}

impl<T: DeserializeOwned> JsonlReader<T> {
    /// Open a reader, or `None` when the file does not exist yet.
    pub async fn open(path: &Path) -> Result<Option<Self>, StoreError> {
        let file = match File::open(path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StoreError::io(path, e)),
        };
        Ok(Some(Self {
            path: path.to_path_buf(),
            lines: BufReader::new(file).lines(),
            warned: false,
            _marker: std::marker::PhantomData,
        }))
    }

    pub async fn next_record(&mut self) -> Result<Option<T>, StoreError> {
        loop {
            let line = self
                .lines
                .next_line()
                .await
                .map_err(|e| StoreError::io(&self.path, e))?;
            let Some(line) = line else {
                return Ok(None);
            };
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<T>(&line) {
                Ok(record) => return Ok(Some(record)),
                Err(e) => {
                    if !self.warned {
                        warn!(path = %self.path.display(), error = %e, "skipping corrupt jsonl line");
                        self.warned = true;
                    }
                }
            }
        }
    }
}
