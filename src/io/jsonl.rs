//! Append-only JSONL files (one JSON object per line)

use crate::domain::error::StoreError;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Serialized appender for a JSONL file
///
/// Writes are flushed before `append` returns, so a record is on disk
/// before any side effect depending on it runs.
pub struct JsonlWriter {
    path: PathBuf,
    file: Mutex<Option<File>>,
}

impl JsonlWriter {
    pub fn new(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        info!(file_path = %path.display(), "jsonl_writer_initialized");
        Self { path, file: Mutex::new(None) }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record as a line
    pub async fn append<T: Serialize + ?Sized>(&self, record: &T) -> Result<(), StoreError> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let mut guard = self.file.lock().await;
        if guard.is_none() {
            *guard = Some(self.open().await?);
        }
        let Some(file) = guard.as_mut() else {
            return Ok(());
        };

        if let Err(e) = write_line(file, &line).await {
            // Reopen on the next append in case the file was rotated away
            *guard = None;
            return Err(e.into());
        }
        debug!(file = %self.path.display(), bytes = %line.len(), "jsonl_written");
        Ok(())
    }

    async fn open(&self) -> std::io::Result<File> {
        // Create parent directories if they don't exist
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        OpenOptions::new().create(true).append(true).open(&self.path).await
    }
}

async fn write_line(file: &mut File, line: &[u8]) -> std::io::Result<()> {
    file.write_all(line).await?;
    file.flush().await
}
