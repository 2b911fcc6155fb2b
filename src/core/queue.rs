//! Durable outage log.
//!
//! One serialized payload per line. The file is only ever appended to or
//! removed as a whole; it is never rewritten in place.

use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
};

use tokio::{fs, io::AsyncWriteExt};
use tracing::{debug, warn};

use super::{error::QueueError, event::machine_id_of};

/// A payload read back from the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedPayload {
    pub machine_id: String,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct OfflineQueue {
    path: PathBuf,
}

impl OfflineQueue {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one payload and syncs it to disk.
    pub async fn append(&self, payload: &[u8]) -> Result<(), QueueError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await?;
        }

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;

        let mut line = Vec::with_capacity(payload.len() + 1);
        line.extend_from_slice(payload);
        line.push(b'\n');

        file.write_all(&line).await?;
        file.flush().await?;
        file.sync_data().await?;

        debug!("Queued payload in {}", self.path.display());
        Ok(())
    }

    /// Reads every queued payload in append order.
    ///
    /// A missing file is an empty queue. Blank lines are ignored and lines
    /// without a machine id are skipped with a warning.
    pub async fn load(&self) -> Result<Vec<QueuedPayload>, QueueError> {
        let content = match fs::read(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut entries = Vec::new();
        for (index, line) in content.split(|b| *b == b'\n').enumerate() {
            let line = line.strip_suffix(b"\r").unwrap_or(line);
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            match machine_id_of(line) {
                Some(machine_id) => entries.push(QueuedPayload {
                    machine_id,
                    payload: line.to_vec(),
                }),
                None => warn!(
                    "Skipping unreadable queue entry at {}:{}",
                    self.path.display(),
                    index + 1
                ),
            }
        }
        Ok(entries)
    }

    /// Deletes the queue file. A missing file is not an error.
    pub async fn clear(&self) -> Result<(), QueueError> {
        match fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn is_empty(&self) -> Result<bool, QueueError> {
        match fs::metadata(&self.path).await {
            Ok(meta) => Ok(meta.len() == 0),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(true),
            Err(e) => Err(e.into()),
        }
    }
}
