//! Durable log positions, one file per container
//!
//! A checkpoint holds the opaque resume token of the last shipped log line as
//! raw bytes. Writes are throttled per container, so after a restart up to one
//! checkpoint period of lines may be shipped again. I/O failures are logged
//! and counted, never propagated.

use super::store::ContainerRecord;
use crate::observability::AgentMetrics;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tracing::{debug, warn};

/// File-backed checkpoint store
#[derive(Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
    period: Duration,
    metrics: AgentMetrics,
}

impl CheckpointStore {
    pub fn new(dir: impl Into<PathBuf>, period: Duration, metrics: AgentMetrics) -> Self {
        Self {
            dir: dir.into(),
            period,
            metrics,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Create the checkpoint directory if needed
    pub async fn ensure_dir(&self) -> std::io::Result<()> {
        fs::create_dir_all(&self.dir).await
    }

    /// Path of the checkpoint file for `container_id`, `None` for ids unusable as file names
    pub fn path(&self, container_id: &str) -> Option<PathBuf> {
        let usable = !container_id.is_empty()
            && container_id != "."
            && container_id != ".."
            && !container_id.contains(['/', '\\']);
        usable.then(|| self.dir.join(container_id))
    }

    /// Resume token for `container_id`, empty when none was saved
    pub async fn load(&self, container_id: &str) -> String {
        let Some(path) = self.path(container_id) else {
            return String::new();
        };

        match fs::read(&path).await {
            Ok(raw) => String::from_utf8_lossy(&raw).trim().to_string(),
            Err(e) if e.kind() == ErrorKind::NotFound => String::new(),
            Err(e) => {
                warn!(container_id = %container_id, error = %e, "Failed to read checkpoint");
                String::new()
            }
        }
    }

    /// Persist `token` unless the record's last write is younger than the checkpoint period.
    ///
    /// Returns true when the file was written.
    pub async fn save(&self, record: &ContainerRecord, token: &str) -> bool {
        if !record.claim_checkpoint_write(self.period) {
            return false;
        }

        match self.write(record.id(), token).await {
            Ok(()) => {
                debug!(container_id = %record.id(), token = %token, "Checkpoint saved");
                true
            }
            Err(e) => {
                self.metrics.inc_checkpoint_errors();
                warn!(container_id = %record.id(), error = %e, "Failed to save checkpoint");
                false
            }
        }
    }

    /// Write `token` immediately, replacing the file atomically
    pub async fn write(&self, container_id: &str, token: &str) -> std::io::Result<()> {
        let path = self.path(container_id).ok_or_else(|| {
            std::io::Error::new(
                ErrorKind::InvalidInput,
                format!("invalid container id `{container_id}`"),
            )
        })?;
        let tmp = path.with_extension("tmp");

        fs::write(&tmp, token.as_bytes()).await?;
        fs::rename(&tmp, &path).await
    }

    /// Delete the checkpoint of `container_id`; a missing file is not an error
    pub async fn remove(&self, container_id: &str) {
        let Some(path) = self.path(container_id) else {
            return;
        };

        match fs::remove_file(&path).await {
            Ok(()) => debug!(container_id = %container_id, "Checkpoint removed"),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => {
                self.metrics.inc_checkpoint_errors();
                warn!(container_id = %container_id, error = %e, "Failed to remove checkpoint");
            }
        }
    }
}
