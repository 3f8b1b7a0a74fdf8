//! Filesystem checkpoint store.
//!
//! Layout: `<root>/<hex(run_id)>/<hex(stage)>.json`. A checkpoint is first
//! written to a uniquely named temporary file and then hard-linked into
//! place; the link fails if the target exists, which makes the put
//! write-once even across processes sharing the directory.

use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::warn;

use super::{Checkpoint, CheckpointStore, PutOutcome};
use crate::core::RunId;
use crate::errors::ChainError;

/// Checkpoint store persisting one JSON file per (run, stage).
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    root: PathBuf,
}

impl FileCheckpointStore {
    /// Creates a store rooted at `root`. The directory is created on first write.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn run_dir(&self, run_id: &RunId) -> PathBuf {
        self.root.join(hex::encode(run_id.as_str()))
    }

    fn checkpoint_path(&self, run_id: &RunId, stage: &str) -> PathBuf {
        self.run_dir(run_id).join(format!("{}.json", hex::encode(stage)))
    }

    async fn read(path: &Path) -> Result<Option<Checkpoint>, ChainError> {
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes).map_err(|e| {
                ChainError::Persistence(format!("corrupt checkpoint {}: {e}", path.display()))
            })?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ChainError::Persistence(format!(
                "failed to read checkpoint {}: {e}",
                path.display()
            ))),
        }
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn get(&self, run_id: &RunId, stage: &str) -> Result<Option<Checkpoint>, ChainError> {
        Self::read(&self.checkpoint_path(run_id, stage)).await
    }

    async fn put_if_absent(&self, checkpoint: Checkpoint) -> Result<PutOutcome, ChainError> {
        let dir = self.run_dir(&checkpoint.run_id);
        tokio::fs::create_dir_all(&dir).await?;

        let target = self.checkpoint_path(&checkpoint.run_id, &checkpoint.stage);
        let temp = dir.join(format!(".{}.tmp", uuid::Uuid::new_v4()));
        let bytes = serde_json::to_vec_pretty(&checkpoint)?;
        tokio::fs::write(&temp, &bytes).await?;

        let linked = tokio::fs::hard_link(&temp, &target).await;
        if let Err(e) = tokio::fs::remove_file(&temp).await {
            warn!(path = %temp.display(), error = %e, "Failed to remove temporary checkpoint file");
        }

        match linked {
            Ok(()) => Ok(PutOutcome::Inserted),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => match Self::read(&target).await? {
                Some(existing) => Ok(PutOutcome::AlreadyPresent(Box::new(existing))),
                None => Err(ChainError::Persistence(format!(
                    "checkpoint {} vanished after conflicting write",
                    target.display()
                ))),
            },
            Err(e) => Err(ChainError::Persistence(format!(
                "failed to commit checkpoint {}: {e}",
                target.display()
            ))),
        }
    }

    async fn list_for_run(&self, run_id: &RunId) -> Result<Vec<Checkpoint>, ChainError> {
        let dir = self.run_dir(run_id);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut checkpoints = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(checkpoint) = Self::read(&path).await? {
                checkpoints.push(checkpoint);
            }
        }
        checkpoints.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.stage.cmp(&b.stage)));
        Ok(checkpoints)
    }
}
