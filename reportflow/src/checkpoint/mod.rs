//! Durable per-stage checkpoints.
//!
//! A checkpoint records that a stage of a run completed, with its validated
//! record and usage. It is written at most once per (run, stage) and never
//! overwritten; every execution attempt consults it first.

mod file;
mod memory;

pub use file::FileCheckpointStore;
pub use memory::InMemoryCheckpointStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::contracts::StageRecord;
use crate::core::{RunId, TokenUsage};
use crate::errors::ChainError;

/// The persisted result of a completed stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Owning run.
    pub run_id: RunId,
    /// Stage name.
    pub stage: String,
    /// The validated record.
    pub record: StageRecord,
    /// Usage summed over every attempt of the successful execution.
    pub usage: TokenUsage,
    /// Attempts the execution took.
    pub attempts: u32,
    /// SHA-256 of the stage input the record was produced from.
    pub input_fingerprint: String,
    /// When the checkpoint was written.
    pub created_at: DateTime<Utc>,
}

/// Result of a write-once put.
#[derive(Debug, Clone, PartialEq)]
pub enum PutOutcome {
    /// The checkpoint was stored.
    Inserted,
    /// A checkpoint already existed; it is returned unchanged.
    AlreadyPresent(Box<Checkpoint>),
}

impl PutOutcome {
    /// Returns the checkpoint that is now authoritative.
    #[must_use]
    pub fn into_stored(self, attempted: Checkpoint) -> Checkpoint {
        match self {
            Self::Inserted => attempted,
            Self::AlreadyPresent(existing) => *existing,
        }
    }
}

/// Storage backend for checkpoints.
///
/// Implementations must be safe under concurrent access from independent
/// runs and must make `put_if_absent` atomic per (run, stage).
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Gets the checkpoint of a stage.
    async fn get(&self, run_id: &RunId, stage: &str) -> Result<Option<Checkpoint>, ChainError>;

    /// Stores a checkpoint unless one already exists for its (run, stage).
    async fn put_if_absent(&self, checkpoint: Checkpoint) -> Result<PutOutcome, ChainError>;

    /// All checkpoints of a run, oldest first.
    async fn list_for_run(&self, run_id: &RunId) -> Result<Vec<Checkpoint>, ChainError>;
}

#[cfg(test)]
pub(crate) fn sample_checkpoint(run: &str, stage: &str, payload: serde_json::Value) -> Checkpoint {
    Checkpoint {
        run_id: RunId::new(run),
        stage: stage.to_string(),
        record: StageRecord::new(stage, 1, payload),
        usage: TokenUsage::new(10, 20),
        attempts: 1,
        input_fingerprint: "f".repeat(64),
        created_at: Utc::now(),
    }
}
