//! Persistence of run records.
//!
//! Every write is a compare-and-set on [`Run::revision`]: a writer that
//! started from a stale copy gets [`ChainError::Conflict`] and must reload.

mod memory;

pub use memory::InMemoryRunStore;

use async_trait::async_trait;

use crate::core::{Run, RunId, RunStatus};
use crate::errors::ChainError;

/// Storage backend for run records.
#[async_trait]
pub trait RunStore: Send + Sync {
    /// Inserts a new run. Returns false if a run with the same id exists.
    async fn insert(&self, run: &Run) -> Result<bool, ChainError>;

    /// Loads a run.
    async fn get(&self, run_id: &RunId) -> Result<Option<Run>, ChainError>;

    /// Writes `run` if the stored revision equals `run.revision`, then bumps
    /// the revision on both copies.
    async fn save(&self, run: &mut Run) -> Result<(), ChainError>;

    /// All runs currently in `status`.
    async fn list_by_status(&self, status: RunStatus) -> Result<Vec<Run>, ChainError>;
}
