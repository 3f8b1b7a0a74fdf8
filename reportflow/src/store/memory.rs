//! In-memory run store.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use super::RunStore;
use crate::core::{Run, RunId, RunStatus};
use crate::errors::ChainError;

/// Run store backed by a concurrent map.
#[derive(Debug, Default)]
pub struct InMemoryRunStore {
    runs: DashMap<RunId, Run>,
    failing_saves: AtomicUsize,
}

impl InMemoryRunStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of runs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.runs.len()
    }

    /// Returns true if the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }

    /// Makes the next `count` saves fail with a persistence error (for testing).
    pub fn fail_next_saves(&self, count: usize) {
        self.failing_saves.store(count, Ordering::SeqCst);
    }

    fn take_injected_failure(&self) -> bool {
        self.failing_saves
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl RunStore for InMemoryRunStore {
    async fn insert(&self, run: &Run) -> Result<bool, ChainError> {
        match self.runs.entry(run.id.clone()) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                slot.insert(run.clone());
                Ok(true)
            }
        }
    }

    async fn get(&self, run_id: &RunId) -> Result<Option<Run>, ChainError> {
        Ok(self.runs.get(run_id).map(|r| r.value().clone()))
    }

    async fn save(&self, run: &mut Run) -> Result<(), ChainError> {
        if self.take_injected_failure() {
            return Err(ChainError::Persistence(format!(
                "injected failure saving run '{}'",
                run.id
            )));
        }

        let mut stored = self
            .runs
            .get_mut(&run.id)
            .ok_or_else(|| ChainError::UnknownRun(run.id.to_string()))?;

        if stored.revision != run.revision {
            return Err(ChainError::Conflict {
                run_id: run.id.to_string(),
                expected: run.revision,
                found: stored.revision,
            });
        }

        run.revision += 1;
        *stored = run.clone();
        Ok(())
    }

    async fn list_by_status(&self, status: RunStatus) -> Result<Vec<Run>, ChainError> {
        let mut runs: Vec<Run> = self
            .runs
            .iter()
            .filter(|r| r.status == status)
            .map(|r| r.value().clone())
            .collect();
        runs.sort_by_key(|r| r.created_at);
        Ok(runs)
    }
}
