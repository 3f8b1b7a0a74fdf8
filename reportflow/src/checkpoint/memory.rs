//! In-memory checkpoint store.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use super::{Checkpoint, CheckpointStore, PutOutcome};
use crate::core::RunId;
use crate::errors::ChainError;

/// Checkpoint store backed by a concurrent map.
#[derive(Debug, Default)]
pub struct InMemoryCheckpointStore {
    entries: DashMap<(RunId, String), Checkpoint>,
}

impl InMemoryCheckpointStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of checkpoints.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn get(&self, run_id: &RunId, stage: &str) -> Result<Option<Checkpoint>, ChainError> {
        Ok(self
            .entries
            .get(&(run_id.clone(), stage.to_string()))
            .map(|entry| entry.value().clone()))
    }

    async fn put_if_absent(&self, checkpoint: Checkpoint) -> Result<PutOutcome, ChainError> {
        let key = (checkpoint.run_id.clone(), checkpoint.stage.clone());
        match self.entries.entry(key) {
            Entry::Occupied(existing) => Ok(PutOutcome::AlreadyPresent(Box::new(existing.get().clone()))),
            Entry::Vacant(slot) => {
                slot.insert(checkpoint);
                Ok(PutOutcome::Inserted)
            }
        }
    }

    async fn list_for_run(&self, run_id: &RunId) -> Result<Vec<Checkpoint>, ChainError> {
        let mut checkpoints: Vec<Checkpoint> = self
            .entries
            .iter()
            .filter(|entry| &entry.key().0 == run_id)
            .map(|entry| entry.value().clone())
            .collect();
        checkpoints.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.stage.cmp(&b.stage)));
        Ok(checkpoints)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::sample_checkpoint;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_put_is_write_once() {
        let store = InMemoryCheckpointStore::new();
        let first = sample_checkpoint("r1", "intake", serde_json::json!({"v": 1}));
        let second = sample_checkpoint("r1", "intake", serde_json::json!({"v": 2}));

        assert_eq!(store.put_if_absent(first.clone()).await.unwrap(), PutOutcome::Inserted);
        match store.put_if_absent(second).await.unwrap() {
            PutOutcome::AlreadyPresent(existing) => assert_eq!(*existing, first),
            PutOutcome::Inserted => panic!("checkpoint was overwritten"),
        }

        let stored = store.get(&RunId::new("r1"), "intake").await.unwrap().unwrap();
        assert_eq!(stored.record.payload["v"], 1);
    }

    #[tokio::test]
    async fn test_runs_are_isolated() {
        let store = InMemoryCheckpointStore::new();
        store
            .put_if_absent(sample_checkpoint("r1", "intake", serde_json::json!({})))
            .await
            .unwrap();
        store
            .put_if_absent(sample_checkpoint("r2", "intake", serde_json::json!({})))
            .await
            .unwrap();

        assert_eq!(store.list_for_run(&RunId::new("r1")).await.unwrap().len(), 1);
        assert!(store.get(&RunId::new("r3"), "intake").await.unwrap().is_none());
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_puts_store_exactly_one() {
        let store = Arc::new(InMemoryCheckpointStore::new());
        let mut handles = Vec::new();
        for i in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .put_if_absent(sample_checkpoint("r1", "analysis", serde_json::json!({"writer": i})))
                    .await
                    .unwrap()
            }));
        }

        let mut inserted = 0;
        for handle in handles {
            if handle.await.unwrap() == PutOutcome::Inserted {
                inserted += 1;
            }
        }
        assert_eq!(inserted, 1);
        assert_eq!(store.len(), 1);
    }
}
