//! Tracking of in-flight run drives.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

use crate::core::RunId;
use crate::errors::ChainError;

#[derive(Debug, Default)]
struct RegistryInner {
    active: DashMap<RunId, ()>,
    idle: Notify,
}

/// Counts the runs being driven in this process.
///
/// Each drive holds an [`ExecutionGuard`]; a second concurrent drive of the
/// same run is rejected. Shutdown code can wait for the count to reach zero.
#[derive(Debug, Clone, Default)]
pub struct ExecutionRegistry {
    inner: Arc<RegistryInner>,
}

impl ExecutionRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks a run as being driven until the guard is dropped.
    pub fn acquire(&self, run_id: &RunId) -> Result<ExecutionGuard, ChainError> {
        match self.inner.active.entry(run_id.clone()) {
            Entry::Occupied(_) => Err(ChainError::AlreadyRunning(run_id.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(());
                Ok(ExecutionGuard {
                    inner: self.inner.clone(),
                    run_id: run_id.clone(),
                })
            }
        }
    }

    /// Number of in-flight drives.
    #[must_use]
    pub fn active(&self) -> usize {
        self.inner.active.len()
    }

    /// Returns true if the run is being driven.
    #[must_use]
    pub fn is_active(&self, run_id: &RunId) -> bool {
        self.inner.active.contains_key(run_id)
    }

    /// Waits until no drive is in flight. Returns false on timeout.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.inner.idle.notified();
            if self.active() == 0 {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.active() == 0;
            }
        }
    }
}

/// Releases a run's slot in the registry on drop.
#[derive(Debug)]
pub struct ExecutionGuard {
    inner: Arc<RegistryInner>,
    run_id: RunId,
}

impl ExecutionGuard {
    /// The guarded run.
    #[must_use]
    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }
}

impl Drop for ExecutionGuard {
    fn drop(&mut self) {
        self.inner.active.remove(&self.run_id);
        if self.inner.active.is_empty() {
            self.inner.idle.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_acquire_is_rejected() {
        let registry = ExecutionRegistry::new();
        let run = RunId::new("r1");

        let guard = registry.acquire(&run).unwrap();
        assert_eq!(registry.active(), 1);
        assert!(matches!(registry.acquire(&run), Err(ChainError::AlreadyRunning(_))));

        drop(guard);
        assert_eq!(registry.active(), 0);
        assert!(registry.acquire(&run).is_ok());
    }

    #[tokio::test]
    async fn test_wait_idle_returns_when_guards_drop() {
        let registry = ExecutionRegistry::new();
        let guard = registry.acquire(&RunId::new("r1")).unwrap();

        let waiter = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.wait_idle(Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(guard);

        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn test_wait_idle_times_out() {
        let registry = ExecutionRegistry::new();
        let _guard = registry.acquire(&RunId::new("r1")).unwrap();
        assert!(!registry.wait_idle(Duration::from_millis(20)).await);
    }

    #[test]
    fn test_wait_idle_with_no_drives() {
        let registry = ExecutionRegistry::new();
        assert!(tokio_test::block_on(registry.wait_idle(Duration::from_millis(10))));
    }

    #[test]
    fn test_registries_are_independent() {
        let a = ExecutionRegistry::new();
        let b = ExecutionRegistry::new();
        let _guard = a.acquire(&RunId::new("r1")).unwrap();
        assert_eq!(b.active(), 0);
    }
}
