//! Per-run cancellation signals.

use dashmap::DashMap;
use std::sync::Arc;
use tracing::info;

use super::CancellationToken;
use crate::core::RunId;

/// Holds the cancellation token of every run this process knows about.
///
/// Drivers poll [`CancellationListener::is_cancel_requested`] between stages;
/// an in-flight generation call is never interrupted.
#[derive(Debug, Default)]
pub struct CancellationListener {
    tokens: DashMap<RunId, Arc<CancellationToken>>,
}

impl CancellationListener {
    /// Creates a listener with no registered runs.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the token of a run, registering one if needed.
    pub fn token(&self, run_id: &RunId) -> Arc<CancellationToken> {
        self.tokens.entry(run_id.clone()).or_default().clone()
    }

    /// Records a cancel request. Returns true if it was the first for the run.
    pub fn request_cancel(&self, run_id: &RunId, reason: impl Into<String>) -> bool {
        let first = self.token(run_id).cancel(reason);
        if first {
            info!(run_id = %run_id, "Cancellation requested");
        }
        first
    }

    /// Returns true if cancellation was requested for the run.
    #[must_use]
    pub fn is_cancel_requested(&self, run_id: &RunId) -> bool {
        self.tokens
            .get(run_id)
            .is_some_and(|token| token.is_cancelled())
    }

    /// Drops the token of a run that reached a terminal status.
    pub fn clear(&self, run_id: &RunId) {
        self.tokens.remove(run_id);
    }

    /// Number of registered runs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    /// Returns true if no runs are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_and_clear() {
        let listener = CancellationListener::new();
        let run = RunId::new("r1");
        assert!(!listener.is_cancel_requested(&run));

        assert!(listener.request_cancel(&run, "user"));
        assert!(!listener.request_cancel(&run, "again"));
        assert!(listener.is_cancel_requested(&run));
        assert!(!listener.is_cancel_requested(&RunId::new("r2")));

        listener.clear(&run);
        assert!(!listener.is_cancel_requested(&run));
        assert!(listener.is_empty());
    }

    #[test]
    fn test_token_is_shared() {
        let listener = CancellationListener::new();
        let run = RunId::new("r1");
        let token = listener.token(&run);
        listener.request_cancel(&run, "user");
        assert!(token.is_cancelled());
    }
}
