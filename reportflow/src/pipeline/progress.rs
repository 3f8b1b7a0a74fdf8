//! Best-effort progress persistence for the UI.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::core::Run;
use crate::store::RunStore;

/// Persists `{current stage, phase progress, updated at}` around each stage.
///
/// Write failures are logged and swallowed: a stale progress display is
/// acceptable, and terminal state is written elsewhere.
#[derive(Clone)]
pub struct ProgressReporter {
    store: Arc<dyn RunStore>,
    enabled: bool,
}

impl std::fmt::Debug for ProgressReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressReporter")
            .field("enabled", &self.enabled)
            .finish_non_exhaustive()
    }
}

impl ProgressReporter {
    /// Creates a reporter.
    #[must_use]
    pub fn new(store: Arc<dyn RunStore>, enabled: bool) -> Self {
        Self { store, enabled }
    }

    /// Marks a stage as started (progress 0).
    pub async fn stage_started(&self, run: &mut Run, stage_index: usize, now: DateTime<Utc>) {
        self.report(run, stage_index, 0, now).await;
    }

    /// Marks a stage as finished (progress 100).
    pub async fn stage_finished(&self, run: &mut Run, stage_index: usize, now: DateTime<Utc>) {
        self.report(run, stage_index, 100, now).await;
    }

    async fn report(&self, run: &mut Run, stage_index: usize, progress: u8, now: DateTime<Utc>) {
        run.current_stage = stage_index;
        run.current_stage_name = run.stages.get(stage_index).cloned();
        run.phase_progress = progress;
        run.updated_at = now;

        if !self.enabled {
            return;
        }
        match self.store.save(run).await {
            Ok(()) => debug!(
                run_id = %run.id,
                stage = ?run.current_stage_name,
                progress,
                "Progress saved"
            ),
            Err(e) => warn!(
                run_id = %run.id,
                stage = ?run.current_stage_name,
                progress,
                error = %e,
                "Failed to save progress"
            ),
        }
    }
}
