//! Idempotent completion of a run.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{info, warn};

use crate::contracts::{normalize_report, StageRecord};
use crate::core::{Run, RunId, RunStatus, TokenUsage};
use crate::errors::ChainError;
use crate::events::{EventSink, RunEvent, RunEventType};
use crate::store::RunStore;

/// Usage metering for the billed account.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait UsageBilling: Send + Sync {
    /// Adds a finished run's usage to the account.
    async fn record_usage(
        &self,
        account_id: &str,
        run_id: &RunId,
        usage: TokenUsage,
    ) -> Result<(), ChainError>;
}

/// Billing that records nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpBilling;

#[async_trait]
impl UsageBilling for NoOpBilling {
    async fn record_usage(
        &self,
        _account_id: &str,
        _run_id: &RunId,
        _usage: TokenUsage,
    ) -> Result<(), ChainError> {
        Ok(())
    }
}

/// Result of a finalize call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalizeOutcome {
    /// This call committed the completion.
    Committed,
    /// The run was already terminal; nothing was written.
    AlreadyFinal(RunStatus),
}

/// Commits the final artifact exactly once.
#[derive(Clone)]
pub struct CompletionFinalizer {
    store: Arc<dyn RunStore>,
    billing: Arc<dyn UsageBilling>,
    events: Arc<dyn EventSink>,
}

impl std::fmt::Debug for CompletionFinalizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionFinalizer").finish_non_exhaustive()
    }
}

impl CompletionFinalizer {
    /// Creates a finalizer.
    #[must_use]
    pub fn new(
        store: Arc<dyn RunStore>,
        billing: Arc<dyn UsageBilling>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            store,
            billing,
            events,
        }
    }

    /// Writes the artifact and moves the run `processing -> complete`.
    ///
    /// The write is conditioned on the stored revision, so a replayed or
    /// concurrent completion either commits once or fails with a conflict.
    /// Billing and analytics run only after the commit and never fail it.
    pub async fn finalize(
        &self,
        run: &mut Run,
        artifact: &StageRecord,
        now: DateTime<Utc>,
    ) -> Result<FinalizeOutcome, ChainError> {
        if run.status != RunStatus::Processing {
            info!(run_id = %run.id, status = %run.status, "Finalize skipped");
            return Ok(FinalizeOutcome::AlreadyFinal(run.status));
        }

        let mut committed = run.clone();
        committed.final_artifact = Some(artifact.payload.clone());
        committed.title = match normalize_report(&artifact.payload) {
            Ok(report) => report.title,
            Err(e) => {
                warn!(run_id = %run.id, error = %e, "Final artifact is not a recognised report shape");
                None
            }
        };
        committed.phase_progress = 100;
        committed.transition(RunStatus::Complete, "complete", now)?;
        self.store.save(&mut committed).await?;
        *run = committed;

        let usage = run.usage.total();
        info!(
            run_id = %run.id,
            total_tokens = usage.total_tokens,
            title = ?run.title,
            "Run complete"
        );

        if let Err(e) = self.billing.record_usage(&run.account_id, &run.id, usage).await {
            warn!(run_id = %run.id, error = %e, "Failed to record usage for billing");
        }

        let event = RunEvent::new(RunEventType::Completed, run.id.clone(), run.account_id.clone(), now)
            .with_data(serde_json::json!({
                "total_tokens": usage.total_tokens,
                "stages": run.stages.len(),
                "title": run.title,
            }));
        if let Err(e) = self.events.emit(&event).await {
            warn!(run_id = %run.id, error = %e, "Failed to emit completion event");
        }

        Ok(FinalizeOutcome::Committed)
    }
}
