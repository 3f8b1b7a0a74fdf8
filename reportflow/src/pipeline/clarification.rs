//! Durable suspend/resume for human clarification.
//!
//! Suspension is recorded on the run and persisted by the caller; nothing
//! waits in memory. An answer event or the expiry sweep wakes the run later.
//! Each stage gets one clarification round: after its answer, the stage is
//! re-invoked once and a second request fails the run.

use chrono::{DateTime, Duration, Utc};
use tracing::info;

use crate::core::{ClarificationNeed, ClarificationRecord, Run, RunStatus};
use crate::errors::ChainError;

/// What accepting an answer led to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnswerDecision {
    /// The answer was recorded; the originating stage must be re-invoked.
    Resume {
        /// Index of the stage to re-invoke.
        stage_index: usize,
    },
    /// The deadline had passed; the run is now failed.
    Expired,
}

/// Applies clarification transitions to a run.
#[derive(Debug, Clone, Copy)]
pub struct ClarificationGate {
    timeout: Duration,
}

impl Default for ClarificationGate {
    fn default() -> Self {
        Self::new(Duration::hours(24))
    }
}

impl ClarificationGate {
    /// Creates a gate with the given answer window.
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// The answer window.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Fails fast if `stage` already had its clarification round.
    pub fn ensure_first_round(&self, run: &Run, stage: &str) -> Result<(), ChainError> {
        if run.answered_clarification(stage).is_some() {
            return Err(ChainError::SecondClarification {
                stage: stage.to_string(),
            });
        }
        Ok(())
    }

    /// Records a clarification request and moves the run to `clarifying`.
    pub fn suspend(
        &self,
        run: &mut Run,
        stage_index: usize,
        need: ClarificationNeed,
        now: DateTime<Utc>,
    ) -> Result<(), ChainError> {
        let stage = run
            .stages
            .get(stage_index)
            .cloned()
            .ok_or_else(|| ChainError::Internal(format!("stage index {stage_index} out of range")))?;
        self.ensure_first_round(run, &stage)?;

        run.transition(RunStatus::Clarifying, "request clarification", now)?;
        let expires_at = now + self.timeout;
        run.clarifications.push(ClarificationRecord {
            stage: stage.clone(),
            stage_index,
            question: need.question,
            context: need.context,
            answer_shape: need.answer_shape,
            created_at: now,
            expires_at,
            answer: None,
            answered_at: None,
        });
        run.current_stage = stage_index;
        info!(run_id = %run.id, stage = %stage, %expires_at, "Run suspended for clarification");
        Ok(())
    }

    /// Records an answer for the outstanding request.
    ///
    /// The run stays `clarifying` until the re-invoked stage succeeds. An
    /// answer that does not fit the requested shape leaves the run unchanged.
    pub fn accept_answer(
        &self,
        run: &mut Run,
        answer: &str,
        now: DateTime<Utc>,
    ) -> Result<AnswerDecision, ChainError> {
        if self.expire_if_due(run, now) {
            return Ok(AnswerDecision::Expired);
        }

        let run_id = run.id.to_string();
        let status = run.status;
        let record = run
            .outstanding_clarification_mut()
            .ok_or_else(|| ChainError::InvalidTransition {
                run_id,
                status,
                action: "answer clarification".to_string(),
            })?;

        record.answer_shape.check(answer)?;
        record.answer = Some(answer.trim().to_string());
        record.answered_at = Some(now);
        let stage_index = record.stage_index;
        let stage = record.stage.clone();

        run.current_stage = stage_index;
        run.updated_at = now;
        info!(run_id = %run.id, stage = %stage, "Clarification answered");
        Ok(AnswerDecision::Resume { stage_index })
    }

    /// Fails the run if its outstanding request is past the deadline.
    ///
    /// Returns true if the run was failed.
    pub fn expire_if_due(&self, run: &mut Run, now: DateTime<Utc>) -> bool {
        let Some(record) = run.outstanding_clarification() else {
            return false;
        };
        if !record.is_expired_at(now) {
            return false;
        }
        let stage = record.stage.clone();
        let expired = run.mark_failed(&ChainError::ClarificationTimeout { stage: stage.clone() }, now);
        if expired {
            info!(run_id = %run.id, stage = %stage, "Clarification expired");
        }
        expired
    }
}
