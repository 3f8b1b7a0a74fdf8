//! Checkpoint-aware execution of a single stage.

use std::sync::Arc;
use tracing::{debug, info, warn};

use super::retry::{run_with_antifragile_retry, RetryPolicy};
use crate::checkpoint::{Checkpoint, CheckpointStore, PutOutcome};
use crate::config::GenerationDefaults;
use crate::contracts::StageRecord;
use crate::core::StageOutcome;
use crate::errors::ChainError;
use crate::observability::StageTimer;
use crate::stages::{AttemptContext, Stage, StageInput, StageProduct};
use crate::utils::{fingerprint, Clock};

/// Runs one stage behind its checkpoint and the retry wrapper.
///
/// Stage failures come back as [`StageOutcome`] variants. `Err` is reserved
/// for checkpoint storage failures, which leave the run untouched.
#[derive(Clone)]
pub struct StageExecutor {
    checkpoints: Arc<dyn CheckpointStore>,
    policy: RetryPolicy,
    generation: GenerationDefaults,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for StageExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageExecutor")
            .field("policy", &self.policy)
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

impl StageExecutor {
    /// Creates an executor.
    #[must_use]
    pub fn new(
        checkpoints: Arc<dyn CheckpointStore>,
        policy: RetryPolicy,
        generation: GenerationDefaults,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            checkpoints,
            policy,
            generation,
            clock,
        }
    }

    /// The retry policy in use.
    #[must_use]
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Executes `stage`, or replays its checkpoint if one exists.
    pub async fn run(&self, stage: &dyn Stage, input: &StageInput) -> Result<StageOutcome, ChainError> {
        let name = stage.name();
        let input_fingerprint = fingerprint(&input.to_value());

        if let Some(existing) = self.checkpoints.get(&input.run_id, name).await? {
            if existing.input_fingerprint != input_fingerprint {
                warn!(
                    run_id = %input.run_id,
                    stage = name,
                    "Checkpoint input differs from the current input; replaying the stored record"
                );
            }
            info!(run_id = %input.run_id, stage = name, "Replaying checkpoint");
            return Ok(StageOutcome::Success {
                record: existing.record,
                usage: existing.usage,
                attempts: existing.attempts,
                replayed: true,
            });
        }

        let timer = StageTimer::start(name);
        let temperature = self.generation.temperature;
        let request_timeout = self.generation.request_timeout();
        let result = run_with_antifragile_retry(&self.policy, name, move |attempt| {
            let ctx = AttemptContext::new(attempt.number, attempt.ceiling)
                .with_temperature(temperature)
                .with_request_timeout(request_timeout);
            debug!(
                run_id = %input.run_id,
                stage = name,
                attempt = attempt.number,
                ceiling = attempt.ceiling,
                "Executing stage attempt"
            );
            async move {
                let product = stage.execute(input, &ctx).await?;
                let usage = product.usage();
                Ok((product, usage))
            }
        })
        .await;

        let summary = match result {
            Ok(summary) => summary,
            Err(failure) => {
                if failure.error.is_infrastructure() {
                    return Err(failure.error);
                }
                debug!(
                    run_id = %input.run_id,
                    attributes = ?timer.finish(failure.error.kind().to_string().as_str()),
                    "Stage attempts ended in failure"
                );
                let outcome = if failure.exhausted {
                    StageOutcome::TransientFailure {
                        error: failure.error,
                        usage: failure.usage,
                    }
                } else {
                    StageOutcome::FatalFailure {
                        error: failure.error,
                        usage: failure.usage,
                    }
                };
                return Ok(outcome);
            }
        };

        let outcome = match summary.value {
            StageProduct::Clarification { .. } => "clarification",
            StageProduct::Record { .. } => "record",
        };
        debug!(
            run_id = %input.run_id,
            attempts = summary.attempts,
            attributes = ?timer.finish(outcome),
            "Stage attempts finished"
        );

        match summary.value {
            StageProduct::Clarification { need, .. } => Ok(StageOutcome::NeedsClarification {
                need,
                usage: summary.usage,
            }),
            StageProduct::Record { payload, .. } => {
                let attempted = Checkpoint {
                    run_id: input.run_id.clone(),
                    stage: name.to_string(),
                    record: StageRecord::new(name, stage.schema_version(), payload),
                    usage: summary.usage,
                    attempts: summary.attempts,
                    input_fingerprint,
                    created_at: self.clock.now(),
                };
                let put = self.checkpoints.put_if_absent(attempted.clone()).await?;
                let replayed = matches!(put, PutOutcome::AlreadyPresent(_));
                if replayed {
                    info!(
                        run_id = %input.run_id,
                        stage = name,
                        "Checkpoint was written by another execution; using the stored record"
                    );
                }
                let stored = put.into_stored(attempted);
                Ok(StageOutcome::Success {
                    record: stored.record,
                    usage: stored.usage,
                    attempts: stored.attempts,
                    replayed,
                })
            }
        }
    }
}
