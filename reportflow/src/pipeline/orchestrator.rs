//! The generic run driver.
//!
//! One driver serves every chain variant: it walks the chain's stages in
//! order, replays checkpoints, enforces the budget at each boundary, and
//! hands suspension, cancellation and completion to their components. All
//! state lives in the run and checkpoint stores, so any process can pick a
//! run up where another left it.

use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, info, info_span, warn, Instrument};

use super::budget::BudgetGuard;
use super::chain::{ChainDefinition, ChainRegistry};
use super::clarification::{AnswerDecision, ClarificationGate};
use super::executor::StageExecutor;
use super::finalizer::{CompletionFinalizer, NoOpBilling, UsageBilling};
use super::progress::ProgressReporter;
use crate::cancellation::{CancellationListener, ExecutionRegistry};
use crate::checkpoint::{CheckpointStore, InMemoryCheckpointStore};
use crate::config::OrchestratorConfig;
use crate::contracts::StageRecord;
use crate::core::{
    CancellationEvent, ClarificationAnswerEvent, Run, RunId, RunStatus, StageOutcome, TriggerEvent,
};
use crate::errors::{ChainError, ChainValidationError};
use crate::events::{EventSink, LoggingEventSink, RunEvent, RunEventType};
use crate::stages::StageInput;
use crate::store::{InMemoryRunStore, RunStore};
use crate::utils::{Clock, SystemClock};

/// Builder for an [`Orchestrator`].
///
/// Every collaborator has an in-process default, so tests only override
/// what they observe.
pub struct OrchestratorBuilder {
    config: OrchestratorConfig,
    chains: Arc<ChainRegistry>,
    runs: Option<Arc<dyn RunStore>>,
    checkpoints: Option<Arc<dyn CheckpointStore>>,
    clock: Option<Arc<dyn Clock>>,
    listener: Option<Arc<CancellationListener>>,
    registry: Option<ExecutionRegistry>,
    events: Option<Arc<dyn EventSink>>,
    billing: Option<Arc<dyn UsageBilling>>,
}

impl OrchestratorBuilder {
    /// Creates a builder over a set of chain variants.
    #[must_use]
    pub fn new(chains: Arc<ChainRegistry>) -> Self {
        Self {
            config: OrchestratorConfig::default(),
            chains,
            runs: None,
            checkpoints: None,
            clock: None,
            listener: None,
            registry: None,
            events: None,
            billing: None,
        }
    }

    /// Sets the configuration.
    #[must_use]
    pub fn with_config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the run store.
    #[must_use]
    pub fn with_run_store(mut self, runs: Arc<dyn RunStore>) -> Self {
        self.runs = Some(runs);
        self
    }

    /// Sets the checkpoint store.
    #[must_use]
    pub fn with_checkpoint_store(mut self, checkpoints: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoints = Some(checkpoints);
        self
    }

    /// Sets the clock.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Shares a cancellation listener.
    #[must_use]
    pub fn with_listener(mut self, listener: Arc<CancellationListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Shares an execution registry.
    #[must_use]
    pub fn with_registry(mut self, registry: ExecutionRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Sets the analytics sink.
    #[must_use]
    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = Some(events);
        self
    }

    /// Sets the billing collaborator.
    #[must_use]
    pub fn with_billing(mut self, billing: Arc<dyn UsageBilling>) -> Self {
        self.billing = Some(billing);
        self
    }

    /// Validates the configuration and builds the orchestrator.
    pub fn build(self) -> Result<Orchestrator, ChainError> {
        self.config.validate()?;
        if self.chains.variants().is_empty() {
            return Err(ChainValidationError::new(
                "ORCH-NO-CHAINS",
                "orchestrator has no chain variants registered",
            )
            .with_fix_hint("Register at least one ChainDefinition before building.")
            .into());
        }

        let runs = self
            .runs
            .unwrap_or_else(|| Arc::new(InMemoryRunStore::new()));
        let checkpoints = self
            .checkpoints
            .unwrap_or_else(|| Arc::new(InMemoryCheckpointStore::new()));
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let events = self
            .events
            .unwrap_or_else(|| Arc::new(LoggingEventSink::default()));
        let billing = self.billing.unwrap_or_else(|| Arc::new(NoOpBilling));

        let executor = StageExecutor::new(
            checkpoints.clone(),
            self.config.retry.clone(),
            self.config.generation.clone(),
            clock.clone(),
        );
        let budget = BudgetGuard::new(self.config.budget_ceiling_tokens);
        let gate = ClarificationGate::new(self.config.clarification_timeout());
        let progress = ProgressReporter::new(runs.clone(), self.config.progress_enabled);
        let finalizer = CompletionFinalizer::new(runs.clone(), billing, events.clone());

        Ok(Orchestrator {
            config: self.config,
            chains: self.chains,
            runs,
            checkpoints,
            clock,
            listener: self.listener.unwrap_or_default(),
            registry: self.registry.unwrap_or_default(),
            events,
            executor,
            budget,
            gate,
            progress,
            finalizer,
        })
    }
}

/// Drives runs through their chain variant.
pub struct Orchestrator {
    config: OrchestratorConfig,
    chains: Arc<ChainRegistry>,
    runs: Arc<dyn RunStore>,
    checkpoints: Arc<dyn CheckpointStore>,
    clock: Arc<dyn Clock>,
    listener: Arc<CancellationListener>,
    registry: ExecutionRegistry,
    events: Arc<dyn EventSink>,
    executor: StageExecutor,
    budget: BudgetGuard,
    gate: ClarificationGate,
    progress: ProgressReporter,
    finalizer: CompletionFinalizer,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("config", &self.config)
            .field("chains", &self.chains.variants())
            .field("active_runs", &self.registry.active())
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// Starts building an orchestrator.
    #[must_use]
    pub fn builder(chains: Arc<ChainRegistry>) -> OrchestratorBuilder {
        OrchestratorBuilder::new(chains)
    }

    /// The configuration in use.
    #[must_use]
    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// The run store.
    #[must_use]
    pub fn runs(&self) -> &Arc<dyn RunStore> {
        &self.runs
    }

    /// The checkpoint store.
    #[must_use]
    pub fn checkpoints(&self) -> &Arc<dyn CheckpointStore> {
        &self.checkpoints
    }

    /// The execution registry counting in-flight drives.
    #[must_use]
    pub fn registry(&self) -> &ExecutionRegistry {
        &self.registry
    }

    /// The cancellation listener.
    #[must_use]
    pub fn listener(&self) -> &Arc<CancellationListener> {
        &self.listener
    }

    /// Loads a run.
    pub async fn get(&self, run_id: &RunId) -> Result<Run, ChainError> {
        self.runs
            .get(run_id)
            .await?
            .ok_or_else(|| ChainError::UnknownRun(run_id.to_string()))
    }

    /// Creates a run from a trigger event and drives it.
    ///
    /// A repeated trigger for an existing run resumes that run instead of
    /// creating a second one.
    pub async fn trigger(&self, event: TriggerEvent) -> Result<Run, ChainError> {
        let chain = self.chains.get(&event.chain_variant)?;
        for attachment in &event.attachments {
            attachment.decode()?;
        }

        let run = Run::from_trigger(&event, chain.stage_names(), self.clock.now());
        if !self.runs.insert(&run).await? {
            info!(run_id = %run.id, "Run already exists, resuming");
            return self.resume(&run.id).await;
        }
        info!(
            run_id = %run.id,
            chain = %run.chain_variant,
            stages = run.stages.len(),
            attachments = run.attachments.len(),
            "Run created"
        );
        self.run(run).await
    }

    /// Re-drives a stored run after a restart or an outer retry.
    ///
    /// Pending and processing runs continue from their first stage without a
    /// checkpoint. A clarifying run continues only once its answer is
    /// recorded. Any other run is returned unchanged.
    pub async fn resume(&self, run_id: &RunId) -> Result<Run, ChainError> {
        let run = self.get(run_id).await?;
        match run.status {
            RunStatus::Pending | RunStatus::Processing => self.run(run).await,
            RunStatus::Clarifying if run.pending_reinvocation().is_some() => self.run(run).await,
            status => {
                debug!(run_id = %run.id, %status, "Nothing to resume");
                Ok(run)
            }
        }
    }

    /// Applies a clarification answer and re-invokes the originating stage.
    pub async fn answer(&self, event: ClarificationAnswerEvent) -> Result<Run, ChainError> {
        let mut run = self.get(&event.run_id).await?;
        if run.pending_reinvocation().is_some() {
            info!(run_id = %run.id, "Clarification already answered, resuming");
            return self.run(run).await;
        }

        let now = self.clock.now();
        let mut answered = run.clone();
        let decision = self.gate.accept_answer(&mut answered, &event.answer, now)?;
        self.runs.save(&mut answered).await?;
        run = answered;

        match decision {
            AnswerDecision::Expired => {
                self.listener.clear(&run.id);
                self.emit_failed(&run, None).await;
                Ok(run)
            }
            AnswerDecision::Resume { stage_index } => {
                let stage = run.stages.get(stage_index).cloned();
                let mut answered_event = RunEvent::new(
                    RunEventType::ClarificationAnswered,
                    run.id.clone(),
                    run.account_id.clone(),
                    now,
                );
                if let Some(stage) = stage {
                    answered_event = answered_event.with_stage(stage);
                }
                self.emit(answered_event).await;
                self.run(run).await
            }
        }
    }

    /// Cancels a run.
    ///
    /// A run with a driver in this process is stopped by that driver at its
    /// next stage boundary. Any other non-terminal run is cancelled at once.
    /// Cancelling a terminal run changes nothing.
    pub async fn cancel(&self, event: CancellationEvent) -> Result<Run, ChainError> {
        let run = self.get(&event.run_id).await?;
        if run.is_terminal() {
            info!(run_id = %run.id, status = %run.status, "Cancel ignored for finished run");
            return Ok(run);
        }

        if self.registry.is_active(&run.id) {
            self.listener.request_cancel(&run.id, "cancellation event");
            return Ok(run);
        }

        let mut cancelled = run;
        cancelled.mark_cancelled(self.clock.now());
        self.runs.save(&mut cancelled).await?;
        self.listener.clear(&cancelled.id);
        info!(run_id = %cancelled.id, "Run cancelled");
        self.emit_cancelled(&cancelled, None).await;
        Ok(cancelled)
    }

    /// Fails every clarifying run whose answer window has closed.
    ///
    /// Returns the ids of the runs that were expired. A run that changed
    /// concurrently is skipped and picked up by the next sweep.
    pub async fn expire_clarifications(&self) -> Result<Vec<RunId>, ChainError> {
        let now = self.clock.now();
        let mut expired = Vec::new();

        for mut run in self.runs.list_by_status(RunStatus::Clarifying).await? {
            if !self.gate.expire_if_due(&mut run, now) {
                continue;
            }
            match self.runs.save(&mut run).await {
                Ok(()) => {
                    self.listener.clear(&run.id);
                    self.emit_failed(&run, None).await;
                    expired.push(run.id);
                }
                Err(e) if e.is_infrastructure() => {
                    warn!(run_id = %run.id, error = %e, "Could not expire clarification, will retry");
                }
                Err(e) => return Err(e),
            }
        }

        if !expired.is_empty() {
            info!(count = expired.len(), "Expired unanswered clarifications");
        }
        Ok(expired)
    }

    /// Drives a loaded run as far as it can go.
    ///
    /// Returns the run as last persisted. `Err` means a storage or
    /// concurrency failure; the stored run is then unchanged by the failed
    /// step and the whole call may be retried.
    pub async fn run(&self, mut run: Run) -> Result<Run, ChainError> {
        let chain = self.chains.get(&run.chain_variant)?;
        let _slot = self.registry.acquire(&run.id)?;
        let span = info_span!("run", run_id = %run.id, chain = %run.chain_variant);

        self.drive(&chain, &mut run).instrument(span).await?;

        if run.is_terminal() {
            self.listener.clear(&run.id);
        }
        Ok(run)
    }

    async fn drive(&self, chain: &ChainDefinition, run: &mut Run) -> Result<(), ChainError> {
        if run.is_terminal() {
            return Ok(());
        }
        if run.status == RunStatus::Clarifying && run.pending_reinvocation().is_none() {
            debug!("Run is waiting for a clarification answer");
            return Ok(());
        }
        if chain.stage_names() != run.stages {
            let err = ChainError::Internal(format!(
                "chain '{}' no longer matches the stages recorded on the run",
                chain.variant()
            ));
            return self.fail(run, err, None).await;
        }

        if run.status == RunStatus::Pending {
            if self.cancel_requested(run) {
                return self.finish_cancelled(run, None).await;
            }
            let mut started = run.clone();
            started.transition(RunStatus::Processing, "start", self.clock.now())?;
            self.runs.save(&mut started).await?;
            *run = started;
            info!("Run started");
        }

        let reinvoked = run.pending_reinvocation().map(|c| c.stage_index);
        let mut previous: BTreeMap<String, StageRecord> = BTreeMap::new();
        let mut last: Option<StageRecord> = None;

        for (index, stage) in chain.stages().iter().enumerate() {
            let name = stage.name();
            if self.cancel_requested(run) {
                return self.finish_cancelled(run, Some(name)).await;
            }

            let already_charged = run.usage.is_checkpoint_charged(name);
            if !already_charged {
                self.progress.stage_started(run, index, self.clock.now()).await;
            }

            let input = StageInput {
                run_id: run.id.clone(),
                chain_variant: run.chain_variant.clone(),
                stage: name.to_string(),
                stage_index: index,
                input: run.input.clone(),
                previous: previous.clone(),
                clarification: run.clarification_exchange(name),
                attachments: run.attachments.clone(),
            };

            match self.executor.run(stage.as_ref(), &input).await? {
                StageOutcome::Success {
                    record,
                    usage,
                    attempts,
                    replayed,
                } => {
                    if let Err(e) = self.budget.check(&mut run.usage, usage, name) {
                        return self.fail(run, e, Some(name)).await;
                    }
                    if run.status == RunStatus::Clarifying && reinvoked == Some(index) {
                        run.transition(
                            RunStatus::Processing,
                            "resume after clarification",
                            self.clock.now(),
                        )?;
                        info!(stage = name, "Re-invoked stage succeeded, run resumed");
                    }
                    if !already_charged {
                        self.progress.stage_finished(run, index, self.clock.now()).await;
                    }
                    info!(
                        stage = name,
                        attempts,
                        replayed,
                        total_tokens = usage.total_tokens,
                        run_tokens = run.usage.total().total_tokens,
                        "Stage complete"
                    );
                    previous.insert(name.to_string(), record.clone());
                    last = Some(record);
                }
                StageOutcome::NeedsClarification { need, usage } => {
                    run.usage.charge_attempts(name, usage);
                    if let Err(e) = self.budget.evaluate(&run.usage, name) {
                        return self.fail(run, e, Some(name)).await;
                    }
                    if self.cancel_requested(run) {
                        return self.finish_cancelled(run, Some(name)).await;
                    }
                    let mut suspended = run.clone();
                    if let Err(e) = self.gate.suspend(&mut suspended, index, need, self.clock.now()) {
                        return self.fail(run, e, Some(name)).await;
                    }
                    self.runs.save(&mut suspended).await?;
                    *run = suspended;

                    let question = run
                        .clarifications
                        .last()
                        .map(|c| c.question.clone())
                        .unwrap_or_default();
                    let event = RunEvent::new(
                        RunEventType::ClarificationRequested,
                        run.id.clone(),
                        run.account_id.clone(),
                        self.clock.now(),
                    )
                    .with_stage(name)
                    .with_data(serde_json::json!({ "question": question }));
                    self.emit(event).await;
                    return Ok(());
                }
                StageOutcome::TransientFailure { error, usage }
                | StageOutcome::FatalFailure { error, usage } => {
                    run.usage.charge_attempts(name, usage);
                    return self.fail(run, error, Some(name)).await;
                }
            }
        }

        if self.cancel_requested(run) {
            return self.finish_cancelled(run, None).await;
        }

        let artifact = last.ok_or_else(|| ChainError::Internal("chain produced no record".into()))?;
        self.finalizer
            .finalize(run, &artifact, self.clock.now())
            .await?;
        Ok(())
    }

    fn cancel_requested(&self, run: &Run) -> bool {
        self.listener.is_cancel_requested(&run.id)
    }

    async fn finish_cancelled(&self, run: &mut Run, next_stage: Option<&str>) -> Result<(), ChainError> {
        let mut cancelled = run.clone();
        if !cancelled.mark_cancelled(self.clock.now()) {
            return Ok(());
        }
        self.runs.save(&mut cancelled).await?;
        *run = cancelled;
        info!(next_stage = ?next_stage, "Run cancelled at stage boundary");
        self.emit_cancelled(run, next_stage).await;
        Ok(())
    }

    async fn fail(&self, run: &mut Run, err: ChainError, stage: Option<&str>) -> Result<(), ChainError> {
        let mut failed = run.clone();
        if !failed.mark_failed(&err, self.clock.now()) {
            return Ok(());
        }
        self.runs.save(&mut failed).await?;
        *run = failed;
        error!(
            stage = ?stage,
            kind = %err.kind(),
            error = %err,
            run_tokens = run.usage.total().total_tokens,
            "Run failed"
        );
        self.emit_failed(run, stage).await;
        Ok(())
    }

    async fn emit_failed(&self, run: &Run, stage: Option<&str>) {
        let mut event = RunEvent::new(
            RunEventType::Failed,
            run.id.clone(),
            run.account_id.clone(),
            self.clock.now(),
        )
        .with_data(serde_json::json!({
            "kind": run.error.as_ref().map(|e| e.kind),
            "message": run.error_message(),
        }));
        if let Some(stage) = stage {
            event = event.with_stage(stage);
        }
        self.emit(event).await;
    }

    async fn emit_cancelled(&self, run: &Run, stage: Option<&str>) {
        let mut event = RunEvent::new(
            RunEventType::Cancelled,
            run.id.clone(),
            run.account_id.clone(),
            self.clock.now(),
        );
        if let Some(stage) = stage {
            event = event.with_stage(stage);
        }
        self.emit(event).await;
    }

    async fn emit(&self, event: RunEvent) {
        if let Err(e) = self.events.emit(&event).await {
            warn!(
                run_id = %event.run_id,
                event = %event.event_type,
                error = %e,
                "Failed to emit run event"
            );
        }
    }
}
