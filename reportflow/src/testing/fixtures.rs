//! An orchestrator wired to in-memory collaborators.

use std::sync::Arc;

use crate::checkpoint::{CheckpointStore, InMemoryCheckpointStore};
use crate::config::OrchestratorConfig;
use crate::core::{Run, RunId, TriggerEvent};
use crate::errors::ChainError;
use crate::events::CollectingEventSink;
use crate::pipeline::{ChainBuilder, ChainRegistry, Orchestrator, UsageBilling};
use crate::stages::Stage;
use crate::store::{InMemoryRunStore, RunStore};
use crate::utils::ManualClock;

/// Chain variant registered by [`TestHarness`].
pub const TEST_VARIANT: &str = "test";

/// An orchestrator over in-memory stores, a manual clock and a collecting
/// event sink, with every collaborator exposed for inspection.
pub struct TestHarness {
    /// The orchestrator under test.
    pub orchestrator: Arc<Orchestrator>,
    /// Run records.
    pub runs: Arc<InMemoryRunStore>,
    /// Checkpoints.
    pub checkpoints: Arc<InMemoryCheckpointStore>,
    /// The clock; advance it to cross clarification deadlines.
    pub clock: Arc<ManualClock>,
    /// Emitted run events.
    pub events: Arc<CollectingEventSink>,
}

impl TestHarness {
    /// Builds a harness with the default configuration.
    pub fn new(stages: Vec<Arc<dyn Stage>>) -> Result<Self, ChainError> {
        Self::with_config(stages, OrchestratorConfig::default())
    }

    /// Builds a harness with a custom configuration.
    pub fn with_config(
        stages: Vec<Arc<dyn Stage>>,
        config: OrchestratorConfig,
    ) -> Result<Self, ChainError> {
        Self::build(stages, config, None)
    }

    /// Builds a harness with a custom billing collaborator.
    pub fn with_billing(
        stages: Vec<Arc<dyn Stage>>,
        config: OrchestratorConfig,
        billing: Arc<dyn UsageBilling>,
    ) -> Result<Self, ChainError> {
        Self::build(stages, config, Some(billing))
    }

    fn build(
        stages: Vec<Arc<dyn Stage>>,
        config: OrchestratorConfig,
        billing: Option<Arc<dyn UsageBilling>>,
    ) -> Result<Self, ChainError> {
        let mut chain = ChainBuilder::new(TEST_VARIANT);
        for stage in stages {
            chain = chain.stage(stage)?;
        }
        let chains = ChainRegistry::new();
        chains.register(chain.build()?)?;

        let runs = Arc::new(InMemoryRunStore::new());
        let checkpoints = Arc::new(InMemoryCheckpointStore::new());
        let clock = Arc::new(ManualClock::default());
        let events = Arc::new(CollectingEventSink::new());

        let mut builder = Orchestrator::builder(Arc::new(chains))
            .with_config(config)
            .with_run_store(runs.clone())
            .with_checkpoint_store(checkpoints.clone())
            .with_clock(clock.clone())
            .with_events(events.clone());
        if let Some(billing) = billing {
            builder = builder.with_billing(billing);
        }

        Ok(Self {
            orchestrator: Arc::new(builder.build()?),
            runs,
            checkpoints,
            clock,
            events,
        })
    }

    /// A trigger for the test chain.
    #[must_use]
    pub fn trigger_event(run_id: &str) -> TriggerEvent {
        TriggerEvent::new(
            run_id,
            TEST_VARIANT,
            serde_json::json!({ "problem": "reduce heat loss through a glazed facade" }),
        )
        .with_account("acct-test")
    }

    /// Triggers a run of the test chain.
    pub async fn trigger(&self, run_id: &str) -> Result<Run, ChainError> {
        self.orchestrator.trigger(Self::trigger_event(run_id)).await
    }

    /// Loads the stored copy of a run.
    pub async fn stored(&self, run_id: &str) -> Result<Run, ChainError> {
        self.runs
            .get(&RunId::new(run_id))
            .await?
            .ok_or_else(|| ChainError::UnknownRun(run_id.to_string()))
    }

    /// Names of the stages checkpointed for a run.
    pub async fn checkpointed_stages(&self, run_id: &str) -> Result<Vec<String>, ChainError> {
        Ok(self
            .checkpoints
            .list_for_run(&RunId::new(run_id))
            .await?
            .into_iter()
            .map(|c| c.stage)
            .collect())
    }
}
