//! End-to-end runs through the orchestrator.

use async_trait::async_trait;
use chrono::Duration;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use std::sync::Arc;
use tokio::sync::Notify;

use super::finalizer::MockUsageBilling;
use super::{ChainBuilder, ChainRegistry, Orchestrator};
use crate::checkpoint::{CheckpointStore, FileCheckpointStore, InMemoryCheckpointStore};
use crate::config::OrchestratorConfig;
use crate::core::{
    Attachment, CancellationEvent, ClarificationAnswerEvent, ClarificationExchange,
    ClarificationNeed, RunId, RunStatus, TokenUsage,
};
use crate::errors::{
    ChainError, ErrorKind, CLARIFICATION_EXPIRED_MESSAGE, SECOND_CLARIFICATION_MESSAGE,
};
use crate::events::RunEventType;
use crate::generation::JsonRecordValidator;
use crate::stages::{AttemptContext, GenerativeStage, Stage, StageInput, StageProduct};
use crate::store::{InMemoryRunStore, RunStore};
use crate::testing::{
    assert_run_complete, assert_run_failed, assert_run_status, assert_stage_usage,
    ScriptedGenerator, ScriptedStage, TestHarness,
};

/// Parks inside `execute` until released.
#[derive(Debug)]
struct BlockingStage {
    name: String,
    started: Notify,
    release: Notify,
    product: StageProduct,
}

impl BlockingStage {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            started: Notify::new(),
            release: Notify::new(),
            product: StageProduct::record(serde_json::json!({ "stage": name })),
        }
    }

    fn asking(name: &str, need: ClarificationNeed) -> Self {
        Self {
            product: StageProduct::clarification(need),
            ..Self::new(name)
        }
    }
}

#[async_trait]
impl Stage for BlockingStage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(
        &self,
        _input: &StageInput,
        _attempt: &AttemptContext,
    ) -> Result<StageProduct, ChainError> {
        self.started.notify_one();
        self.release.notified().await;
        Ok(self.product.clone())
    }
}

/// Asks once, then records; notes the stored run status on every call.
#[derive(Debug)]
struct StatusRecorder {
    name: String,
    runs: Mutex<Option<Arc<InMemoryRunStore>>>,
    seen: Mutex<Vec<RunStatus>>,
}

impl StatusRecorder {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            runs: Mutex::new(None),
            seen: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl Stage for StatusRecorder {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(
        &self,
        input: &StageInput,
        _attempt: &AttemptContext,
    ) -> Result<StageProduct, ChainError> {
        let store = self
            .runs
            .lock()
            .clone()
            .ok_or_else(|| ChainError::Internal("run store not attached".into()))?;
        let stored = store
            .get(&input.run_id)
            .await?
            .ok_or_else(|| ChainError::UnknownRun(input.run_id.to_string()))?;
        let first_call = {
            let mut seen = self.seen.lock();
            seen.push(stored.status);
            seen.len() == 1
        };
        if first_call {
            return Ok(StageProduct::clarification(ClarificationNeed::question(
                "Which floor is affected?",
            )));
        }
        Ok(StageProduct::record(serde_json::json!({ "stage": self.name })))
    }
}

/// Records which checkpoints exist at the moment it starts.
#[derive(Debug)]
struct CheckpointProbe {
    name: String,
    store: Arc<InMemoryCheckpointStore>,
    seen: Mutex<Vec<String>>,
}

impl CheckpointProbe {
    fn new(name: &str, store: Arc<InMemoryCheckpointStore>) -> Self {
        Self {
            name: name.to_string(),
            store,
            seen: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl Stage for CheckpointProbe {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(
        &self,
        input: &StageInput,
        _attempt: &AttemptContext,
    ) -> Result<StageProduct, ChainError> {
        let mut stages: Vec<String> = self
            .store
            .list_for_run(&input.run_id)
            .await?
            .into_iter()
            .map(|c| c.stage)
            .collect();
        stages.sort();
        *self.seen.lock() = stages;
        Ok(StageProduct::record(serde_json::json!({ "stage": self.name })))
    }
}

#[tokio::test]
async fn test_truncated_stage_escalates_and_sums_usage() {
    let intake = Arc::new(ScriptedStage::new("intake").with_usage(TokenUsage::new(10, 10)));
    let analysis = Arc::new(
        ScriptedStage::new("analysis")
            .then_truncated(TokenUsage::new(100, 8192))
            .then_truncated(TokenUsage::new(100, 16384))
            .then_record(
                serde_json::json!({"options": ["triple glazing", "shading"]}),
                TokenUsage::new(100, 20000),
            ),
    );
    let report = Arc::new(ScriptedStage::new("report"));
    let harness = TestHarness::new(vec![intake.clone(), analysis.clone(), report.clone()]).unwrap();

    let run = harness.trigger("r1").await.unwrap();

    assert_run_complete(&run);
    assert_eq!(analysis.ceilings(), vec![8192, 16384, 32768]);
    assert_stage_usage(&run, "analysis", TokenUsage::new(300, 44576));
    assert_eq!(run.usage.total(), TokenUsage::new(310, 44586));
    assert_eq!(report.call_count(), 1);
    assert_eq!(harness.stored("r1").await.unwrap(), run);
}

#[tokio::test]
async fn test_stage_never_starts_before_previous_checkpoint() {
    let store = Arc::new(InMemoryCheckpointStore::new());
    let first = Arc::new(CheckpointProbe::new("first", store.clone()));
    let second = Arc::new(CheckpointProbe::new("second", store.clone()));
    let third = Arc::new(CheckpointProbe::new("third", store.clone()));

    let chains = ChainRegistry::new();
    chains
        .register(
            ChainBuilder::new("probe")
                .stage(first.clone())
                .unwrap()
                .stage(second.clone())
                .unwrap()
                .stage(third.clone())
                .unwrap()
                .build()
                .unwrap(),
        )
        .unwrap();
    let orchestrator = Orchestrator::builder(Arc::new(chains))
        .with_checkpoint_store(store.clone())
        .build()
        .unwrap();

    let trigger = crate::core::TriggerEvent::new("r1", "probe", serde_json::json!({}));
    let run = orchestrator.trigger(trigger).await.unwrap();

    assert_run_complete(&run);
    assert!(first.seen.lock().is_empty());
    assert_eq!(*second.seen.lock(), vec!["first"]);
    assert_eq!(*third.seen.lock(), vec!["first", "second"]);
}

#[tokio::test]
async fn test_later_stages_see_every_earlier_record() {
    let intake = Arc::new(
        ScriptedStage::new("intake").then_record(serde_json::json!({"summary": "facade"}), TokenUsage::default()),
    );
    let analysis = Arc::new(
        ScriptedStage::new("analysis").then_record(serde_json::json!({"options": 3}), TokenUsage::default()),
    );
    let report = Arc::new(ScriptedStage::new("report"));
    let harness = TestHarness::new(vec![intake, analysis, report.clone()]).unwrap();

    harness.trigger("r1").await.unwrap();

    let input = &report.inputs()[0];
    assert_eq!(input.stage_index, 2);
    assert_eq!(input.previous("intake").unwrap().payload["summary"], "facade");
    assert_eq!(input.previous("analysis").unwrap().payload["options"], 3);
    assert!(input.clarification.is_none());
}

#[tokio::test]
async fn test_resume_replays_checkpoints_without_calling_stages() {
    let intake = Arc::new(ScriptedStage::new("intake").with_usage(TokenUsage::new(10, 10)));
    let analysis = Arc::new(ScriptedStage::new("analysis").with_usage(TokenUsage::new(10, 10)));
    let report = Arc::new(
        ScriptedStage::new("report")
            .with_usage(TokenUsage::new(10, 10))
            .then_error(ChainError::Persistence("disk full".into())),
    );
    let harness = TestHarness::new(vec![intake.clone(), analysis.clone(), report.clone()]).unwrap();

    let err = harness.trigger("r1").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Persistence);
    let stored = harness.stored("r1").await.unwrap();
    assert_run_status(&stored, RunStatus::Processing);
    let mut checkpointed = harness.checkpointed_stages("r1").await.unwrap();
    checkpointed.sort();
    assert_eq!(checkpointed, vec!["analysis", "intake"]);

    let run = harness.orchestrator.resume(&RunId::new("r1")).await.unwrap();

    assert_run_complete(&run);
    assert_eq!(intake.call_count(), 1);
    assert_eq!(analysis.call_count(), 1);
    assert_eq!(report.call_count(), 2);
    assert_eq!(run.usage.total(), TokenUsage::new(30, 30));
    assert_stage_usage(&run, "intake", TokenUsage::new(10, 10));
}

#[tokio::test]
async fn test_resume_after_restart_with_file_checkpoints() {
    let dir = tempfile::tempdir().unwrap();
    let runs = Arc::new(InMemoryRunStore::new());

    let build = |intake: Arc<ScriptedStage>, report: Arc<ScriptedStage>| {
        let chains = ChainRegistry::new();
        chains
            .register(
                ChainBuilder::new("standard")
                    .stage(intake)
                    .unwrap()
                    .stage(report)
                    .unwrap()
                    .build()
                    .unwrap(),
            )
            .unwrap();
        Orchestrator::builder(Arc::new(chains))
            .with_run_store(runs.clone())
            .with_checkpoint_store(Arc::new(FileCheckpointStore::new(dir.path())))
            .build()
            .unwrap()
    };

    let first_intake = Arc::new(ScriptedStage::new("intake"));
    let first_report =
        Arc::new(ScriptedStage::new("report").then_error(ChainError::Persistence("process killed".into())));
    let first = build(first_intake.clone(), first_report);
    let trigger = crate::core::TriggerEvent::new("r1", "standard", serde_json::json!({"problem": "x"}));
    assert!(first.trigger(trigger).await.is_err());
    assert_eq!(first_intake.call_count(), 1);
    drop(first);

    let second_intake = Arc::new(ScriptedStage::new("intake"));
    let second_report = Arc::new(ScriptedStage::new("report"));
    let second = build(second_intake.clone(), second_report.clone());
    let run = second.resume(&RunId::new("r1")).await.unwrap();

    assert_run_complete(&run);
    assert_eq!(second_intake.call_count(), 0);
    assert_eq!(second_report.call_count(), 1);
}

#[tokio::test]
async fn test_budget_exceeded_after_first_stage() {
    let intake = Arc::new(
        ScriptedStage::new("intake").then_record(serde_json::json!({"summary": "big"}), TokenUsage::new(100, 50)),
    );
    let analysis = Arc::new(ScriptedStage::new("analysis"));
    let harness = TestHarness::with_config(
        vec![intake, analysis.clone()],
        OrchestratorConfig::default().with_budget_ceiling(100),
    )
    .unwrap();

    let run = harness.trigger("r1").await.unwrap();

    assert_run_failed(&run, ErrorKind::BudgetExceeded);
    let message = run.error_message().unwrap();
    assert!(message.contains("intake"), "{message}");
    assert!(message.contains("150"), "{message}");
    assert!(message.contains("100"), "{message}");
    assert_eq!(analysis.call_count(), 0);
    assert_eq!(harness.checkpointed_stages("r1").await.unwrap(), vec!["intake"]);

    let failed = harness.events.events_of_type(RunEventType::Failed);
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].stage.as_deref(), Some("intake"));
    assert!(harness.events.events_of_type(RunEventType::Completed).is_empty());
}

#[tokio::test]
async fn test_clarification_answered_then_completes() {
    let question = "Is the facade south-facing?";
    let intake = Arc::new(
        ScriptedStage::new("intake")
            .then_clarification(ClarificationNeed::question(question), TokenUsage::new(5, 5))
            .with_usage(TokenUsage::new(10, 10)),
    );
    let analysis = Arc::new(ScriptedStage::new("analysis"));
    let harness = TestHarness::new(vec![intake.clone(), analysis.clone()]).unwrap();

    let suspended = harness.trigger("r1").await.unwrap();
    assert_run_status(&suspended, RunStatus::Clarifying);
    assert_eq!(suspended.clarifications.len(), 1);
    assert_eq!(analysis.call_count(), 0);
    assert_eq!(harness.orchestrator.registry().active(), 0);

    harness.clock.advance(Duration::hours(23));
    let run = harness
        .orchestrator
        .answer(ClarificationAnswerEvent::new("r1", "Yes, south-facing"))
        .await
        .unwrap();

    assert_run_complete(&run);
    assert_eq!(run.clarifications.len(), 1);
    assert_eq!(run.clarifications[0].question, question);
    assert_eq!(run.clarifications[0].answer.as_deref(), Some("Yes, south-facing"));
    assert!(run.clarifications[0].answered_at.is_some());

    assert_eq!(intake.call_count(), 2);
    assert_eq!(
        intake.inputs()[1].clarification,
        Some(ClarificationExchange {
            question: question.to_string(),
            answer: "Yes, south-facing".to_string(),
        })
    );
    assert_stage_usage(&run, "intake", TokenUsage::new(15, 15));
    assert_eq!(analysis.call_count(), 1);

    assert_eq!(harness.events.events_of_type(RunEventType::ClarificationRequested).len(), 1);
    assert_eq!(harness.events.events_of_type(RunEventType::ClarificationAnswered).len(), 1);
    assert_eq!(harness.events.events_of_type(RunEventType::Completed).len(), 1);
}

#[tokio::test]
async fn test_second_clarification_fails_with_fixed_message() {
    let intake = Arc::new(
        ScriptedStage::new("intake")
            .then_clarification(ClarificationNeed::question("Budget?"), TokenUsage::default())
            .then_clarification(ClarificationNeed::question("Budget, exactly?"), TokenUsage::default()),
    );
    let analysis = Arc::new(ScriptedStage::new("analysis"));
    let harness = TestHarness::new(vec![intake.clone(), analysis.clone()]).unwrap();

    harness.trigger("r1").await.unwrap();
    let run = harness
        .orchestrator
        .answer(ClarificationAnswerEvent::new("r1", "about 10k"))
        .await
        .unwrap();

    assert_run_failed(&run, ErrorKind::SecondClarification);
    assert_eq!(run.error_message(), Some(SECOND_CLARIFICATION_MESSAGE));
    assert_eq!(run.clarifications.len(), 1);
    assert_eq!(intake.call_count(), 2);
    assert_eq!(analysis.call_count(), 0);
}

#[tokio::test]
async fn test_unanswered_clarification_expires() {
    let intake = Arc::new(
        ScriptedStage::new("intake")
            .then_clarification(ClarificationNeed::question("Indoor?"), TokenUsage::default()),
    );
    let harness = TestHarness::new(vec![intake.clone()]).unwrap();
    harness.trigger("r1").await.unwrap();

    harness.clock.advance(Duration::hours(23));
    assert!(harness.orchestrator.expire_clarifications().await.unwrap().is_empty());
    assert_run_status(&harness.stored("r1").await.unwrap(), RunStatus::Clarifying);

    harness.clock.advance(Duration::hours(1) + Duration::seconds(1));
    let expired = harness.orchestrator.expire_clarifications().await.unwrap();
    assert_eq!(expired, vec![RunId::new("r1")]);

    let run = harness.stored("r1").await.unwrap();
    assert_run_failed(&run, ErrorKind::ClarificationTimeout);
    assert_eq!(run.error_message(), Some(CLARIFICATION_EXPIRED_MESSAGE));
    assert_eq!(intake.call_count(), 1);
    assert!(harness.orchestrator.expire_clarifications().await.unwrap().is_empty());
    assert_eq!(harness.events.events_of_type(RunEventType::Failed).len(), 1);
}

#[tokio::test]
async fn test_late_answer_fails_run_instead_of_resuming() {
    let intake = Arc::new(
        ScriptedStage::new("intake")
            .then_clarification(ClarificationNeed::question("Indoor?"), TokenUsage::default()),
    );
    let harness = TestHarness::new(vec![intake.clone()]).unwrap();
    harness.trigger("r1").await.unwrap();

    harness.clock.advance(Duration::hours(25));
    let run = harness
        .orchestrator
        .answer(ClarificationAnswerEvent::new("r1", "indoor"))
        .await
        .unwrap();

    assert_run_failed(&run, ErrorKind::ClarificationTimeout);
    assert_eq!(intake.call_count(), 1);
    assert_eq!(harness.stored("r1").await.unwrap(), run);
}

#[tokio::test]
async fn test_answer_outside_allowed_options_is_rejected() {
    let need = ClarificationNeed::question("Where is it installed?")
        .with_options(vec!["indoor".into(), "outdoor".into()]);
    let intake = Arc::new(ScriptedStage::new("intake").then_clarification(need, TokenUsage::default()));
    let harness = TestHarness::new(vec![intake.clone()]).unwrap();
    harness.trigger("r1").await.unwrap();

    let err = harness
        .orchestrator
        .answer(ClarificationAnswerEvent::new("r1", "underwater"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidAnswer);
    let stored = harness.stored("r1").await.unwrap();
    assert!(stored.outstanding_clarification().is_some());

    let run = harness
        .orchestrator
        .answer(ClarificationAnswerEvent::new("r1", "outdoor"))
        .await
        .unwrap();
    assert_run_complete(&run);
}

#[tokio::test]
async fn test_cancel_between_stages_stops_the_chain() {
    let intake = Arc::new(BlockingStage::new("intake"));
    let analysis = Arc::new(ScriptedStage::new("analysis"));
    let harness = TestHarness::new(vec![intake.clone(), analysis.clone()]).unwrap();

    let orchestrator = harness.orchestrator.clone();
    let handle = tokio::spawn(async move { orchestrator.trigger(TestHarness::trigger_event("r1")).await });

    intake.started.notified().await;
    let during = harness
        .orchestrator
        .cancel(CancellationEvent::new("r1"))
        .await
        .unwrap();
    assert_run_status(&during, RunStatus::Processing);
    intake.release.notify_one();

    let run = handle.await.unwrap().unwrap();
    assert_run_status(&run, RunStatus::Cancelled);
    assert_eq!(analysis.call_count(), 0);
    assert_eq!(harness.checkpointed_stages("r1").await.unwrap(), vec!["intake"]);
    assert_eq!(harness.stored("r1").await.unwrap().status, RunStatus::Cancelled);
    assert_eq!(harness.events.events_of_type(RunEventType::Cancelled).len(), 1);
    assert!(harness.orchestrator.listener().is_empty());
}

#[tokio::test]
async fn test_cancel_after_complete_is_noop() {
    let harness = TestHarness::new(vec![Arc::new(ScriptedStage::new("report"))]).unwrap();
    let run = harness.trigger("r1").await.unwrap();
    assert_run_complete(&run);

    let after = harness
        .orchestrator
        .cancel(CancellationEvent::new("r1"))
        .await
        .unwrap();

    assert_eq!(after, run);
    let stored = harness.stored("r1").await.unwrap();
    assert_eq!(stored.status, RunStatus::Complete);
    assert_eq!(stored.final_artifact, run.final_artifact);
    assert_eq!(stored.revision, run.revision);
    assert!(harness.events.events_of_type(RunEventType::Cancelled).is_empty());
}

#[tokio::test]
async fn test_cancel_while_clarifying_is_immediate() {
    let intake = Arc::new(
        ScriptedStage::new("intake")
            .then_clarification(ClarificationNeed::question("Indoor?"), TokenUsage::default()),
    );
    let harness = TestHarness::new(vec![intake.clone()]).unwrap();
    harness.trigger("r1").await.unwrap();

    let run = harness
        .orchestrator
        .cancel(CancellationEvent::new("r1"))
        .await
        .unwrap();
    assert_run_status(&run, RunStatus::Cancelled);

    let err = harness
        .orchestrator
        .answer(ClarificationAnswerEvent::new("r1", "yes"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidTransition);

    let resumed = harness.orchestrator.resume(&RunId::new("r1")).await.unwrap();
    assert_run_status(&resumed, RunStatus::Cancelled);
    assert_eq!(intake.call_count(), 1);
}

#[tokio::test]
async fn test_refusal_fails_immediately_with_its_message() {
    let refusal = "I can't assist with that request.";
    let analysis = Arc::new(
        ScriptedStage::new("analysis").then_error(ChainError::refusal(refusal).with_usage(TokenUsage::new(7, 3))),
    );
    let report = Arc::new(ScriptedStage::new("report"));
    let harness = TestHarness::new(vec![
        Arc::new(ScriptedStage::new("intake")),
        analysis.clone(),
        report.clone(),
    ])
    .unwrap();

    let run = harness.trigger("r1").await.unwrap();

    assert_run_failed(&run, ErrorKind::ContentRefusal);
    assert_eq!(run.error_message(), Some(refusal));
    assert_eq!(analysis.call_count(), 1);
    assert_eq!(report.call_count(), 0);
    assert_stage_usage(&run, "analysis", TokenUsage::new(7, 3));
}

#[tokio::test]
async fn test_validation_failure_is_not_retried() {
    let intake = Arc::new(
        ScriptedStage::new("intake").then_error(ChainError::validation("missing required fields: summary")),
    );
    let harness = TestHarness::new(vec![intake.clone()]).unwrap();

    let run = harness.trigger("r1").await.unwrap();

    assert_run_failed(&run, ErrorKind::Validation);
    assert_eq!(intake.call_count(), 1);
    assert!(harness.checkpointed_stages("r1").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_exhausted_retries_fail_the_run() {
    let intake = Arc::new(
        ScriptedStage::new("intake")
            .then_truncated(TokenUsage::new(1, 8192))
            .then_truncated(TokenUsage::new(1, 16384))
            .then_truncated(TokenUsage::new(1, 32768)),
    );
    let harness = TestHarness::new(vec![intake.clone()]).unwrap();

    let run = harness.trigger("r1").await.unwrap();

    assert_run_failed(&run, ErrorKind::TransientStructural);
    assert_eq!(intake.call_count(), 3);
    assert_stage_usage(&run, "intake", TokenUsage::new(3, 57344));
}

#[tokio::test]
async fn test_persistence_failure_at_start_leaves_run_pending() {
    let intake = Arc::new(ScriptedStage::new("intake"));
    let harness = TestHarness::new(vec![intake.clone()]).unwrap();
    harness.runs.fail_next_saves(1);

    let err = harness.trigger("r1").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Persistence);
    assert_run_status(&harness.stored("r1").await.unwrap(), RunStatus::Pending);
    assert_eq!(intake.call_count(), 0);

    let run = harness.orchestrator.resume(&RunId::new("r1")).await.unwrap();
    assert_run_complete(&run);
}

#[tokio::test]
async fn test_concurrent_drive_of_same_run_is_rejected() {
    let intake = Arc::new(BlockingStage::new("intake"));
    let harness = TestHarness::new(vec![intake.clone()]).unwrap();

    let orchestrator = harness.orchestrator.clone();
    let handle = tokio::spawn(async move { orchestrator.trigger(TestHarness::trigger_event("r1")).await });
    intake.started.notified().await;

    let err = harness.orchestrator.resume(&RunId::new("r1")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AlreadyRunning);

    intake.release.notify_one();
    assert_run_complete(&handle.await.unwrap().unwrap());
    assert!(harness
        .orchestrator
        .registry()
        .wait_idle(std::time::Duration::from_secs(1))
        .await);
}

#[tokio::test]
async fn test_independent_runs_execute_concurrently() {
    let harness = TestHarness::new(vec![
        Arc::new(ScriptedStage::new("intake").with_usage(TokenUsage::new(1, 1))),
        Arc::new(ScriptedStage::new("report").with_usage(TokenUsage::new(2, 2))),
    ])
    .unwrap();

    let ids: Vec<String> = (0..8).map(|i| format!("run-{i}")).collect();
    let runs = futures::future::join_all(ids.iter().map(|id| harness.trigger(id))).await;

    for run in runs {
        let run = run.unwrap();
        assert_run_complete(&run);
        assert_eq!(run.usage.total(), TokenUsage::new(3, 3));
    }
    assert_eq!(harness.checkpoints.len(), 16);
    assert_eq!(harness.orchestrator.registry().active(), 0);
}

#[tokio::test]
async fn test_generative_chain_end_to_end() {
    let intake_service = Arc::new(ScriptedGenerator::new().then_complete(
        "```json\n{\"summary\": \"Reduce heat loss through the glazing\"}\n```",
        TokenUsage::new(120, 40),
    ));
    let report_service = Arc::new(
        ScriptedGenerator::new()
            .then_truncated("{\"quick_reference\": {\"title\": \"Glaz", TokenUsage::new(300, 8192))
            .then_complete(
                r#"{"quick_reference": {"title": "Glazing retrofit options", "one_liner": "Add secondary glazing."},
                    "prose_report": "Secondary glazing halves the loss."}"#,
                TokenUsage::new(300, 900),
            ),
    );

    let intake = Arc::new(GenerativeStage::new(
        "intake",
        "Summarise the engineering problem as JSON.",
        intake_service.clone(),
        Arc::new(JsonRecordValidator::new().require(&["summary"]).allow_clarification()),
    ));
    let report = Arc::new(
        GenerativeStage::new(
            "report",
            "Write the final report as JSON.",
            report_service.clone(),
            Arc::new(JsonRecordValidator::new().require(&["quick_reference", "prose_report"])),
        )
        .with_schema_version(2),
    );
    let harness = TestHarness::new(vec![intake, report]).unwrap();

    let trigger = TestHarness::trigger_event("r1").with_attachment(Attachment {
        name: "elevation.txt".into(),
        media_type: "text/plain".into(),
        data: "aGVsbG8=".into(),
    });
    let run = harness.orchestrator.trigger(trigger).await.unwrap();

    assert_run_complete(&run);
    assert_eq!(run.title.as_deref(), Some("Glazing retrofit options"));
    assert_stage_usage(&run, "report", TokenUsage::new(600, 9092));

    let requests = report_service.requests();
    assert_eq!(
        requests.iter().map(|r| r.max_output_tokens).collect::<Vec<_>>(),
        vec![8192, 16384]
    );
    assert!(requests[1].message.contains("Reduce heat loss through the glazing"));
    assert_eq!(requests[1].attachments.len(), 1);
    assert_eq!(intake_service.call_count(), 1);

    let checkpoint = harness
        .checkpoints
        .get(&RunId::new("r1"), "report")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(checkpoint.record.schema_version, 2);
    assert_eq!(checkpoint.attempts, 2);
}

#[tokio::test]
async fn test_completion_bills_account_once() {
    let mut billing = MockUsageBilling::new();
    billing
        .expect_record_usage()
        .withf(|account, run_id, usage| {
            account == "acct-test" && run_id.as_str() == "r1" && usage.total_tokens == 40
        })
        .times(1)
        .returning(|_, _, _| Ok(()));

    let harness = TestHarness::with_billing(
        vec![Arc::new(ScriptedStage::new("report").with_usage(TokenUsage::new(30, 10)))],
        OrchestratorConfig::default(),
        Arc::new(billing),
    )
    .unwrap();

    let run = harness.trigger("r1").await.unwrap();
    assert_run_complete(&run);
    let again = harness.orchestrator.resume(&RunId::new("r1")).await.unwrap();
    assert_eq!(again, run);
}

#[tokio::test]
async fn test_progress_disabled_still_completes() {
    let harness = TestHarness::with_config(
        vec![
            Arc::new(ScriptedStage::new("intake")),
            Arc::new(ScriptedStage::new("report")),
        ],
        OrchestratorConfig::default().with_progress(false),
    )
    .unwrap();

    let run = harness.trigger("r1").await.unwrap();

    assert_run_complete(&run);
    assert_eq!(run.revision, 2);
    assert_eq!(run.phase_progress, 100);
}

#[tokio::test]
async fn test_clarification_from_later_stage_resumes_only_after_reinvocation() {
    let intake = Arc::new(ScriptedStage::new("intake"));
    let analysis = Arc::new(StatusRecorder::new("analysis"));
    let report = Arc::new(ScriptedStage::new("report"));
    let harness = TestHarness::new(vec![intake.clone(), analysis.clone(), report.clone()]).unwrap();
    *analysis.runs.lock() = Some(harness.runs.clone());

    let suspended = harness.trigger("r1").await.unwrap();
    assert_run_status(&suspended, RunStatus::Clarifying);
    assert_eq!(suspended.clarifications[0].stage_index, 1);
    assert_eq!(report.call_count(), 0);

    let run = harness
        .orchestrator
        .answer(ClarificationAnswerEvent::new("r1", "second floor"))
        .await
        .unwrap();

    assert_run_complete(&run);
    assert_eq!(
        *analysis.seen.lock(),
        vec![RunStatus::Processing, RunStatus::Clarifying]
    );
    assert_eq!(intake.call_count(), 1);
    assert_eq!(report.call_count(), 1);
    assert_eq!(
        harness.checkpointed_stages("r1").await.unwrap(),
        vec!["intake", "analysis", "report"]
    );
}

#[tokio::test]
async fn test_cancel_during_stage_that_then_asks_for_clarification() {
    let intake = Arc::new(BlockingStage::asking(
        "intake",
        ClarificationNeed::question("Indoor?"),
    ));
    let analysis = Arc::new(ScriptedStage::new("analysis"));
    let harness = TestHarness::new(vec![intake.clone(), analysis.clone()]).unwrap();

    let orchestrator = harness.orchestrator.clone();
    let handle = tokio::spawn(async move { orchestrator.trigger(TestHarness::trigger_event("r1")).await });

    intake.started.notified().await;
    let during = harness
        .orchestrator
        .cancel(CancellationEvent::new("r1"))
        .await
        .unwrap();
    assert_run_status(&during, RunStatus::Processing);
    intake.release.notify_one();

    let run = handle.await.unwrap().unwrap();
    assert_run_status(&run, RunStatus::Cancelled);
    assert!(run.clarifications.is_empty());
    assert_eq!(harness.stored("r1").await.unwrap().status, RunStatus::Cancelled);
    assert!(harness.orchestrator.listener().is_empty());
    assert_eq!(analysis.call_count(), 0);

    harness.clock.advance(Duration::hours(25));
    assert!(harness.orchestrator.expire_clarifications().await.unwrap().is_empty());
    assert_eq!(harness.events.events_of_type(RunEventType::Cancelled).len(), 1);
    assert!(harness.events.events_of_type(RunEventType::ClarificationRequested).is_empty());
}

#[tokio::test]
async fn test_clarification_over_budget_fails_instead_of_suspending() {
    let intake = Arc::new(
        ScriptedStage::new("intake")
            .then_clarification(ClarificationNeed::question("Indoor?"), TokenUsage::new(80, 40)),
    );
    let harness = TestHarness::with_config(
        vec![intake.clone()],
        OrchestratorConfig::default().with_budget_ceiling(100),
    )
    .unwrap();

    let run = harness.trigger("r1").await.unwrap();

    assert_run_failed(&run, ErrorKind::BudgetExceeded);
    assert!(run.clarifications.is_empty());
    assert_eq!(run.usage.total().total_tokens, 120);
    assert_eq!(intake.call_count(), 1);
    assert_eq!(harness.stored("r1").await.unwrap().status, RunStatus::Failed);
    assert!(harness.events.events_of_type(RunEventType::ClarificationRequested).is_empty());
}
