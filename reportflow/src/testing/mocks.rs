//! Scripted collaborators for testing.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::Duration;

use crate::core::{ClarificationNeed, TokenUsage};
use crate::errors::{ChainError, StructuralFault};
use crate::generation::{GenerationRequest, GenerationResponse, GenerativeService};
use crate::stages::{AttemptContext, Stage, StageInput, StageProduct};

/// A generative service that replays a queue of scripted replies.
///
/// Every request is recorded, so tests can assert on the ceiling each
/// attempt was given.
#[derive(Debug, Default)]
pub struct ScriptedGenerator {
    script: Mutex<VecDeque<Result<GenerationResponse, ChainError>>>,
    requests: Mutex<Vec<GenerationRequest>>,
    latency: Option<Duration>,
}

impl ScriptedGenerator {
    /// Creates a generator with an empty script.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Delays every reply.
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Queues a reply.
    #[must_use]
    pub fn then_response(self, response: GenerationResponse) -> Self {
        self.script.lock().push_back(Ok(response));
        self
    }

    /// Queues a complete reply.
    #[must_use]
    pub fn then_complete(self, content: impl Into<String>, usage: TokenUsage) -> Self {
        self.then_response(GenerationResponse::complete(content, usage))
    }

    /// Queues a reply cut off at the ceiling.
    #[must_use]
    pub fn then_truncated(self, content: impl Into<String>, usage: TokenUsage) -> Self {
        self.then_response(GenerationResponse::truncated(content, usage))
    }

    /// Queues an error.
    #[must_use]
    pub fn then_error(self, error: ChainError) -> Self {
        self.script.lock().push_back(Err(error));
        self
    }

    /// Requests received so far.
    #[must_use]
    pub fn requests(&self) -> Vec<GenerationRequest> {
        self.requests.lock().clone()
    }

    /// Number of calls made.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.requests.lock().len()
    }
}

#[async_trait]
impl GenerativeService for ScriptedGenerator {
    async fn generate(&self, request: GenerationRequest) -> Result<GenerationResponse, ChainError> {
        self.requests.lock().push(request);
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        self.script
            .lock()
            .pop_front()
            .unwrap_or_else(|| Err(ChainError::Internal("generator script exhausted".into())))
    }
}

/// A stage that replays scripted attempt results.
///
/// Once the script runs out the stage keeps returning its fallback record.
#[derive(Debug)]
pub struct ScriptedStage {
    name: String,
    script: Mutex<VecDeque<Result<StageProduct, ChainError>>>,
    fallback: StageProduct,
    inputs: Mutex<Vec<StageInput>>,
    ceilings: Mutex<Vec<u32>>,
}

impl ScriptedStage {
    /// Creates a stage whose fallback record is `{"stage": name}`.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let fallback = StageProduct::record(serde_json::json!({ "stage": name }));
        Self {
            name,
            script: Mutex::new(VecDeque::new()),
            fallback,
            inputs: Mutex::new(Vec::new()),
            ceilings: Mutex::new(Vec::new()),
        }
    }

    /// Replaces the fallback product.
    #[must_use]
    pub fn with_fallback(mut self, product: StageProduct) -> Self {
        self.fallback = product;
        self
    }

    /// Makes every unscripted attempt consume `usage`.
    #[must_use]
    pub fn with_usage(mut self, usage: TokenUsage) -> Self {
        self.fallback = self.fallback.with_usage(usage);
        self
    }

    /// Queues a record.
    #[must_use]
    pub fn then_record(self, payload: serde_json::Value, usage: TokenUsage) -> Self {
        self.script
            .lock()
            .push_back(Ok(StageProduct::Record { payload, usage }));
        self
    }

    /// Queues a clarification request.
    #[must_use]
    pub fn then_clarification(self, need: ClarificationNeed, usage: TokenUsage) -> Self {
        self.script
            .lock()
            .push_back(Ok(StageProduct::Clarification { need, usage }));
        self
    }

    /// Queues a truncated attempt.
    #[must_use]
    pub fn then_truncated(self, usage: TokenUsage) -> Self {
        self.then_error(
            ChainError::transient(StructuralFault::Truncated, "output hit the ceiling").with_usage(usage),
        )
    }

    /// Queues an error.
    #[must_use]
    pub fn then_error(self, error: ChainError) -> Self {
        self.script.lock().push_back(Err(error));
        self
    }

    /// Number of attempts made.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.inputs.lock().len()
    }

    /// Inputs of every attempt.
    #[must_use]
    pub fn inputs(&self) -> Vec<StageInput> {
        self.inputs.lock().clone()
    }

    /// Output ceilings of every attempt.
    #[must_use]
    pub fn ceilings(&self) -> Vec<u32> {
        self.ceilings.lock().clone()
    }
}

#[async_trait]
impl Stage for ScriptedStage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(
        &self,
        input: &StageInput,
        attempt: &AttemptContext,
    ) -> Result<StageProduct, ChainError> {
        self.inputs.lock().push(input.clone());
        self.ceilings.lock().push(attempt.max_output_tokens);
        self.script
            .lock()
            .pop_front()
            .unwrap_or_else(|| Ok(self.fallback.clone()))
    }
}
