//! Stage trait and implementations.
//!
//! A stage is one named unit of work in a chain variant. It receives the
//! validated records of every earlier stage and produces either a new record
//! or a clarification request.

mod generative;

pub use generative::GenerativeStage;

use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::time::Duration;

use crate::contracts::StageRecord;
use crate::core::{Attachment, ClarificationExchange, ClarificationNeed, RunId, TokenUsage};
use crate::errors::ChainError;

/// Everything a stage sees when it runs.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageInput {
    /// Run being driven.
    pub run_id: RunId,
    /// Chain variant of the run.
    pub chain_variant: String,
    /// Name of this stage.
    pub stage: String,
    /// Position of this stage in the chain.
    pub stage_index: usize,
    /// The trigger's input payload.
    pub input: serde_json::Value,
    /// Records of all earlier stages, keyed by stage name.
    pub previous: BTreeMap<String, StageRecord>,
    /// Answer to this stage's clarification, once given.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub clarification: Option<ClarificationExchange>,
    /// Trigger attachments.
    #[serde(skip)]
    pub attachments: Vec<Attachment>,
}

impl StageInput {
    /// Record of an earlier stage.
    #[must_use]
    pub fn previous(&self, stage: &str) -> Option<&StageRecord> {
        self.previous.get(stage)
    }

    /// The input as a JSON value: trigger input, earlier payloads and any clarification.
    #[must_use]
    pub fn to_value(&self) -> serde_json::Value {
        let previous: serde_json::Map<String, serde_json::Value> = self
            .previous
            .iter()
            .map(|(name, record)| (name.clone(), record.payload.clone()))
            .collect();

        let mut value = serde_json::json!({
            "input": self.input,
            "previous": previous,
        });
        if let (Some(exchange), Some(obj)) = (&self.clarification, value.as_object_mut()) {
            obj.insert(
                "clarification".to_string(),
                serde_json::json!({
                    "question": exchange.question,
                    "answer": exchange.answer,
                }),
            );
        }
        value
    }

    /// Renders the input as the user message of a generation request.
    pub fn to_message(&self) -> Result<String, ChainError> {
        Ok(serde_json::to_string_pretty(&self.to_value())?)
    }
}

/// Per-attempt generation limits chosen by the retry wrapper.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AttemptContext {
    /// 1-based attempt number.
    pub attempt: u32,
    /// Output size ceiling for this attempt.
    pub max_output_tokens: u32,
    /// Sampling temperature.
    pub temperature: f32,
    /// Bound on the external call.
    pub request_timeout: Duration,
}

impl AttemptContext {
    /// Creates a context for the given attempt and ceiling.
    #[must_use]
    pub fn new(attempt: u32, max_output_tokens: u32) -> Self {
        Self {
            attempt,
            max_output_tokens,
            temperature: 0.7,
            request_timeout: Duration::from_secs(300),
        }
    }

    /// Sets the temperature.
    #[must_use]
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    /// Sets the request timeout.
    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

/// What a successful stage attempt produced.
#[derive(Debug, Clone, PartialEq)]
pub enum StageProduct {
    /// A validated record.
    Record {
        /// Record payload.
        payload: serde_json::Value,
        /// Usage of the attempt.
        usage: TokenUsage,
    },
    /// A request for human input.
    Clarification {
        /// What to ask.
        need: ClarificationNeed,
        /// Usage of the attempt.
        usage: TokenUsage,
    },
}

impl StageProduct {
    /// A record with no usage.
    #[must_use]
    pub fn record(payload: serde_json::Value) -> Self {
        Self::Record {
            payload,
            usage: TokenUsage::default(),
        }
    }

    /// A clarification request with no usage.
    #[must_use]
    pub fn clarification(need: ClarificationNeed) -> Self {
        Self::Clarification {
            need,
            usage: TokenUsage::default(),
        }
    }

    /// Sets the usage.
    #[must_use]
    pub fn with_usage(mut self, attempt_usage: TokenUsage) -> Self {
        match &mut self {
            Self::Record { usage, .. } | Self::Clarification { usage, .. } => *usage = attempt_usage,
        }
        self
    }

    /// Usage of the attempt.
    #[must_use]
    pub fn usage(&self) -> TokenUsage {
        match self {
            Self::Record { usage, .. } | Self::Clarification { usage, .. } => *usage,
        }
    }
}

/// Trait for chain stages.
///
/// Failures must be classified: return [`ChainError::TransientStructural`]
/// only when a retry under a larger output ceiling may succeed, and attach
/// the usage the failed attempt consumed.
#[async_trait]
pub trait Stage: Send + Sync + Debug {
    /// Returns the name of the stage.
    fn name(&self) -> &str;

    /// Schema version of the records this stage produces.
    fn schema_version(&self) -> u32 {
        1
    }

    /// Executes one attempt of the stage.
    async fn execute(
        &self,
        input: &StageInput,
        attempt: &AttemptContext,
    ) -> Result<StageProduct, ChainError>;
}

/// A simple function-based stage.
pub struct FnStage<F>
where
    F: Fn(&StageInput, &AttemptContext) -> Result<StageProduct, ChainError> + Send + Sync,
{
    name: String,
    version: u32,
    func: F,
}

impl<F> FnStage<F>
where
    F: Fn(&StageInput, &AttemptContext) -> Result<StageProduct, ChainError> + Send + Sync,
{
    /// Creates a new function-based stage.
    pub fn new(name: impl Into<String>, func: F) -> Self {
        Self {
            name: name.into(),
            version: 1,
            func,
        }
    }

    /// Sets the schema version.
    #[must_use]
    pub fn with_schema_version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }
}

impl<F> Debug for FnStage<F>
where
    F: Fn(&StageInput, &AttemptContext) -> Result<StageProduct, ChainError> + Send + Sync,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnStage")
            .field("name", &self.name)
            .field("version", &self.version)
            .finish()
    }
}

#[async_trait]
impl<F> Stage for FnStage<F>
where
    F: Fn(&StageInput, &AttemptContext) -> Result<StageProduct, ChainError> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn schema_version(&self) -> u32 {
        self.version
    }

    async fn execute(
        &self,
        input: &StageInput,
        attempt: &AttemptContext,
    ) -> Result<StageProduct, ChainError> {
        (self.func)(input, attempt)
    }
}

#[cfg(test)]
pub(crate) fn test_input(stage: &str) -> StageInput {
    StageInput {
        run_id: RunId::new("run-1"),
        chain_variant: "standard".to_string(),
        stage: stage.to_string(),
        stage_index: 0,
        input: serde_json::json!({"problem": "keep a battery pack cool"}),
        previous: BTreeMap::new(),
        clarification: None,
        attachments: Vec::new(),
    }
}
