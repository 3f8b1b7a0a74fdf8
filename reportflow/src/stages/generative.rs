//! A stage backed by one call to the generative service.

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

use super::{AttemptContext, Stage, StageInput, StageProduct};
use crate::errors::{ChainError, StructuralFault};
use crate::generation::{GenerationRequest, GenerativeService, SchemaValidator, ValidatedOutput};

/// Calls the generative service and validates the reply.
///
/// A reply cut off at the output ceiling is reported as a truncation before
/// the validator sees it, so the retry wrapper can raise the ceiling.
pub struct GenerativeStage {
    name: String,
    version: u32,
    instructions: String,
    service: Arc<dyn GenerativeService>,
    validator: Arc<dyn SchemaValidator>,
}

impl GenerativeStage {
    /// Creates a generative stage.
    pub fn new(
        name: impl Into<String>,
        instructions: impl Into<String>,
        service: Arc<dyn GenerativeService>,
        validator: Arc<dyn SchemaValidator>,
    ) -> Self {
        Self {
            name: name.into(),
            version: 1,
            instructions: instructions.into(),
            service,
            validator,
        }
    }

    /// Sets the schema version of the produced records.
    #[must_use]
    pub fn with_schema_version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    fn build_request(
        &self,
        input: &StageInput,
        attempt: &AttemptContext,
    ) -> Result<GenerationRequest, ChainError> {
        Ok(GenerationRequest {
            instructions: self.instructions.clone(),
            message: input.to_message()?,
            max_output_tokens: attempt.max_output_tokens,
            temperature: attempt.temperature,
            attachments: input.attachments.clone(),
        })
    }
}

impl fmt::Debug for GenerativeStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GenerativeStage")
            .field("name", &self.name)
            .field("version", &self.version)
            .field("validator", &self.validator)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Stage for GenerativeStage {
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
        let request = self.build_request(input, attempt)?;

        let response = tokio::time::timeout(attempt.request_timeout, self.service.generate(request))
            .await
            .map_err(|_| {
                ChainError::generation(format!(
                    "generation request timed out after {}s",
                    attempt.request_timeout.as_secs()
                ))
            })??;

        let usage = response.usage;
        debug!(
            stage = %self.name,
            attempt = attempt.attempt,
            ceiling = attempt.max_output_tokens,
            attributes = ?response.to_log_attributes(),
            "Generation call returned"
        );

        if response.was_truncated {
            return Err(ChainError::transient(
                StructuralFault::Truncated,
                format!("output stopped at the {}-token ceiling", attempt.max_output_tokens),
            )
            .with_usage(usage));
        }

        match self
            .validator
            .validate(&response.content)
            .map_err(|e| e.with_usage(usage))?
        {
            ValidatedOutput::Record(payload) => Ok(StageProduct::Record { payload, usage }),
            ValidatedOutput::Clarification(need) => Ok(StageProduct::Clarification { need, usage }),
        }
    }
}
