//! Generative-service request and response types.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::core::{Attachment, TokenUsage};
use crate::errors::ChainError;

/// A single call to the generative service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    /// System instructions for the stage.
    pub instructions: String,
    /// The user message (rendered stage input).
    pub message: String,
    /// Output size ceiling for this attempt.
    pub max_output_tokens: u32,
    /// Sampling temperature.
    pub temperature: f32,
    /// Attachments forwarded from the trigger.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
}

/// The service's reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationResponse {
    /// Raw generated text.
    pub content: String,
    /// Tokens consumed by the call.
    pub usage: TokenUsage,
    /// True if generation stopped at the output ceiling.
    pub was_truncated: bool,
    /// Model that served the call.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Provider stop reason.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
}

impl GenerationResponse {
    /// A response that finished normally.
    #[must_use]
    pub fn complete(content: impl Into<String>, usage: TokenUsage) -> Self {
        Self {
            content: content.into(),
            usage,
            was_truncated: false,
            model: None,
            finish_reason: Some("end_turn".to_string()),
        }
    }

    /// A response cut off at the output ceiling.
    #[must_use]
    pub fn truncated(content: impl Into<String>, usage: TokenUsage) -> Self {
        Self {
            content: content.into(),
            usage,
            was_truncated: true,
            model: None,
            finish_reason: Some("max_tokens".to_string()),
        }
    }

    /// Converts to span attributes for logging.
    #[must_use]
    pub fn to_log_attributes(&self) -> HashMap<String, serde_json::Value> {
        let mut map = HashMap::new();
        if let Some(ref m) = self.model {
            map.insert("llm.model".to_string(), serde_json::json!(m));
        }
        map.insert("llm.input_tokens".to_string(), serde_json::json!(self.usage.input_tokens));
        map.insert("llm.output_tokens".to_string(), serde_json::json!(self.usage.output_tokens));
        map.insert("llm.total_tokens".to_string(), serde_json::json!(self.usage.total_tokens));
        map.insert("llm.truncated".to_string(), serde_json::json!(self.was_truncated));
        map
    }
}

/// The external generative service.
///
/// Implementations return [`ChainError::ContentRefusal`] when the model
/// declines and [`ChainError::Generation`] for transport or auth failures.
#[async_trait]
pub trait GenerativeService: Send + Sync {
    /// Performs one generation call.
    async fn generate(&self, request: GenerationRequest) -> Result<GenerationResponse, ChainError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_constructors() {
        let ok = GenerationResponse::complete("{}", TokenUsage::new(3, 4));
        assert!(!ok.was_truncated);

        let cut = GenerationResponse::truncated("{\"a\":", TokenUsage::new(3, 4));
        assert!(cut.was_truncated);
        assert_eq!(cut.finish_reason.as_deref(), Some("max_tokens"));
    }

    #[test]
    fn test_log_attributes() {
        let resp = GenerationResponse::complete("{}", TokenUsage::new(10, 20));
        let attrs = resp.to_log_attributes();
        assert_eq!(attrs.get("llm.total_tokens"), Some(&serde_json::json!(30)));
        assert_eq!(attrs.get("llm.truncated"), Some(&serde_json::json!(false)));
    }
}
