//! External events consumed by the orchestrator.

use serde::{Deserialize, Serialize};

use super::{Attachment, RunId};

/// Starts a new run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerEvent {
    /// Id of the run to create.
    pub run_id: RunId,
    /// Chain variant to execute.
    pub chain_variant: String,
    /// The user's problem statement and options.
    pub input: serde_json::Value,
    /// Account billed for the run.
    #[serde(default)]
    pub account_id: String,
    /// Optional attachments.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
}

impl TriggerEvent {
    /// Creates a trigger without account or attachments.
    #[must_use]
    pub fn new(
        run_id: impl Into<RunId>,
        chain_variant: impl Into<String>,
        input: serde_json::Value,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            chain_variant: chain_variant.into(),
            input,
            account_id: String::new(),
            attachments: Vec::new(),
        }
    }

    /// Sets the billed account.
    #[must_use]
    pub fn with_account(mut self, account_id: impl Into<String>) -> Self {
        self.account_id = account_id.into();
        self
    }

    /// Adds an attachment.
    #[must_use]
    pub fn with_attachment(mut self, attachment: Attachment) -> Self {
        self.attachments.push(attachment);
        self
    }
}

/// Answers the outstanding clarification of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClarificationAnswerEvent {
    /// Target run.
    pub run_id: RunId,
    /// The user's answer.
    pub answer: String,
}

impl ClarificationAnswerEvent {
    /// Creates an answer event.
    #[must_use]
    pub fn new(run_id: impl Into<RunId>, answer: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            answer: answer.into(),
        }
    }
}

/// Requests cancellation of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancellationEvent {
    /// Target run.
    pub run_id: RunId,
}

impl CancellationEvent {
    /// Creates a cancellation event.
    #[must_use]
    pub fn new(run_id: impl Into<RunId>) -> Self {
        Self {
            run_id: run_id.into(),
        }
    }
}
