//! The persisted run record and its clarification history.

use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::{RunStatus, TriggerEvent, UsageLedger};
use crate::errors::{ChainError, TerminalError};

/// Identifier of a run, supplied by the trigger.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(String);

impl RunId {
    /// Creates a run id from any string.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generates a fresh time-ordered id.
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::now_v7().to_string())
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RunId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for RunId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// A file attached to the trigger, passed to every generation call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    /// File name shown to the model.
    pub name: String,
    /// MIME type, e.g. `application/pdf`.
    pub media_type: String,
    /// Base64-encoded content.
    pub data: String,
}

impl Attachment {
    /// Decodes the content, failing if the payload is not valid base64.
    pub fn decode(&self) -> Result<Vec<u8>, ChainError> {
        STANDARD.decode(self.data.as_bytes()).map_err(|e| {
            ChainError::validation(format!("attachment '{}' is not valid base64: {e}", self.name))
        })
    }
}

/// Shape an answer must take.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AnswerShape {
    /// Any non-empty text.
    #[default]
    FreeText,
    /// Exactly one of the listed options.
    Choice {
        /// Allowed answers.
        options: Vec<String>,
    },
}

impl AnswerShape {
    /// Checks an answer against the shape.
    pub fn check(&self, answer: &str) -> Result<(), ChainError> {
        let trimmed = answer.trim();
        if trimmed.is_empty() {
            return Err(ChainError::InvalidAnswer("answer is empty".into()));
        }
        match self {
            Self::FreeText => Ok(()),
            Self::Choice { options } => {
                if options.iter().any(|o| o == trimmed) {
                    Ok(())
                } else {
                    Err(ChainError::InvalidAnswer(format!(
                        "'{trimmed}' is not one of: {}",
                        options.join(", ")
                    )))
                }
            }
        }
    }
}

/// What a stage asks the user when it cannot proceed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClarificationNeed {
    /// The question shown to the user.
    pub question: String,
    /// Supporting context for the question.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    /// Allowed answer shape.
    #[serde(default)]
    pub answer_shape: AnswerShape,
}

impl ClarificationNeed {
    /// Creates a free-text question.
    #[must_use]
    pub fn question(question: impl Into<String>) -> Self {
        Self {
            question: question.into(),
            context: None,
            answer_shape: AnswerShape::FreeText,
        }
    }

    /// Sets the supporting context.
    #[must_use]
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    /// Restricts answers to a set of options.
    #[must_use]
    pub fn with_options(mut self, options: Vec<String>) -> Self {
        self.answer_shape = AnswerShape::Choice { options };
        self
    }
}

/// A persisted clarification request and, once given, its answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClarificationRecord {
    /// Stage that asked.
    pub stage: String,
    /// Index of that stage in the chain.
    pub stage_index: usize,
    /// The question.
    pub question: String,
    /// Supporting context.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    /// Allowed answer shape.
    #[serde(default)]
    pub answer_shape: AnswerShape,
    /// When the request was created.
    pub created_at: DateTime<Utc>,
    /// When the request expires.
    pub expires_at: DateTime<Utc>,
    /// The answer, once received.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer: Option<String>,
    /// When the answer was received.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answered_at: Option<DateTime<Utc>>,
}

impl ClarificationRecord {
    /// Returns true once an answer has been recorded.
    #[must_use]
    pub fn is_answered(&self) -> bool {
        self.answer.is_some()
    }

    /// Returns true if the request is past its deadline at `now`.
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// A question and answer pair merged into a stage's input on re-invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClarificationExchange {
    /// The question that was asked.
    pub question: String,
    /// The user's answer.
    pub answer: String,
}

/// One execution of a chain for a single user request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    /// Run identity.
    pub id: RunId,
    /// Account billed for the run.
    pub account_id: String,
    /// Chain variant identifier.
    pub chain_variant: String,
    /// Trigger input payload.
    pub input: serde_json::Value,
    /// Trigger attachments.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
    /// Ordered stage names of the chain variant.
    pub stages: Vec<String>,
    /// Index of the stage currently executing (or next to execute).
    pub current_stage: usize,
    /// Name of the stage currently reported to the UI.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_stage_name: Option<String>,
    /// Progress of the current stage, 0 or 100.
    pub phase_progress: u8,
    /// Lifecycle status.
    pub status: RunStatus,
    /// Usage across all stages.
    pub usage: UsageLedger,
    /// Clarification history, oldest first.
    #[serde(default)]
    pub clarifications: Vec<ClarificationRecord>,
    /// The committed final artifact.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_artifact: Option<serde_json::Value>,
    /// Report title extracted from the final artifact.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Terminal error of a failed run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<TerminalError>,
    /// Optimistic concurrency revision, bumped by every store write.
    #[serde(default)]
    pub revision: u64,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last modification time.
    pub updated_at: DateTime<Utc>,
    /// When the run reached a terminal status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl Run {
    /// Creates a pending run from a trigger.
    #[must_use]
    pub fn from_trigger(trigger: &TriggerEvent, stages: Vec<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: trigger.run_id.clone(),
            account_id: trigger.account_id.clone(),
            chain_variant: trigger.chain_variant.clone(),
            input: trigger.input.clone(),
            attachments: trigger.attachments.clone(),
            stages,
            current_stage: 0,
            current_stage_name: None,
            phase_progress: 0,
            status: RunStatus::Pending,
            usage: UsageLedger::new(),
            clarifications: Vec::new(),
            final_artifact: None,
            title: None,
            error: None,
            revision: 0,
            created_at: now,
            updated_at: now,
            finished_at: None,
        }
    }

    /// Returns true once the run can no longer change.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Error message of a failed run.
    #[must_use]
    pub fn error_message(&self) -> Option<&str> {
        self.error.as_ref().map(|e| e.message.as_str())
    }

    /// Moves to `next`, rejecting transitions the lifecycle forbids.
    pub fn transition(
        &mut self,
        next: RunStatus,
        action: &str,
        now: DateTime<Utc>,
    ) -> Result<(), ChainError> {
        if !self.status.can_transition_to(next) {
            return Err(ChainError::InvalidTransition {
                run_id: self.id.to_string(),
                status: self.status,
                action: action.to_string(),
            });
        }
        self.status = next;
        self.updated_at = now;
        if next.is_terminal() {
            self.finished_at = Some(now);
        }
        Ok(())
    }

    /// Fails the run with `err`. Returns false if the run was already terminal.
    pub fn mark_failed(&mut self, err: &ChainError, now: DateTime<Utc>) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.status = RunStatus::Failed;
        self.error = Some(TerminalError::from(err));
        self.updated_at = now;
        self.finished_at = Some(now);
        true
    }

    /// Cancels the run. Returns false if the run was already terminal.
    pub fn mark_cancelled(&mut self, now: DateTime<Utc>) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.status = RunStatus::Cancelled;
        self.updated_at = now;
        self.finished_at = Some(now);
        true
    }

    /// The unanswered request of a clarifying run.
    #[must_use]
    pub fn outstanding_clarification(&self) -> Option<&ClarificationRecord> {
        if self.status != RunStatus::Clarifying {
            return None;
        }
        self.clarifications.last().filter(|c| !c.is_answered())
    }

    /// Mutable access to the unanswered request of a clarifying run.
    pub fn outstanding_clarification_mut(&mut self) -> Option<&mut ClarificationRecord> {
        if self.status != RunStatus::Clarifying {
            return None;
        }
        self.clarifications.last_mut().filter(|c| !c.is_answered())
    }

    /// The answered request of a clarifying run whose stage still has to be re-invoked.
    #[must_use]
    pub fn pending_reinvocation(&self) -> Option<&ClarificationRecord> {
        if self.status != RunStatus::Clarifying {
            return None;
        }
        self.clarifications.last().filter(|c| c.is_answered())
    }

    /// The answered clarification for a stage, if it already had its round.
    #[must_use]
    pub fn answered_clarification(&self, stage: &str) -> Option<&ClarificationRecord> {
        self.clarifications
            .iter()
            .rev()
            .find(|c| c.stage == stage && c.is_answered())
    }

    /// The question/answer pair to merge into a stage's input.
    #[must_use]
    pub fn clarification_exchange(&self, stage: &str) -> Option<ClarificationExchange> {
        self.answered_clarification(stage).and_then(|c| {
            c.answer.as_ref().map(|answer| ClarificationExchange {
                question: c.question.clone(),
                answer: answer.clone(),
            })
        })
    }
}
