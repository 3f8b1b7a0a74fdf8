//! Error types for the reportflow orchestrator.
//!
//! Transient structural failures are resolved locally by the retry wrapper;
//! everything else surfaces as a single terminal status plus one
//! human-readable message on the run.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::core::{RunStatus, TokenUsage};

/// Fixed message used when a stage asks for clarification a second time.
pub const SECOND_CLARIFICATION_MESSAGE: &str = "Unable to proceed after clarification";

/// Message stored on a run whose clarification was never answered.
pub const CLARIFICATION_EXPIRED_MESSAGE: &str =
    "Clarification request expired before an answer was received";

/// Serializable classification of a [`ChainError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Output truncated or structurally malformed.
    TransientStructural,
    /// The generative service declined the request.
    ContentRefusal,
    /// Output was complete but had the wrong shape.
    Validation,
    /// Cumulative usage crossed the configured ceiling.
    BudgetExceeded,
    /// A clarification was not answered in time.
    ClarificationTimeout,
    /// A stage asked for clarification after already receiving one.
    SecondClarification,
    /// The answer does not match the allowed answer shape.
    InvalidAnswer,
    /// A checkpoint or run write failed.
    Persistence,
    /// Another writer updated the run first.
    Conflict,
    /// The run was cancelled.
    Cancelled,
    /// Network, auth or timeout failure talking to the generative service.
    Generation,
    /// No run with the given id exists.
    UnknownRun,
    /// No chain variant with the given id is registered.
    UnknownChain,
    /// The requested transition is not allowed from the current status.
    InvalidTransition,
    /// The run is already being driven in this process.
    AlreadyRunning,
    /// Invalid configuration or chain definition.
    Configuration,
    /// Serialization or deserialization failed.
    Serialization,
    /// An invariant was violated.
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::TransientStructural => "transient_structural",
            Self::ContentRefusal => "content_refusal",
            Self::Validation => "validation",
            Self::BudgetExceeded => "budget_exceeded",
            Self::ClarificationTimeout => "clarification_timeout",
            Self::SecondClarification => "second_clarification",
            Self::InvalidAnswer => "invalid_answer",
            Self::Persistence => "persistence",
            Self::Conflict => "conflict",
            Self::Cancelled => "cancelled",
            Self::Generation => "generation",
            Self::UnknownRun => "unknown_run",
            Self::UnknownChain => "unknown_chain",
            Self::InvalidTransition => "invalid_transition",
            Self::AlreadyRunning => "already_running",
            Self::Configuration => "configuration",
            Self::Serialization => "serialization",
            Self::Internal => "internal",
        };
        f.write_str(name)
    }
}

/// The structural fault behind a transient failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StructuralFault {
    /// The service stopped at the output ceiling or the text ended mid-record.
    Truncated,
    /// The text could not be parsed as a structured record.
    Malformed,
}

impl fmt::Display for StructuralFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Truncated => write!(f, "truncated"),
            Self::Malformed => write!(f, "malformed"),
        }
    }
}

/// The main error type for orchestrator operations.
#[derive(Debug, Clone, Error)]
pub enum ChainError {
    /// Output truncated or malformed; retrying under a larger ceiling may succeed.
    #[error("Transient structural failure ({fault}): {detail}")]
    TransientStructural {
        /// What went wrong structurally.
        fault: StructuralFault,
        /// Parser or service detail.
        detail: String,
        /// Usage consumed by the failed attempt.
        usage: TokenUsage,
    },

    /// The generative service refused the request.
    #[error("Content refused: {message}")]
    ContentRefusal {
        /// Refusal text from the service.
        message: String,
        /// Usage consumed by the refused attempt.
        usage: TokenUsage,
    },

    /// The output parsed but failed schema validation.
    #[error("Validation failed: {message}")]
    Validation {
        /// What was wrong with the record.
        message: String,
        /// Usage consumed by the attempt.
        usage: TokenUsage,
    },

    /// Cumulative usage exceeded the ceiling.
    #[error("Budget exceeded after stage '{stage}': used {used} tokens, ceiling is {ceiling}")]
    BudgetExceeded {
        /// Stage whose usage crossed the ceiling.
        stage: String,
        /// Cumulative usage after the stage.
        used: u64,
        /// Configured ceiling.
        ceiling: u64,
    },

    /// A clarification expired unanswered.
    #[error("Clarification for stage '{stage}' expired")]
    ClarificationTimeout {
        /// The stage awaiting the answer.
        stage: String,
    },

    /// A stage requested a second clarification.
    #[error("Stage '{stage}' requested clarification again after being answered")]
    SecondClarification {
        /// The stage that asked twice.
        stage: String,
    },

    /// An answer did not fit the requested answer shape.
    #[error("Invalid clarification answer: {0}")]
    InvalidAnswer(String),

    /// A durable write or read failed.
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Optimistic concurrency check failed.
    #[error("Run '{run_id}' was modified concurrently (expected revision {expected}, found {found})")]
    Conflict {
        /// The run id.
        run_id: String,
        /// Revision the writer started from.
        expected: u64,
        /// Revision currently stored.
        found: u64,
    },

    /// The run was cancelled.
    #[error("Run cancelled: {0}")]
    Cancelled(String),

    /// Non-retryable failure calling the generative service.
    #[error("Generation failed: {message}")]
    Generation {
        /// Transport or service detail.
        message: String,
        /// Usage reported before the failure, if any.
        usage: TokenUsage,
    },

    /// Run not found.
    #[error("Unknown run: {0}")]
    UnknownRun(String),

    /// Chain variant not registered.
    #[error("Unknown chain variant: {0}")]
    UnknownChain(String),

    /// Transition not allowed.
    #[error("Run '{run_id}' cannot {action} while {status}")]
    InvalidTransition {
        /// The run id.
        run_id: String,
        /// Current status.
        status: RunStatus,
        /// Attempted action.
        action: String,
    },

    /// The run already has an active driver.
    #[error("Run '{0}' is already executing")]
    AlreadyRunning(String),

    /// Configuration or chain validation failure.
    #[error("{0}")]
    Configuration(#[from] ChainValidationError),

    /// Serialization failure.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invariant violation.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ChainError {
    /// Creates a transient structural error with no usage attached.
    #[must_use]
    pub fn transient(fault: StructuralFault, detail: impl Into<String>) -> Self {
        Self::TransientStructural {
            fault,
            detail: detail.into(),
            usage: TokenUsage::default(),
        }
    }

    /// Creates a refusal error with no usage attached.
    #[must_use]
    pub fn refusal(message: impl Into<String>) -> Self {
        Self::ContentRefusal {
            message: message.into(),
            usage: TokenUsage::default(),
        }
    }

    /// Creates a validation error with no usage attached.
    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
            usage: TokenUsage::default(),
        }
    }

    /// Creates a generation (transport) error with no usage attached.
    #[must_use]
    pub fn generation(message: impl Into<String>) -> Self {
        Self::Generation {
            message: message.into(),
            usage: TokenUsage::default(),
        }
    }

    /// Returns the classification of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::TransientStructural { .. } => ErrorKind::TransientStructural,
            Self::ContentRefusal { .. } => ErrorKind::ContentRefusal,
            Self::Validation { .. } => ErrorKind::Validation,
            Self::BudgetExceeded { .. } => ErrorKind::BudgetExceeded,
            Self::ClarificationTimeout { .. } => ErrorKind::ClarificationTimeout,
            Self::SecondClarification { .. } => ErrorKind::SecondClarification,
            Self::InvalidAnswer(_) => ErrorKind::InvalidAnswer,
            Self::Persistence(_) => ErrorKind::Persistence,
            Self::Conflict { .. } => ErrorKind::Conflict,
            Self::Cancelled(_) => ErrorKind::Cancelled,
            Self::Generation { .. } => ErrorKind::Generation,
            Self::UnknownRun(_) => ErrorKind::UnknownRun,
            Self::UnknownChain(_) => ErrorKind::UnknownChain,
            Self::InvalidTransition { .. } => ErrorKind::InvalidTransition,
            Self::AlreadyRunning(_) => ErrorKind::AlreadyRunning,
            Self::Configuration(_) => ErrorKind::Configuration,
            Self::Serialization(_) => ErrorKind::Serialization,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Returns true if retrying under a larger output ceiling may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientStructural { .. })
    }

    /// Returns true if the error belongs to the storage layer.
    ///
    /// These leave the run untouched so the hosting substrate can retry the step.
    #[must_use]
    pub fn is_infrastructure(&self) -> bool {
        matches!(
            self,
            Self::Persistence(_) | Self::Conflict { .. } | Self::AlreadyRunning(_)
        )
    }

    /// Usage consumed by the attempt that produced this error.
    #[must_use]
    pub fn usage(&self) -> TokenUsage {
        match self {
            Self::TransientStructural { usage, .. }
            | Self::ContentRefusal { usage, .. }
            | Self::Validation { usage, .. }
            | Self::Generation { usage, .. } => *usage,
            _ => TokenUsage::default(),
        }
    }

    /// Attaches the usage of the attempt that failed.
    #[must_use]
    pub fn with_usage(mut self, attempt_usage: TokenUsage) -> Self {
        match &mut self {
            Self::TransientStructural { usage, .. }
            | Self::ContentRefusal { usage, .. }
            | Self::Validation { usage, .. }
            | Self::Generation { usage, .. } => *usage = attempt_usage,
            _ => {}
        }
        self
    }

    /// The single message shown to the user when this error ends a run.
    #[must_use]
    pub fn user_message(&self) -> String {
        match self {
            Self::ContentRefusal { message, .. } => message.clone(),
            Self::ClarificationTimeout { .. } => CLARIFICATION_EXPIRED_MESSAGE.to_string(),
            Self::SecondClarification { .. } => SECOND_CLARIFICATION_MESSAGE.to_string(),
            Self::TransientStructural { .. } => {
                "The report could not be generated: the model output was incomplete after repeated attempts"
                    .to_string()
            }
            Self::Validation { .. } => {
                "The report could not be generated: the model output did not match the expected structure"
                    .to_string()
            }
            Self::Generation { .. } => {
                "The report could not be generated: the generation service was unavailable".to_string()
            }
            other => other.to_string(),
        }
    }
}

impl From<serde_json::Error> for ChainError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for ChainError {
    fn from(err: std::io::Error) -> Self {
        Self::Persistence(err.to_string())
    }
}

/// Error raised when a chain definition or configuration is invalid.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct ChainValidationError {
    /// Stable error code (e.g. `CHAIN-EMPTY`).
    pub code: String,
    /// Human-readable description.
    pub message: String,
    /// Hint for fixing the problem.
    pub fix_hint: Option<String>,
}

impl ChainValidationError {
    /// Creates a new validation error.
    #[must_use]
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            fix_hint: None,
        }
    }

    /// Sets the fix hint.
    #[must_use]
    pub fn with_fix_hint(mut self, hint: impl Into<String>) -> Self {
        self.fix_hint = Some(hint.into());
        self
    }
}

/// The terminal error stored on a failed run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalError {
    /// Error classification.
    pub kind: ErrorKind,
    /// User-facing message.
    pub message: String,
}

impl From<&ChainError> for TerminalError {
    fn from(err: &ChainError) -> Self {
        Self {
            kind: err.kind(),
            message: err.user_message(),
        }
    }
}
