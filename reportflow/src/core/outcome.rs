//! Tagged result of running one stage.

use super::{ClarificationNeed, TokenUsage};
use crate::contracts::StageRecord;
use crate::errors::ChainError;

/// The outcome of one stage execution, including all of its retry attempts.
#[derive(Debug, Clone)]
pub enum StageOutcome {
    /// The stage produced a validated record that is now checkpointed.
    Success {
        /// The validated record.
        record: StageRecord,
        /// Usage summed over every attempt of the successful execution.
        usage: TokenUsage,
        /// Number of attempts it took.
        attempts: u32,
        /// True if the record came from an existing checkpoint.
        replayed: bool,
    },
    /// The stage cannot continue without a human answer.
    NeedsClarification {
        /// What to ask.
        need: ClarificationNeed,
        /// Usage consumed producing the request.
        usage: TokenUsage,
    },
    /// Every attempt failed structurally.
    TransientFailure {
        /// The last error.
        error: ChainError,
        /// Usage summed over all attempts.
        usage: TokenUsage,
    },
    /// A non-retryable failure.
    FatalFailure {
        /// The error.
        error: ChainError,
        /// Usage summed over all attempts.
        usage: TokenUsage,
    },
}

impl StageOutcome {
    /// Returns true for a success (fresh or replayed).
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    /// Usage to attribute to the stage for this outcome.
    #[must_use]
    pub fn usage(&self) -> TokenUsage {
        match self {
            Self::Success { usage, .. }
            | Self::NeedsClarification { usage, .. }
            | Self::TransientFailure { usage, .. }
            | Self::FatalFailure { usage, .. } => *usage,
        }
    }

    /// The error of a failed outcome.
    #[must_use]
    pub fn error(&self) -> Option<&ChainError> {
        match self {
            Self::TransientFailure { error, .. } | Self::FatalFailure { error, .. } => Some(error),
            _ => None,
        }
    }
}
