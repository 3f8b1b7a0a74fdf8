//! Run status enum and its transition rules.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The lifecycle status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Created by a trigger, not yet started.
    #[default]
    Pending,
    /// Stages are executing.
    Processing,
    /// Suspended awaiting a clarification answer.
    Clarifying,
    /// Final artifact committed.
    Complete,
    /// Terminated with an error.
    Failed,
    /// Terminated by a cancel event.
    Cancelled,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Processing => write!(f, "processing"),
            Self::Clarifying => write!(f, "clarifying"),
            Self::Complete => write!(f, "complete"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl RunStatus {
    /// Returns true once the run can no longer change.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed | Self::Cancelled)
    }

    /// Returns true if the status accepts a cancel event.
    #[must_use]
    pub fn is_cancellable(&self) -> bool {
        matches!(self, Self::Pending | Self::Processing | Self::Clarifying)
    }

    /// Returns true if moving from `self` to `next` is allowed.
    #[must_use]
    pub fn can_transition_to(&self, next: Self) -> bool {
        use RunStatus::{Cancelled, Clarifying, Complete, Failed, Pending, Processing};

        match (self, next) {
            (Pending, Processing | Failed | Cancelled) => true,
            (Processing, Clarifying | Complete | Failed | Cancelled) => true,
            (Clarifying, Processing | Failed | Cancelled) => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_status_display() {
        assert_eq!(RunStatus::Pending.to_string(), "pending");
        assert_eq!(RunStatus::Clarifying.to_string(), "clarifying");
        assert_eq!(RunStatus::Cancelled.to_string(), "cancelled");
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(RunStatus::Complete.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(RunStatus::Cancelled.is_terminal());
        assert!(!RunStatus::Processing.is_terminal());
        assert!(!RunStatus::Clarifying.is_terminal());
    }

    #[test]
    fn test_terminal_statuses_have_no_exit() {
        for from in [RunStatus::Complete, RunStatus::Failed, RunStatus::Cancelled] {
            for to in [
                RunStatus::Pending,
                RunStatus::Processing,
                RunStatus::Clarifying,
                RunStatus::Complete,
                RunStatus::Failed,
                RunStatus::Cancelled,
            ] {
                assert!(!from.can_transition_to(to), "{from} -> {to}");
            }
        }
    }

    #[test]
    fn test_clarifying_returns_only_to_processing() {
        assert!(RunStatus::Clarifying.can_transition_to(RunStatus::Processing));
        assert!(!RunStatus::Clarifying.can_transition_to(RunStatus::Complete));
        assert!(!RunStatus::Pending.can_transition_to(RunStatus::Complete));
    }

    #[test]
    fn test_run_status_serialize() {
        let json = serde_json::to_string(&RunStatus::Clarifying).unwrap();
        assert_eq!(json, r#""clarifying""#);

        let back: RunStatus = serde_json::from_str(r#""complete""#).unwrap();
        assert_eq!(back, RunStatus::Complete);
    }
}
