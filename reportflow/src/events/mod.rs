//! Analytics events emitted at run milestones.
//!
//! Events are best-effort: a sink failure is logged by the caller and never
//! changes the outcome of a run.

mod sink;

pub use sink::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::core::RunId;

/// Kind of run milestone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RunEventType {
    /// The final artifact was committed.
    #[serde(rename = "run.completed")]
    Completed,
    /// The run failed.
    #[serde(rename = "run.failed")]
    Failed,
    /// The run was cancelled.
    #[serde(rename = "run.cancelled")]
    Cancelled,
    /// A stage suspended the run for human input.
    #[serde(rename = "run.clarification_requested")]
    ClarificationRequested,
    /// An answer resumed the run.
    #[serde(rename = "run.clarification_answered")]
    ClarificationAnswered,
}

impl RunEventType {
    /// Dotted event name.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "run.completed",
            Self::Failed => "run.failed",
            Self::Cancelled => "run.cancelled",
            Self::ClarificationRequested => "run.clarification_requested",
            Self::ClarificationAnswered => "run.clarification_answered",
        }
    }
}

impl fmt::Display for RunEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A run milestone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunEvent {
    /// Milestone kind.
    pub event_type: RunEventType,
    /// The run.
    pub run_id: RunId,
    /// Account billed for the run.
    pub account_id: String,
    /// Stage the event relates to, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    /// Extra attributes.
    #[serde(default)]
    pub data: serde_json::Value,
    /// When the event happened.
    pub timestamp: DateTime<Utc>,
}

impl RunEvent {
    /// Creates an event with no stage and empty data.
    #[must_use]
    pub fn new(
        event_type: RunEventType,
        run_id: RunId,
        account_id: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            event_type,
            run_id,
            account_id: account_id.into(),
            stage: None,
            data: serde_json::Value::Null,
            timestamp,
        }
    }

    /// Sets the stage.
    #[must_use]
    pub fn with_stage(mut self, stage: impl Into<String>) -> Self {
        self.stage = Some(stage.into());
        self
    }

    /// Sets the data.
    #[must_use]
    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }
}
