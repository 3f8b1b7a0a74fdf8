//! Core domain model types for reportflow.
//!
//! This module contains the fundamental types used throughout the crate:
//! - Run status and the persisted run record
//! - Usage accounting
//! - External trigger, answer and cancel events
//! - Stage outcomes

mod event;
mod outcome;
mod run;
mod status;
mod usage;

pub use event::{CancellationEvent, ClarificationAnswerEvent, TriggerEvent};
pub use outcome::StageOutcome;
pub use run::{
    AnswerShape, Attachment, ClarificationExchange, ClarificationNeed, ClarificationRecord, Run,
    RunId,
};
pub use status::RunStatus;
pub use usage::{TokenUsage, UsageEntry, UsageLedger};
