//! # Reportflow
//!
//! A durable orchestrator for multi-stage report generation.
//!
//! Reportflow drives a run through an ordered chain of generative stages and
//! survives everything in between:
//!
//! - **Checkpointed stages**: every successful stage is persisted before the next starts
//! - **Antifragile retries**: truncated or malformed output is retried under a larger ceiling
//! - **Durable clarification**: a stage can suspend the run until a human answers
//! - **Budget enforcement**: cumulative token usage is checked at every stage boundary
//! - **Cancellation**: observed at stage boundaries, never mid-call
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use reportflow::prelude::*;
//!
//! let chains = ChainRegistry::new();
//! chains.register(
//!     ChainBuilder::new("standard")
//!         .stage(Arc::new(intake))?
//!         .stage(Arc::new(analysis))?
//!         .stage(Arc::new(report))?
//!         .build()?,
//! )?;
//!
//! let orchestrator = Orchestrator::builder(Arc::new(chains))
//!     .with_config(OrchestratorConfig::from_env()?)
//!     .build()?;
//!
//! let run = orchestrator
//!     .trigger(TriggerEvent::new("run-1", "standard", input))
//!     .await?;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod cancellation;
pub mod checkpoint;
pub mod config;
pub mod contracts;
pub mod core;
pub mod errors;
pub mod events;
pub mod generation;
pub mod observability;
pub mod pipeline;
pub mod stages;
pub mod store;
pub mod testing;
pub mod utils;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::cancellation::{CancellationListener, CancellationToken, ExecutionRegistry};
    pub use crate::checkpoint::{Checkpoint, CheckpointStore, FileCheckpointStore, InMemoryCheckpointStore};
    pub use crate::config::{GenerationDefaults, OrchestratorConfig};
    pub use crate::contracts::{normalize_report, StageRecord};
    pub use crate::core::{
        Attachment, CancellationEvent, ClarificationAnswerEvent, ClarificationNeed, Run, RunId,
        RunStatus, StageOutcome, TokenUsage, TriggerEvent,
    };
    pub use crate::errors::{ChainError, ChainValidationError, ErrorKind};
    pub use crate::events::{EventSink, LoggingEventSink, NoOpEventSink, RunEvent, RunEventType};
    pub use crate::generation::{
        GenerationRequest, GenerationResponse, GenerativeService, JsonRecordValidator,
        SchemaValidator, TypedValidator,
    };
    pub use crate::observability::{init_tracing, LogFormat};
    pub use crate::pipeline::{
        ChainBuilder, ChainDefinition, ChainRegistry, CeilingSchedule, Orchestrator,
        OrchestratorBuilder, RetryPolicy, UsageBilling,
    };
    pub use crate::stages::{AttemptContext, FnStage, GenerativeStage, Stage, StageInput, StageProduct};
    pub use crate::store::{InMemoryRunStore, RunStore};
    pub use crate::utils::{Clock, SystemClock};
}
