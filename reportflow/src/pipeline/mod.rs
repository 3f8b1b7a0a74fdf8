//! Chain definition and execution.
//!
//! This module provides:
//! - Chain variants and their registry
//! - The antifragile retry wrapper and its ceiling schedules
//! - Checkpoint-aware stage execution
//! - Budget, clarification, progress and completion components
//! - The generic orchestrator that drives runs

mod budget;
mod chain;
mod clarification;
mod executor;
mod finalizer;
mod orchestrator;
mod progress;
mod retry;

#[cfg(test)]
mod integration_tests;

pub use budget::BudgetGuard;
pub use chain::{ChainBuilder, ChainDefinition, ChainRegistry};
pub use clarification::{AnswerDecision, ClarificationGate};
pub use executor::StageExecutor;
pub use finalizer::{CompletionFinalizer, FinalizeOutcome, NoOpBilling, UsageBilling};
pub use orchestrator::{Orchestrator, OrchestratorBuilder};
pub use progress::ProgressReporter;
pub use retry::{
    run_with_antifragile_retry, AttemptSummary, BackoffStrategy, CeilingSchedule, JitterStrategy,
    RetryAttempt, RetryFailure, RetryPolicy,
};
