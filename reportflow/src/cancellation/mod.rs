//! Cooperative cancellation and execution tracking.
//!
//! This module provides:
//! - `CancellationToken`, a first-reason-wins cancel flag
//! - `CancellationListener`, the per-run token map polled at stage boundaries
//! - `ExecutionRegistry`, an injected counter of in-flight run drives

mod listener;
mod registry;
mod token;

pub use listener::CancellationListener;
pub use registry::{ExecutionGuard, ExecutionRegistry};
pub use token::CancellationToken;
