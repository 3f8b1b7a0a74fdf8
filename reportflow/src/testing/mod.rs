//! Testing utilities for reportflow chains.
//!
//! This module provides:
//! - Scripted stages and generative services
//! - Assertions on run records
//! - A harness wiring the orchestrator to in-memory collaborators

mod assertions;
mod fixtures;
mod mocks;

pub use assertions::{assert_run_complete, assert_run_failed, assert_run_status, assert_stage_usage};
pub use fixtures::{TestHarness, TEST_VARIANT};
pub use mocks::{ScriptedGenerator, ScriptedStage};

pub use crate::utils::ManualClock;
