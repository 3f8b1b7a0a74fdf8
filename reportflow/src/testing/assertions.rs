//! Test assertions for runs.

use crate::core::{Run, RunStatus, TokenUsage};
use crate::errors::ErrorKind;

/// Asserts that the run has the expected status.
pub fn assert_run_status(run: &Run, expected: RunStatus) {
    assert_eq!(
        run.status, expected,
        "Expected run '{}' to be {}, got {} (error: {:?})",
        run.id, expected, run.status, run.error
    );
}

/// Asserts that the run completed with an artifact and no error.
pub fn assert_run_complete(run: &Run) {
    assert_run_status(run, RunStatus::Complete);
    assert!(
        run.final_artifact.is_some(),
        "Expected run '{}' to carry a final artifact",
        run.id
    );
    assert!(run.error.is_none(), "Completed run '{}' has an error", run.id);
    assert!(run.finished_at.is_some(), "Completed run '{}' has no finish time", run.id);
}

/// Asserts that the run failed with the expected error kind.
pub fn assert_run_failed(run: &Run, kind: ErrorKind) {
    assert_run_status(run, RunStatus::Failed);
    let error = run
        .error
        .as_ref()
        .unwrap_or_else(|| panic!("Failed run '{}' has no error", run.id));
    assert_eq!(
        error.kind, kind,
        "Expected run '{}' to fail with {kind}, got {} ({})",
        run.id, error.kind, error.message
    );
    assert!(!error.message.is_empty(), "Failed run '{}' has an empty message", run.id);
    assert!(run.final_artifact.is_none(), "Failed run '{}' has an artifact", run.id);
}

/// Asserts the usage recorded against a stage.
pub fn assert_stage_usage(run: &Run, stage: &str, expected: TokenUsage) {
    let actual = run.usage.stage_usage(stage);
    assert_eq!(
        actual,
        Some(expected),
        "Expected usage {expected:?} for stage '{stage}', got {actual:?}"
    );
}
