//! Test assertions for execution results.

use crate::core::StageState;
use crate::errors::ErrorKind;
use crate::pipeline::ExecutionResult;

/// Asserts that every planned stage succeeded.
pub fn assert_execution_succeeded(result: &ExecutionResult) {
    assert!(
        result.success,
        "Expected success, got errors: {:?}",
        result.errors
    );
}

/// Asserts that the execution failed.
pub fn assert_execution_failed(result: &ExecutionResult) {
    assert!(
        !result.success,
        "Expected failure, got states: {:?}",
        result.stage_states
    );
}

/// Asserts the final state of a stage.
pub fn assert_stage_state(result: &ExecutionResult, stage_id: &str, expected: StageState) {
    assert_eq!(
        result.stage_state(stage_id),
        Some(expected),
        "Unexpected state for stage '{stage_id}'"
    );
}

/// Asserts that a stage recorded an error of the given kind.
pub fn assert_error_kind(result: &ExecutionResult, stage_id: &str, expected: ErrorKind) {
    let error = result
        .error_for(stage_id)
        .unwrap_or_else(|| panic!("Expected an error for stage '{stage_id}', got {:?}", result.errors));
    assert_eq!(error.kind, expected, "Unexpected error kind for '{stage_id}'");
}

/// Asserts that `stage` started only after `dependency` ended.
pub fn assert_starts_after(result: &ExecutionResult, stage: &str, dependency: &str) {
    let dep_end = result
        .attempts_for(dependency)
        .iter()
        .map(|a| a.ended_offset_ms)
        .fold(f64::MIN, f64::max);
    let start = result
        .attempts_for(stage)
        .first()
        .map(|a| a.started_offset_ms)
        .unwrap_or_else(|| panic!("Stage '{stage}' never started"));
    assert!(
        start >= dep_end,
        "Stage '{stage}' started at {start} ms before '{dependency}' ended at {dep_end} ms"
    );
}
