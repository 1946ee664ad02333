//! Testing utilities for stagecraft engines.
//!
//! This module provides:
//! - Scripted, flaky and slow stages
//! - A concurrency probe for parallel execution
//! - Budget, scope and configuration fixtures
//! - Assertions over execution results

mod assertions;
mod fixtures;
mod mocks;

pub use assertions::{
    assert_error_kind, assert_execution_failed, assert_execution_succeeded,
    assert_stage_state, assert_starts_after,
};
pub use fixtures::{budget_fixture, engine_config, fast_retry, registry_with, scope_fixture};
pub use mocks::{
    ConcurrencyProbe, FlakyStage, ProbeEvent, ProbeStage, ScriptedStage, SeenAttempt, SlowStage,
};
