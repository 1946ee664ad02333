//! Planning and running tool requests.
//!
//! [`Engine`] is the entry point. It builds a plan from the stage registry,
//! picks a strategy, runs each stage through the [`RetryController`] under
//! the execution's budget and scope, and records the [`ExecutionResult`].

mod engine;
mod executor;
mod result;
mod retry;
mod strategy;

#[cfg(test)]
mod integration_tests;

pub use crate::stages::ExecutionPlan;
pub use engine::{Engine, EngineBuilder, ExecuteOptions};
pub use result::{ExecutionError, ExecutionResult, StageAttempt};
pub use retry::{
    should_retry, BackoffStrategy, ExecutionClock, JitterStrategy, NarrowingPolicy,
    RetryConfig, RetryController, RetryDecision, RetryOutcome, RetryState,
};
pub use strategy::{resolve_strategy, ExecutionStrategy};
