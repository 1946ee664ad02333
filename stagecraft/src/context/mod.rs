//! Context management for pipeline execution.
//!
//! This module provides:
//! - The per-request pipeline context that accumulates stage outputs
//! - The per-attempt stage context handed to `Stage::execute`
//! - Dependency-scoped views of prior stage outputs

mod execution;
mod inputs;

pub use execution::{PipelineContext, StageContext};
pub use inputs::StageInputs;
