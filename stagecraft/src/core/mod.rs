//! Core domain model types for stagecraft.
//!
//! This module contains the fundamental types used throughout the engine:
//! - Stage lifecycle states
//! - Stage output type with factory methods

mod output;
mod status;

pub use output::StageOutput;
pub use status::StageState;
