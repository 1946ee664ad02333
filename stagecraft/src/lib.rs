//! # Stagecraft
//!
//! A pipeline execution engine for developer-assistant tools.
//!
//! A tool request is answered by running a registered set of stages in
//! dependency order under a consumable budget and an edit scope:
//!
//! - **Stage registry**: stages declare dependencies; plans are validated
//!   and topologically ordered per tool
//! - **Budget and scope governor**: time, tokens, chunks and files are
//!   charged as stages report usage; proposed edits are checked against
//!   the scope
//! - **Retry with narrowing**: failed attempts are retried with a smaller
//!   scope and chunk allowance each time
//! - **Strategies**: sequential, parallel, adaptive, and optimized
//!   (adaptive plus a two-tier result cache with single-flight)
//! - **Analytics**: execution history, replay and per-stage performance
//!   reports
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use stagecraft::prelude::*;
//!
//! let mut registry = StageRegistry::new();
//! registry.register(Arc::new(RetrieveDocs::new()))?;
//! registry.register(Arc::new(ProposeFix::new()))?;
//!
//! let engine = Engine::new(registry, EngineConfig::default())?;
//! let result = engine
//!     .execute("fix", json!({"path": "src/lib.rs"}), ExecuteOptions::new())
//!     .await;
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

pub mod analytics;
pub mod cache;
pub mod cancellation;
pub mod config;
pub mod context;
pub mod core;
pub mod errors;
pub mod events;
pub mod governor;
pub mod observability;
pub mod pipeline;
pub mod resilience;
pub mod stages;
pub mod testing;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::analytics::{PerformanceReport, StageStats};
    pub use crate::cache::{CacheStats, CacheStore};
    pub use crate::config::EngineConfig;
    pub use crate::context::{PipelineContext, StageContext, StageInputs};
    pub use crate::core::{StageOutput, StageState};
    pub use crate::errors::{EngineError, ErrorKind, RegistryError, StageError};
    pub use crate::events::{EventSink, LoggingEventSink, NoOpEventSink};
    pub use crate::governor::{
        Budget, BudgetLimits, FileEdit, ProposedEdit, ResourceUsage, Scope, ScopeLimits,
    };
    pub use crate::pipeline::{
        Engine, ExecuteOptions, ExecutionError, ExecutionResult, ExecutionStrategy,
        NarrowingPolicy, RetryConfig,
    };
    pub use crate::resilience::{ResilienceExecutor, ResiliencePolicy};
    pub use crate::stages::{Stage, StageDescriptor, StageRegistry};
}
