//! Error types for the stagecraft engine.
//!
//! Expected failure modes of a stage are carried as [`StageError`] values and
//! end up inside an `ExecutionResult`; only programmer errors (bad stage
//! registration, invalid configuration) surface as `Err` from the API.

use crate::governor::{BudgetDimension, ScopeViolation};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// The umbrella error type for stagecraft operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Stage registration or planning failed.
    #[error("{0}")]
    Registry(#[from] RegistryError),

    /// A stage failed.
    #[error("{0}")]
    Stage(#[from] StageError),

    /// The result cache failed internally.
    #[error("{0}")]
    Cache(#[from] CacheError),

    /// The configuration is invalid.
    #[error("{0}")]
    Config(#[from] ConfigError),

    /// A generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised while registering stages or building a plan.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// A stage with the same id is already registered.
    #[error("Duplicate stage: '{id}' is already registered")]
    DuplicateStage {
        /// The duplicated stage id.
        id: String,
    },

    /// A stage depends on an id that is not registered.
    #[error("Stage '{stage}' depends on unknown stage '{dependency}'")]
    UnknownDependency {
        /// The stage declaring the dependency.
        stage: String,
        /// The missing dependency.
        dependency: String,
    },

    /// A stage lists itself as a dependency.
    #[error("Stage '{id}' cannot depend on itself")]
    SelfDependency {
        /// The offending stage id.
        id: String,
    },

    /// The dependency graph contains a cycle.
    #[error("Cyclic dependency: {}", cycle.join(" -> "))]
    CyclicDependency {
        /// Stages forming the cycle, first element repeated at the end.
        cycle: Vec<String>,
    },

    /// No registered stage serves the requested tool.
    #[error("No stages registered for tool '{tool}'")]
    NoStagesForTool {
        /// The requested tool.
        tool: String,
    },
}

/// Classification of a stage failure, used in execution records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed stage input.
    Validation,
    /// The time budget ran out.
    Timeout,
    /// A non-time budget dimension ran out.
    BudgetExceeded,
    /// A proposed edit fell outside the scope.
    ScopeViolation,
    /// An external failure inside the stage.
    StageExecution,
    /// A required upstream stage never succeeded.
    DependencyFailed,
    /// The stage was cancelled because the execution was aborted.
    Cancelled,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Validation => "validation",
            Self::Timeout => "timeout",
            Self::BudgetExceeded => "budget_exceeded",
            Self::ScopeViolation => "scope_violation",
            Self::StageExecution => "stage_execution",
            Self::DependencyFailed => "dependency_failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Failure of a single stage attempt.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StageError {
    /// Malformed stage input. Never retried.
    #[error("Validation error: {0}")]
    Validation(String),

    /// The execution deadline passed while the stage was running.
    #[error("Stage '{stage}' timed out after {elapsed_ms} ms")]
    Timeout {
        /// The stage id.
        stage: String,
        /// Time spent in the attempt before the deadline hit.
        elapsed_ms: u64,
    },

    /// A budget dimension would have gone negative.
    #[error("Budget exceeded: {dimension} requested {requested}, remaining {remaining}")]
    BudgetExceeded {
        /// The exhausted dimension.
        dimension: BudgetDimension,
        /// Amount that was requested.
        requested: u64,
        /// Amount that was left.
        remaining: u64,
    },

    /// A proposed edit violated one or more scope rules.
    #[error("Scope violation: {}", format_violations(violations))]
    ScopeViolation {
        /// Every violated rule.
        violations: Vec<ScopeViolation>,
    },

    /// An external failure; retried with a narrowed scope.
    #[error("Stage execution error: {0}")]
    Execution(String),

    /// A dependency of the stage failed permanently.
    #[error("Stage '{stage}' not run: dependency '{dependency}' failed")]
    DependencyFailed {
        /// The stage that was not run.
        stage: String,
        /// The failed dependency.
        dependency: String,
    },

    /// The execution was aborted while the stage was running or pending.
    #[error("Stage cancelled: {0}")]
    Cancelled(String),
}

fn format_violations(violations: &[ScopeViolation]) -> String {
    violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl StageError {
    /// Creates a retryable execution error.
    #[must_use]
    pub fn execution(message: impl Into<String>) -> Self {
        Self::Execution(message.into())
    }

    /// Creates a validation error.
    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Returns true if the retry controller may retry this error.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Execution(_))
    }

    /// Returns true if the error ends the whole execution, not just the stage.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::BudgetExceeded { .. })
    }

    /// Returns the serializable kind of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::BudgetExceeded { .. } => ErrorKind::BudgetExceeded,
            Self::ScopeViolation { .. } => ErrorKind::ScopeViolation,
            Self::Execution(_) => ErrorKind::StageExecution,
            Self::DependencyFailed { .. } => ErrorKind::DependencyFailed,
            Self::Cancelled(_) => ErrorKind::Cancelled,
        }
    }
}

/// Internal result-cache failures. These never reach cache callers.
#[derive(Debug, Error)]
pub enum CacheError {
    /// The persistent store could not be read or written.
    #[error("Cache storage error: {0}")]
    Storage(String),

    /// A persisted entry could not be decoded.
    #[error("Corrupted cache entry '{key}': {reason}")]
    Corruption {
        /// The affected key.
        key: String,
        /// Why decoding failed.
        reason: String,
    },

    /// A value could not be (de)serialized.
    #[error("Cache serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[cfg(feature = "sqlite")]
impl From<rusqlite::Error> for CacheError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

/// Invalid configuration, budget or scope values.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// A numeric limit was negative.
    #[error("'{field}' must not be negative (got {value})")]
    Negative {
        /// The offending field.
        field: &'static str,
        /// The supplied value.
        value: i64,
    },

    /// A limit that must be positive was zero.
    #[error("'{field}' must be at least 1")]
    Zero {
        /// The offending field.
        field: &'static str,
    },

    /// A value was outside its allowed range.
    #[error("'{field}' is out of range: {reason}")]
    OutOfRange {
        /// The offending field.
        field: &'static str,
        /// Why the value was rejected.
        reason: String,
    },

    /// The configuration source could not be parsed.
    #[error("Failed to parse configuration: {0}")]
    Parse(String),
}
