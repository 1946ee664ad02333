//! Execution results and per-attempt records.

use super::ExecutionStrategy;
use crate::core::{StageOutput, StageState};
use crate::errors::{ErrorKind, StageError};
use crate::governor::{Budget, ResourceUsage, Scope};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// A serializable record of one stage failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionError {
    /// The failing stage; empty for request-level failures.
    pub stage_id: String,
    /// Failure class.
    pub kind: ErrorKind,
    /// Human-readable message.
    pub message: String,
    /// Attempt that produced the error; 0 if the stage never ran.
    pub attempt: u32,
}

impl ExecutionError {
    /// Records a stage error.
    #[must_use]
    pub fn from_stage_error(stage_id: impl Into<String>, attempt: u32, error: &StageError) -> Self {
        Self {
            stage_id: stage_id.into(),
            kind: error.kind(),
            message: error.to_string(),
            attempt,
        }
    }

    /// Records a request-level validation failure.
    #[must_use]
    pub fn request(message: impl Into<String>) -> Self {
        Self {
            stage_id: String::new(),
            kind: ErrorKind::Validation,
            message: message.into(),
            attempt: 0,
        }
    }
}

/// One attempt of one stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageAttempt {
    /// The stage id.
    pub stage_id: String,
    /// 1-based attempt number.
    pub attempt: u32,
    /// Start, relative to the execution start.
    pub started_offset_ms: f64,
    /// End, relative to the execution start.
    pub ended_offset_ms: f64,
    /// Scope the attempt ran under.
    pub scope: Scope,
    /// Chunks the attempt was allowed to consume.
    pub chunk_allowance: u64,
    /// Resources the attempt reported.
    #[serde(default)]
    pub usage: ResourceUsage,
    /// Whether the output came from the result cache.
    #[serde(default)]
    pub cache_hit: bool,
    /// The failure, if the attempt failed.
    #[serde(default)]
    pub error: Option<ExecutionError>,
}

impl StageAttempt {
    /// Wall time spent in the attempt.
    #[must_use]
    pub fn duration_ms(&self) -> f64 {
        (self.ended_offset_ms - self.started_offset_ms).max(0.0)
    }

    /// Returns true if the attempt succeeded.
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// The outcome of one pipeline execution.
///
/// Produced once and never mutated; the engine keeps a copy in its history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Unique execution id.
    pub execution_id: Uuid,
    /// Correlation id supplied by the caller, or the execution id.
    pub correlation_id: String,
    /// The tool that was executed.
    pub tool: String,
    /// Requested strategy.
    pub strategy: ExecutionStrategy,
    /// Strategy that actually ran (sequential or parallel).
    pub resolved_strategy: ExecutionStrategy,
    /// True only if every planned stage succeeded.
    pub success: bool,
    /// Stages that started, in start order, each listed once.
    pub stages_executed: Vec<String>,
    /// Final state of every planned stage.
    pub stage_states: BTreeMap<String, StageState>,
    /// Every attempt, retries included.
    pub attempts: Vec<StageAttempt>,
    /// Every recorded failure.
    pub errors: Vec<ExecutionError>,
    /// Resources consumed, as a budget-shaped snapshot.
    pub budget_used: Budget,
    /// Wall time of the whole execution.
    pub duration_ms: f64,
    /// Stage ids of the plan, in plan order.
    pub plan: Vec<String>,
    /// Outputs of succeeded stages.
    pub outputs: BTreeMap<String, StageOutput>,
    /// When the execution started.
    pub started_at: DateTime<Utc>,
}

impl ExecutionResult {
    /// A failed result for a request that never reached planning or running.
    #[must_use]
    pub fn rejected(
        tool: impl Into<String>,
        strategy: ExecutionStrategy,
        error: ExecutionError,
    ) -> Self {
        let execution_id = Uuid::new_v4();
        Self {
            execution_id,
            correlation_id: execution_id.to_string(),
            tool: tool.into(),
            strategy,
            resolved_strategy: ExecutionStrategy::Sequential,
            success: false,
            stages_executed: Vec::new(),
            stage_states: BTreeMap::new(),
            attempts: Vec::new(),
            errors: vec![error],
            budget_used: Budget::zero(),
            duration_ms: 0.0,
            plan: Vec::new(),
            outputs: BTreeMap::new(),
            started_at: Utc::now(),
        }
    }

    /// Final state of a stage.
    #[must_use]
    pub fn stage_state(&self, stage_id: &str) -> Option<StageState> {
        self.stage_states.get(stage_id).copied()
    }

    /// Attempts of a stage, in order.
    #[must_use]
    pub fn attempts_for(&self, stage_id: &str) -> Vec<&StageAttempt> {
        self.attempts.iter().filter(|a| a.stage_id == stage_id).collect()
    }

    /// The last recorded error of a stage.
    #[must_use]
    pub fn error_for(&self, stage_id: &str) -> Option<&ExecutionError> {
        self.errors.iter().rev().find(|e| e.stage_id == stage_id)
    }

    /// Returns true if the stage was served from the cache.
    #[must_use]
    pub fn is_cache_hit(&self, stage_id: &str) -> bool {
        self.attempts
            .iter()
            .any(|a| a.stage_id == stage_id && a.cache_hit)
    }

    /// Output of a succeeded stage.
    #[must_use]
    pub fn output(&self, stage_id: &str) -> Option<&StageOutput> {
        self.outputs.get(stage_id)
    }
}
