//! Mutable execution contexts for pipeline and stage execution.

use super::StageInputs;
use crate::cache::CacheStore;
use crate::cancellation::CancellationToken;
use crate::core::StageOutput;
use crate::governor::{Budget, Scope};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use uuid::Uuid;

/// The per-request context of one pipeline execution.
///
/// Owned exclusively by one execution; stage outputs accumulate here as
/// stages succeed.
#[derive(Debug, Clone)]
pub struct PipelineContext {
    request_id: Uuid,
    tool: String,
    input: Arc<serde_json::Value>,
    correlation_id: String,
    created_at: DateTime<Utc>,
    outputs: HashMap<String, StageOutput>,
}

impl PipelineContext {
    /// Creates a new pipeline context with a fresh request id.
    ///
    /// The correlation id defaults to the request id.
    #[must_use]
    pub fn new(tool: impl Into<String>, input: serde_json::Value) -> Self {
        let request_id = Uuid::new_v4();
        Self {
            request_id,
            tool: tool.into(),
            input: Arc::new(input),
            correlation_id: request_id.to_string(),
            created_at: Utc::now(),
            outputs: HashMap::new(),
        }
    }

    /// Sets the correlation id supplied by the caller.
    #[must_use]
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = correlation_id.into();
        self
    }

    /// Returns the request id.
    #[must_use]
    pub fn request_id(&self) -> Uuid {
        self.request_id
    }

    /// Returns the tool name.
    #[must_use]
    pub fn tool(&self) -> &str {
        &self.tool
    }

    /// Returns the request payload.
    #[must_use]
    pub fn input(&self) -> &serde_json::Value {
        &self.input
    }

    /// Returns the correlation id.
    #[must_use]
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    /// Returns when the context was created.
    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Records the output of a succeeded stage.
    pub fn record_output(&mut self, stage_id: impl Into<String>, output: StageOutput) {
        self.outputs.insert(stage_id.into(), output);
    }

    /// Returns the output of a stage, if it succeeded.
    #[must_use]
    pub fn output(&self, stage_id: &str) -> Option<&StageOutput> {
        self.outputs.get(stage_id)
    }

    /// Returns all recorded outputs.
    #[must_use]
    pub fn outputs(&self) -> &HashMap<String, StageOutput> {
        &self.outputs
    }

    /// Consumes the context, returning the recorded outputs.
    #[must_use]
    pub fn into_outputs(self) -> HashMap<String, StageOutput> {
        self.outputs
    }

    /// Builds the dependency-scoped inputs for a stage.
    #[must_use]
    pub fn inputs_for(&self, stage_id: &str, dependencies: &HashSet<String>) -> StageInputs {
        let outputs: BTreeMap<String, StageOutput> = dependencies
            .iter()
            .filter_map(|dep| self.outputs.get(dep).map(|o| (dep.clone(), o.clone())))
            .collect();
        StageInputs::new(outputs, stage_id)
    }

    /// Creates the context for the first attempt of a stage.
    #[must_use]
    pub fn stage_context(
        &self,
        stage_id: &str,
        dependencies: &HashSet<String>,
        cancel: Arc<CancellationToken>,
    ) -> StageContext {
        StageContext {
            request_id: self.request_id,
            correlation_id: self.correlation_id.clone(),
            tool: self.tool.clone(),
            input: self.input.clone(),
            stage_id: stage_id.to_string(),
            attempt: 1,
            inputs: self.inputs_for(stage_id, dependencies),
            scope: Scope::default(),
            budget: Budget::default(),
            cancel,
            cache: None,
        }
    }
}

/// The read-only context for a single stage attempt.
#[derive(Clone)]
pub struct StageContext {
    request_id: Uuid,
    correlation_id: String,
    tool: String,
    input: Arc<serde_json::Value>,
    stage_id: String,
    attempt: u32,
    inputs: StageInputs,
    scope: Scope,
    budget: Budget,
    cancel: Arc<CancellationToken>,
    cache: Option<Arc<CacheStore>>,
}

impl StageContext {
    /// Returns a copy for the given attempt, with its narrowed scope and budget.
    #[must_use]
    pub fn for_attempt(&self, attempt: u32, scope: Scope, budget: Budget) -> Self {
        Self {
            attempt,
            scope,
            budget,
            ..self.clone()
        }
    }

    /// Injects the shared result cache.
    #[must_use]
    pub fn with_cache(mut self, cache: Option<Arc<CacheStore>>) -> Self {
        self.cache = cache;
        self
    }

    /// Returns the request id.
    #[must_use]
    pub fn request_id(&self) -> Uuid {
        self.request_id
    }

    /// Returns the correlation id.
    #[must_use]
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    /// Returns the tool name.
    #[must_use]
    pub fn tool(&self) -> &str {
        &self.tool
    }

    /// Returns the request payload.
    #[must_use]
    pub fn input(&self) -> &serde_json::Value {
        &self.input
    }

    /// Returns the stage id.
    #[must_use]
    pub fn stage_id(&self) -> &str {
        &self.stage_id
    }

    /// Returns the 1-based attempt number.
    #[must_use]
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Returns the outputs of declared dependencies.
    #[must_use]
    pub fn inputs(&self) -> &StageInputs {
        &self.inputs
    }

    /// Returns the scope this attempt must stay within.
    #[must_use]
    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    /// Returns the budget allowance for this attempt.
    #[must_use]
    pub fn budget(&self) -> &Budget {
        &self.budget
    }

    /// Returns the shared result cache, if one was injected.
    #[must_use]
    pub fn cache(&self) -> Option<&Arc<CacheStore>> {
        self.cache.as_ref()
    }

    /// Returns the execution's cancellation token.
    #[must_use]
    pub fn cancellation(&self) -> &Arc<CancellationToken> {
        &self.cancel
    }

    /// Checks if the execution has been cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl std::fmt::Debug for StageContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageContext")
            .field("request_id", &self.request_id)
            .field("tool", &self.tool)
            .field("stage_id", &self.stage_id)
            .field("attempt", &self.attempt)
            .field("scope", &self.scope)
            .field("budget", &self.budget)
            .finish_non_exhaustive()
    }
}
