//! The engine: plans, runs and records executions.

use super::executor::{Coordinator, RunSettings};
use super::result::{ExecutionError, ExecutionResult};
use super::retry::{ExecutionClock, RetryController};
use super::{resolve_strategy, ExecutionStrategy};
use crate::analytics::{PerformanceAnalytics, PerformanceReport};
use crate::cache::{CacheStats, CacheStore};
use crate::config::EngineConfig;
use crate::context::PipelineContext;
use crate::errors::EngineError;
use crate::events::{EventSink, NoOpEventSink, EXECUTION_COMPLETED, EXECUTION_STARTED};
use crate::governor::{Budget, BudgetLimits, Scope, ScopeLimits};
use crate::observability::{pipeline_span, SpanTimer};
use crate::resilience::ResilienceExecutor;
use crate::stages::StageRegistry;
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn, Instrument};
use uuid::Uuid;

/// Per-request overrides of the engine defaults.
#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    /// Budget for this execution; the configured default if unset.
    pub budget: Option<Budget>,
    /// Scope ceiling for this execution; the configured default if unset.
    pub scope: Option<Scope>,
    /// Strategy to request; the configured default if unset.
    pub strategy: Option<ExecutionStrategy>,
    /// Correlation id to carry through logs and the result.
    pub correlation_id: Option<String>,
}

impl ExecuteOptions {
    /// Options that use every engine default.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the budget.
    #[must_use]
    pub fn with_budget(mut self, budget: Budget) -> Self {
        self.budget = Some(budget);
        self
    }

    /// Sets the scope.
    #[must_use]
    pub fn with_scope(mut self, scope: Scope) -> Self {
        self.scope = Some(scope);
        self
    }

    /// Sets the strategy.
    #[must_use]
    pub fn with_strategy(mut self, strategy: ExecutionStrategy) -> Self {
        self.strategy = Some(strategy);
        self
    }

    /// Sets the correlation id.
    #[must_use]
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }
}

/// Builds an [`Engine`].
pub struct EngineBuilder {
    registry: Arc<StageRegistry>,
    config: EngineConfig,
    events: Arc<dyn EventSink>,
    cache: Option<Arc<CacheStore>>,
}

impl EngineBuilder {
    /// Starts a builder over a populated registry.
    #[must_use]
    pub fn new(registry: StageRegistry) -> Self {
        Self {
            registry: Arc::new(registry),
            config: EngineConfig::default(),
            events: Arc::new(NoOpEventSink),
            cache: None,
        }
    }

    /// Sets the configuration.
    #[must_use]
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the event sink.
    #[must_use]
    pub fn event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Uses an existing cache instead of opening one from the configuration.
    #[must_use]
    pub fn cache(mut self, cache: Arc<CacheStore>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Validates the configuration and builds the engine.
    ///
    /// # Errors
    ///
    /// Returns an error for invalid configuration or if the cache cannot be
    /// opened.
    pub fn build(self) -> Result<Engine, EngineError> {
        self.config.validate()?;
        let default_budget = self.config.execution.budget()?;
        let default_scope = self.config.execution.scope()?;

        let cache = match self.cache {
            Some(cache) => Some(cache),
            None if self.config.cache.enabled => {
                Some(Arc::new(CacheStore::from_config(&self.config.cache)?))
            }
            None => None,
        };

        let controller = RetryController::new(
            self.config.execution.retry.clone(),
            self.config.execution.narrowing,
            self.events.clone(),
        );

        info!(
            stages = self.registry.len(),
            cache = cache.is_some(),
            strategy = %self.config.execution.default_strategy,
            "Engine ready"
        );

        Ok(Engine {
            analytics: Arc::new(PerformanceAnalytics::new(self.config.analytics.clone())),
            resilience: Arc::new(ResilienceExecutor::from_policies(
                self.config.resilience.clone(),
            )),
            registry: self.registry,
            config: self.config,
            default_budget,
            default_scope,
            cache,
            events: self.events,
            controller,
        })
    }
}

/// Runs tool requests against a fixed set of stages.
///
/// One engine serves many concurrent executions; each execution owns its
/// context, budget and scope.
pub struct Engine {
    registry: Arc<StageRegistry>,
    config: EngineConfig,
    default_budget: Budget,
    default_scope: Scope,
    cache: Option<Arc<CacheStore>>,
    analytics: Arc<PerformanceAnalytics>,
    resilience: Arc<ResilienceExecutor>,
    events: Arc<dyn EventSink>,
    controller: RetryController,
}

impl Engine {
    /// Starts a builder.
    #[must_use]
    pub fn builder(registry: StageRegistry) -> EngineBuilder {
        EngineBuilder::new(registry)
    }

    /// Builds an engine with the given configuration and no event sink.
    ///
    /// # Errors
    ///
    /// See [`EngineBuilder::build`].
    pub fn new(registry: StageRegistry, config: EngineConfig) -> Result<Self, EngineError> {
        EngineBuilder::new(registry).config(config).build()
    }

    /// The configuration the engine was built with.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The stage registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<StageRegistry> {
        &self.registry
    }

    /// The result cache, if enabled.
    #[must_use]
    pub fn cache(&self) -> Option<&Arc<CacheStore>> {
        self.cache.as_ref()
    }

    /// Resilience executor configured from the engine's policies.
    #[must_use]
    pub fn resilience(&self) -> &Arc<ResilienceExecutor> {
        &self.resilience
    }

    /// Starts the periodic TTL sweep of the cache.
    ///
    /// Must be called inside a Tokio runtime.
    pub fn spawn_cache_sweeper(&self) -> Option<tokio::task::JoinHandle<()>> {
        let every = self.config.cache.sweep_interval();
        if every.is_zero() {
            return None;
        }
        self.cache.as_ref().map(|cache| cache.spawn_sweeper(every))
    }

    /// Executes a tool request.
    ///
    /// Never fails: unknown tools and every stage failure are reported in
    /// the returned result.
    pub async fn execute(
        &self,
        tool: &str,
        input: serde_json::Value,
        options: ExecuteOptions,
    ) -> ExecutionResult {
        let requested = options
            .strategy
            .unwrap_or(self.config.execution.default_strategy);

        let plan = match self.registry.build_plan(tool) {
            Ok(plan) => plan,
            Err(e) => {
                warn!(tool = %tool, error = %e, "Request rejected");
                return self.reject(tool, requested, ExecutionError::request(e.to_string()));
            }
        };

        let budget = options.budget.unwrap_or(self.default_budget);
        let scope = options.scope.unwrap_or_else(|| self.default_scope.clone());
        let tolerance = self.config.execution.contention_tolerance;
        let resolved = resolve_strategy(requested, &plan, |ids| {
            self.analytics.is_order_independent(ids, tolerance)
        });

        let mut ctx = PipelineContext::new(tool, input);
        if let Some(correlation_id) = options.correlation_id {
            ctx = ctx.with_correlation_id(correlation_id);
        }
        let execution_id = ctx.request_id();
        let correlation_id = ctx.correlation_id().to_string();
        let span = pipeline_span(tool, &execution_id.to_string(), &resolved.to_string());

        async move {
            let started_at = Utc::now();
            let timer = SpanTimer::start(format!("execution:{tool}"));
            info!(
                correlation_id = %correlation_id,
                requested = %requested,
                stages = plan.len(),
                "Execution started"
            );
            self.events
                .emit(
                    EXECUTION_STARTED,
                    Some(json!({
                        "execution_id": execution_id,
                        "tool": tool,
                        "strategy": requested,
                        "resolved_strategy": resolved,
                        "plan": plan.order(),
                    })),
                )
                .await;

            let settings = RunSettings {
                strategy: resolved,
                use_cache: requested.uses_cache(),
                max_concurrent: self.config.execution.max_concurrent_stages,
                scope,
                controller: self.controller.clone(),
                events: self.events.clone(),
                cache: self.cache.clone(),
            };
            let clock = ExecutionClock::start(budget.time_remaining());
            let report = Coordinator::new(&plan, settings, ctx, budget, clock)
                .run()
                .await;

            let result = ExecutionResult {
                execution_id,
                correlation_id,
                tool: tool.to_string(),
                strategy: requested,
                resolved_strategy: resolved,
                success: report.all_succeeded(),
                stages_executed: report.stages_executed,
                stage_states: report.states,
                attempts: report.attempts,
                errors: report.errors,
                budget_used: report.budget_used,
                duration_ms: timer.finish(),
                plan: plan.order().to_vec(),
                outputs: report.outputs,
                started_at,
            };

            info!(
                success = result.success,
                stages_executed = result.stages_executed.len(),
                errors = result.errors.len(),
                duration_ms = result.duration_ms,
                "Execution completed"
            );
            self.events
                .emit(
                    EXECUTION_COMPLETED,
                    Some(json!({
                        "execution_id": execution_id,
                        "success": result.success,
                        "duration_ms": result.duration_ms,
                        "stages_executed": result.stages_executed,
                    })),
                )
                .await;

            self.analytics.record(&result);
            result
        }
        .instrument(span)
        .await
    }

    /// Executes a request whose limits arrive as loosely-typed payloads.
    ///
    /// Invalid limits produce a failed result with a validation error.
    pub async fn execute_with_limits(
        &self,
        tool: &str,
        input: serde_json::Value,
        budget: BudgetLimits,
        scope: ScopeLimits,
        strategy: Option<ExecutionStrategy>,
    ) -> ExecutionResult {
        let requested = strategy.unwrap_or(self.config.execution.default_strategy);
        let limits = budget
            .into_budget(&self.default_budget)
            .and_then(|b| scope.into_scope(&self.default_scope).map(|s| (b, s)));

        match limits {
            Ok((budget, scope)) => {
                let options = ExecuteOptions {
                    budget: Some(budget),
                    scope: Some(scope),
                    strategy: Some(requested),
                    correlation_id: None,
                };
                self.execute(tool, input, options).await
            }
            Err(e) => {
                warn!(tool = %tool, error = %e, "Invalid request limits");
                self.reject(tool, requested, ExecutionError::request(e.to_string()))
            }
        }
    }

    fn reject(
        &self,
        tool: &str,
        strategy: ExecutionStrategy,
        error: ExecutionError,
    ) -> ExecutionResult {
        let result = ExecutionResult::rejected(tool, strategy, error);
        self.analytics.record(&result);
        result
    }

    /// Most recent results, newest first.
    #[must_use]
    pub fn get_execution_history(&self, limit: usize) -> Vec<ExecutionResult> {
        self.analytics.history(limit)
    }

    /// Aggregated performance over the recorded executions.
    #[must_use]
    pub fn get_performance_analytics(&self) -> PerformanceReport {
        self.analytics.report()
    }

    /// Cache statistics, or `None` when the cache is disabled.
    #[must_use]
    pub fn get_cache_stats(&self) -> Option<CacheStats> {
        self.cache.as_ref().map(|cache| cache.stats())
    }

    /// The stored result of a past execution, unchanged.
    #[must_use]
    pub fn replay_execution(&self, execution_id: Uuid) -> Option<ExecutionResult> {
        self.analytics.replay(execution_id)
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("stages", &self.registry.len())
            .field("cache", &self.cache.is_some())
            .field("strategy", &self.config.execution.default_strategy)
            .finish_non_exhaustive()
    }
}
