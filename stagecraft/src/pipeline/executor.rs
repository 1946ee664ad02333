//! Runs an execution plan sequentially or in parallel.
//!
//! The coordinator owns the execution's budget, stage states and records.
//! Stage attempts run in [`StageTask`]s that only see a snapshot of the
//! budget; the coordinator charges what they report when they finish.

use super::result::{ExecutionError, StageAttempt};
use super::retry::{ExecutionClock, RetryController, RetryOutcome};
use super::ExecutionStrategy;
use crate::cache::{stage_cache_key, CacheLookup, CacheStore};
use crate::cancellation::CancellationToken;
use crate::context::{PipelineContext, StageContext};
use crate::core::{StageOutput, StageState};
use crate::errors::{ErrorKind, StageError};
use crate::events::{
    EventSink, CACHE_HIT, CACHE_MISS, STAGE_COMPLETED, STAGE_FAILED, STAGE_SKIPPED, STAGE_STARTED,
};
use crate::governor::{Budget, BudgetDimension, ResourceUsage, Scope};
use crate::observability::{stage_span, SpanTimer};
use crate::stages::{ExecutionPlan, Stage};
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn, Instrument};

/// Everything the coordinator recorded about one run of a plan.
#[derive(Debug)]
pub(crate) struct RunReport {
    pub states: BTreeMap<String, StageState>,
    pub stages_executed: Vec<String>,
    pub attempts: Vec<StageAttempt>,
    pub errors: Vec<ExecutionError>,
    pub budget_used: Budget,
    pub outputs: BTreeMap<String, StageOutput>,
}

impl RunReport {
    pub(crate) fn all_succeeded(&self) -> bool {
        !self.states.is_empty() && self.states.values().all(|s| *s == StageState::Succeeded)
    }
}

/// What a finished stage task hands back to the coordinator.
struct StageRun {
    stage_id: String,
    outcome: RetryOutcome,
    cache_hit: bool,
    duration_ms: f64,
}

/// One stage, ready to run on its own task.
struct StageTask {
    stage: Arc<dyn Stage>,
    ctx: StageContext,
    scope: Scope,
    allowance: Budget,
    clock: ExecutionClock,
    controller: RetryController,
    cache: Option<Arc<CacheStore>>,
    events: Arc<dyn EventSink>,
}

impl StageTask {
    async fn run(self) -> StageRun {
        let stage_id = self.ctx.stage_id().to_string();
        let timer = SpanTimer::start(stage_id.clone());

        let claim = match &self.cache {
            Some(cache) => match self.lookup(cache).await {
                Ok(run) => return run,
                Err(claim) => claim,
            },
            None => None,
        };

        let outcome = self
            .controller
            .run_with_retry(
                self.stage.as_ref(),
                &self.ctx,
                self.scope.clone(),
                self.allowance,
                self.clock,
            )
            .await;

        if let (Some(claim), Ok(output)) = (claim, &outcome.result) {
            match serde_json::to_vec(output) {
                Ok(bytes) => {
                    let tags: BTreeSet<String> = [
                        format!("tool:{}", self.ctx.tool()),
                        format!("stage:{stage_id}"),
                    ]
                    .into_iter()
                    .collect();
                    claim.fulfil(bytes, Duration::ZERO, tags);
                }
                Err(e) => warn!(stage = %stage_id, error = %e, "Stage output not cacheable"),
            }
        }

        StageRun {
            stage_id,
            outcome,
            cache_hit: false,
            duration_ms: timer.finish(),
        }
    }

    /// Serves the stage from the cache, or returns the claim to fill.
    ///
    /// Waiting on another execution's claim is bounded by this execution's
    /// deadline and cancellation; either ends the stage with a failed run.
    async fn lookup(
        &self,
        cache: &CacheStore,
    ) -> Result<StageRun, Option<crate::cache::CacheClaim>> {
        let stage_id = self.ctx.stage_id();
        let key = stage_cache_key(self.ctx.tool(), stage_id, self.ctx.input(), self.ctx.inputs());
        let started = tokio::time::Instant::now();

        let waited = tokio::select! {
            biased;
            () = self.ctx.cancellation().cancelled() => Err(StageError::Cancelled(
                self.ctx.cancellation().reason().unwrap_or_default(),
            )),
            found = tokio::time::timeout(self.clock.remaining(), cache.get(&key)) => {
                found.map_err(|_| StageError::Timeout {
                    stage: stage_id.to_string(),
                    elapsed_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
                })
            }
        };
        let found = match waited {
            Ok(found) => found,
            Err(error) => {
                warn!(stage = %stage_id, key = %key, error = %error, "Gave up waiting on cached output");
                return Ok(self.interrupted(started, error));
            }
        };

        match found {
            CacheLookup::Hit(bytes) => match serde_json::from_slice::<StageOutput>(&bytes) {
                Ok(output) => {
                    debug!(stage = %stage_id, key = %key, "Stage served from cache");
                    self.events
                        .emit(CACHE_HIT, Some(json!({ "stage": stage_id, "key": key })))
                        .await;
                    let attempt = StageAttempt {
                        stage_id: stage_id.to_string(),
                        attempt: 1,
                        started_offset_ms: self.clock.offset_ms(started),
                        ended_offset_ms: self.clock.offset_ms(tokio::time::Instant::now()),
                        scope: self.scope.clone(),
                        chunk_allowance: self.allowance.chunks_remaining(),
                        usage: ResourceUsage::default(),
                        cache_hit: true,
                        error: None,
                    };
                    Ok(StageRun {
                        stage_id: stage_id.to_string(),
                        outcome: RetryOutcome {
                            result: Ok(output),
                            attempts: vec![attempt],
                            usage: ResourceUsage::default(),
                        },
                        cache_hit: true,
                        duration_ms: 0.0,
                    })
                }
                Err(e) => {
                    warn!(stage = %stage_id, key = %key, error = %e, "Unreadable cached output, recomputing");
                    cache.delete(&key);
                    Err(None)
                }
            },
            CacheLookup::Miss(claim) => {
                self.events
                    .emit(CACHE_MISS, Some(json!({ "stage": stage_id, "key": key })))
                    .await;
                Err(Some(claim))
            }
        }
    }

    fn interrupted(&self, started: tokio::time::Instant, error: StageError) -> StageRun {
        let stage_id = self.ctx.stage_id().to_string();
        let attempt = StageAttempt {
            stage_id: stage_id.clone(),
            attempt: 1,
            started_offset_ms: self.clock.offset_ms(started),
            ended_offset_ms: self.clock.offset_ms(tokio::time::Instant::now()),
            scope: self.scope.clone(),
            chunk_allowance: self.allowance.chunks_remaining(),
            usage: ResourceUsage::default(),
            cache_hit: false,
            error: Some(ExecutionError::from_stage_error(&stage_id, 1, &error)),
        };
        StageRun {
            stage_id,
            outcome: RetryOutcome {
                result: Err(error),
                attempts: vec![attempt],
                usage: ResourceUsage::default(),
            },
            cache_hit: false,
            duration_ms: millis_since(started),
        }
    }
}

fn millis_since(started: tokio::time::Instant) -> f64 {
    started.elapsed().as_secs_f64() * 1000.0
}

/// Shared, read-only inputs of one run.
pub(crate) struct RunSettings {
    pub strategy: ExecutionStrategy,
    pub use_cache: bool,
    pub max_concurrent: usize,
    pub scope: Scope,
    pub controller: RetryController,
    pub events: Arc<dyn EventSink>,
    pub cache: Option<Arc<CacheStore>>,
}

/// Drives one plan to completion.
pub(crate) struct Coordinator<'a> {
    plan: &'a ExecutionPlan,
    settings: RunSettings,
    ctx: PipelineContext,
    clock: ExecutionClock,
    initial: Budget,
    budget: Budget,
    cancel: Arc<CancellationToken>,
    states: BTreeMap<String, StageState>,
    stages_executed: Vec<String>,
    attempts: Vec<StageAttempt>,
    errors: Vec<ExecutionError>,
    aborted: bool,
}

impl<'a> Coordinator<'a> {
    pub(crate) fn new(
        plan: &'a ExecutionPlan,
        settings: RunSettings,
        ctx: PipelineContext,
        budget: Budget,
        clock: ExecutionClock,
    ) -> Self {
        let states = plan
            .order()
            .iter()
            .map(|id| (id.clone(), StageState::Pending))
            .collect();
        Self {
            plan,
            settings,
            ctx,
            clock,
            initial: budget,
            budget,
            cancel: Arc::new(CancellationToken::new()),
            states,
            stages_executed: Vec::new(),
            attempts: Vec::new(),
            errors: Vec::new(),
            aborted: false,
        }
    }

    /// Runs the plan with the configured strategy.
    pub(crate) async fn run(mut self) -> RunReport {
        if self.settings.strategy == ExecutionStrategy::Parallel {
            self.run_parallel().await;
        } else {
            self.run_sequential().await;
        }
        self.finish().await
    }

    async fn run_sequential(&mut self) {
        let order = self.plan.order().to_vec();
        for stage_id in order {
            if self.state(&stage_id) != StageState::Pending {
                continue;
            }
            if !self.admit().await {
                break;
            }
            let Some(task) = self.start(&stage_id).await else {
                continue;
            };
            let span = stage_span(&stage_id);
            let run = task.run().instrument(span).await;
            self.complete(run).await;
        }
    }

    async fn run_parallel(&mut self) {
        let limit = self.settings.max_concurrent.max(1);
        let mut running = FuturesUnordered::new();

        loop {
            while running.len() < limit {
                let Some(stage_id) = self.next_ready() else {
                    break;
                };
                if !self.admit().await {
                    break;
                }
                let Some(task) = self.start(&stage_id).await else {
                    continue;
                };
                let handle = tokio::spawn(task.run().instrument(stage_span(&stage_id)));
                running.push(handle.map(move |joined| (stage_id, joined)));
            }

            let Some((stage_id, joined)) = running.next().await else {
                break;
            };
            match joined {
                Ok(run) => self.complete(run).await,
                Err(e) => {
                    warn!(stage = %stage_id, error = %e, "Stage task did not complete");
                    self.fail(&stage_id, 0, StageError::execution(format!("stage task failed: {e}")))
                        .await;
                }
            }
        }
    }

    fn state(&self, stage_id: &str) -> StageState {
        self.states.get(stage_id).copied().unwrap_or(StageState::Skipped)
    }

    /// First pending stage in plan order whose dependencies all succeeded.
    fn next_ready(&self) -> Option<String> {
        self.plan
            .order()
            .iter()
            .find(|id| {
                self.state(id) == StageState::Pending
                    && self.plan.dependencies_of(id).is_some_and(|deps| {
                        deps.iter().all(|d| self.state(d) == StageState::Succeeded)
                    })
            })
            .cloned()
    }

    fn sync_time(&mut self) {
        let drift = self
            .budget
            .time_remaining()
            .saturating_sub(self.clock.remaining());
        self.budget.elapse(drift);
    }

    /// Returns true if a new stage may start; aborts the run otherwise.
    async fn admit(&mut self) -> bool {
        if self.aborted {
            return false;
        }
        self.sync_time();
        if let Some(dimension) = self.budget.exhausted_dimension() {
            let kind = if dimension == BudgetDimension::Time {
                ErrorKind::Timeout
            } else {
                ErrorKind::BudgetExceeded
            };
            self.errors.push(ExecutionError {
                stage_id: String::new(),
                kind,
                message: format!("{dimension} budget exhausted"),
                attempt: 0,
            });
            self.abort(&format!("{dimension} budget exhausted")).await;
            return false;
        }
        true
    }

    async fn start(&mut self, stage_id: &str) -> Option<StageTask> {
        self.states.insert(stage_id.to_string(), StageState::Running);
        self.stages_executed.push(stage_id.to_string());
        info!(stage = %stage_id, "Stage started");
        self.settings
            .events
            .emit(STAGE_STARTED, Some(json!({ "stage": stage_id })))
            .await;

        let Some(stage) = self.plan.stage(stage_id).cloned() else {
            self.fail(stage_id, 0, StageError::validation(format!("stage '{stage_id}' is not in the plan")))
                .await;
            return None;
        };
        let deps = stage.descriptor().dependencies.clone();
        let cache = if self.settings.use_cache && stage.descriptor().cacheable {
            self.settings.cache.clone()
        } else {
            None
        };

        let ctx = self
            .ctx
            .stage_context(stage_id, &deps, self.cancel.clone())
            .with_cache(self.settings.cache.clone());

        Some(StageTask {
            stage,
            ctx,
            scope: self.settings.scope.clone(),
            allowance: self.budget,
            clock: self.clock,
            controller: self.settings.controller.clone(),
            cache,
            events: self.settings.events.clone(),
        })
    }

    async fn complete(&mut self, run: StageRun) {
        let StageRun {
            stage_id,
            outcome,
            cache_hit,
            duration_ms,
        } = run;
        let last_attempt = outcome.attempts.last().map_or(0, |a| a.attempt);
        self.attempts.extend(outcome.attempts);
        self.sync_time();

        let charged = self.budget.charge_usage(&outcome.usage);
        match (outcome.result, charged) {
            (Ok(output), Ok(())) => {
                self.states.insert(stage_id.clone(), StageState::Succeeded);
                self.settings
                    .events
                    .emit(
                        STAGE_COMPLETED,
                        Some(json!({
                            "stage": stage_id,
                            "attempts": last_attempt,
                            "cache_hit": cache_hit,
                            "duration_ms": duration_ms,
                        })),
                    )
                    .await;
                info!(stage = %stage_id, attempts = last_attempt, cache_hit, "Stage completed");
                self.ctx.record_output(stage_id, output);
            }
            (Ok(_), Err(error)) | (Err(error), _) => {
                self.fail(&stage_id, last_attempt, error).await;
            }
        }

        if !self.aborted && self.budget.is_exhausted() && self.has_pending() {
            let _ = self.admit().await;
        }
    }

    async fn fail(&mut self, stage_id: &str, attempt: u32, error: StageError) {
        warn!(stage = %stage_id, attempt, error = %error, "Stage failed");
        self.states.insert(stage_id.to_string(), StageState::Failed);
        self.errors
            .push(ExecutionError::from_stage_error(stage_id, attempt, &error));
        self.settings
            .events
            .emit(
                STAGE_FAILED,
                Some(json!({
                    "stage": stage_id,
                    "attempt": attempt,
                    "kind": error.kind(),
                    "error": error.to_string(),
                })),
            )
            .await;

        for dependent in self.plan.dependents_of(stage_id) {
            if self.state(&dependent) != StageState::Pending {
                continue;
            }
            let skipped = StageError::DependencyFailed {
                stage: dependent.clone(),
                dependency: stage_id.to_string(),
            };
            self.errors
                .push(ExecutionError::from_stage_error(&dependent, 0, &skipped));
            self.skip(&dependent, &skipped.to_string()).await;
        }

        if error.is_terminal() {
            self.abort(&error.to_string()).await;
        }
    }

    async fn skip(&mut self, stage_id: &str, reason: &str) {
        self.states.insert(stage_id.to_string(), StageState::Skipped);
        debug!(stage = %stage_id, reason = %reason, "Stage skipped");
        self.settings
            .events
            .emit(STAGE_SKIPPED, Some(json!({ "stage": stage_id, "reason": reason })))
            .await;
    }

    fn has_pending(&self) -> bool {
        self.states.values().any(|s| *s == StageState::Pending)
    }

    /// Cancels running stages and skips every stage not yet started.
    async fn abort(&mut self, reason: &str) {
        if self.aborted {
            return;
        }
        self.aborted = true;
        warn!(reason = %reason, "Execution aborted");
        self.cancel.cancel(reason);

        let pending: Vec<String> = self
            .states
            .iter()
            .filter(|(_, s)| **s == StageState::Pending)
            .map(|(id, _)| id.clone())
            .collect();
        for stage_id in pending {
            self.skip(&stage_id, reason).await;
        }
    }

    async fn finish(mut self) -> RunReport {
        let leftover: Vec<String> = self
            .states
            .iter()
            .filter(|(_, s)| !s.is_terminal())
            .map(|(id, _)| id.clone())
            .collect();
        for stage_id in leftover {
            self.skip(&stage_id, "not reachable").await;
        }
        self.sync_time();

        let outputs = self.ctx.into_outputs().into_iter().collect();
        RunReport {
            states: self.states,
            stages_executed: self.stages_executed,
            attempts: self.attempts,
            errors: self.errors,
            budget_used: self.budget.used_since(&self.initial),
            outputs,
        }
    }
}
