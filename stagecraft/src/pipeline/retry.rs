//! Retry with narrowing.
//!
//! Stage attempts that fail with an execution error are retried with a
//! smaller scope and chunk allowance each time, with backoff and jitter
//! between attempts. Every other failure ends the stage immediately.

use super::result::{ExecutionError, StageAttempt};
use crate::context::StageContext;
use crate::core::StageOutput;
use crate::errors::{ConfigError, StageError};
use crate::events::{EventSink, STAGE_RETRYING};
use crate::governor::{check_scope, Budget, BudgetDimension, ResourceUsage, Scope};
use crate::stages::Stage;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Backoff strategy for retry delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// delay = base * 2^retry
    #[default]
    Exponential,
    /// delay = base * (retry + 1)
    Linear,
    /// delay = base (constant)
    Constant,
}

/// Jitter strategy to prevent thundering herd.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JitterStrategy {
    /// No jitter
    None,
    /// Random from 0 to delay
    #[default]
    Full,
    /// Half fixed, half random
    Equal,
    /// min(max, random(base, prev * 3))
    Decorrelated,
}

/// Configuration for retry behavior.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum attempts, including the first.
    pub max_attempts: usize,
    /// Base delay between retries in milliseconds.
    pub base_delay_ms: u64,
    /// Maximum delay cap in milliseconds.
    pub max_delay_ms: u64,
    /// Backoff strategy.
    pub backoff_strategy: BackoffStrategy,
    /// Jitter strategy.
    pub jitter_strategy: JitterStrategy,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1000,
            max_delay_ms: 30000,
            backoff_strategy: BackoffStrategy::Exponential,
            jitter_strategy: JitterStrategy::Full,
        }
    }
}

impl RetryConfig {
    /// Creates a new retry config.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the maximum attempts.
    #[must_use]
    pub fn with_max_attempts(mut self, attempts: usize) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Sets the base delay.
    #[must_use]
    pub fn with_base_delay_ms(mut self, delay: u64) -> Self {
        self.base_delay_ms = delay;
        self
    }

    /// Sets the maximum delay.
    #[must_use]
    pub fn with_max_delay_ms(mut self, delay: u64) -> Self {
        self.max_delay_ms = delay;
        self
    }

    /// Sets the backoff strategy.
    #[must_use]
    pub fn with_backoff(mut self, strategy: BackoffStrategy) -> Self {
        self.backoff_strategy = strategy;
        self
    }

    /// Sets the jitter strategy.
    #[must_use]
    pub fn with_jitter(mut self, strategy: JitterStrategy) -> Self {
        self.jitter_strategy = strategy;
        self
    }
}

/// State tracking for retry operations.
#[derive(Debug, Default)]
pub struct RetryState {
    /// Retries performed so far; 0 during the first attempt.
    pub attempt: usize,
    /// Previous delays for decorrelated jitter.
    previous_delays: HashMap<String, u64>,
}

impl RetryState {
    /// Creates a new retry state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Increments the retry counter and returns true if more attempts remain.
    pub fn increment(&mut self, config: &RetryConfig) -> bool {
        self.attempt += 1;
        !self.is_exhausted(config)
    }

    /// Resets the state for a new operation.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Calculates the delay before the next retry.
    #[must_use]
    pub fn calculate_delay(&mut self, key: &str, config: &RetryConfig) -> Duration {
        let base = config.base_delay_ms;
        let max = config.max_delay_ms;
        let exponent = u32::try_from(self.attempt).unwrap_or(u32::MAX);

        let delay = match config.backoff_strategy {
            BackoffStrategy::Exponential => base.saturating_mul(2u64.saturating_pow(exponent)).min(max),
            BackoffStrategy::Linear => base
                .saturating_mul(u64::from(exponent).saturating_add(1))
                .min(max),
            BackoffStrategy::Constant => base.min(max),
        };

        let jittered = match config.jitter_strategy {
            JitterStrategy::None => delay,
            JitterStrategy::Full => {
                if delay == 0 {
                    0
                } else {
                    rand::thread_rng().gen_range(0..=delay)
                }
            }
            JitterStrategy::Equal => {
                let half = delay / 2;
                if half == 0 {
                    delay
                } else {
                    half + rand::thread_rng().gen_range(0..=half)
                }
            }
            JitterStrategy::Decorrelated => {
                let prev = self.previous_delays.get(key).copied().unwrap_or(base);
                let upper = prev.saturating_mul(3).min(max);
                let new_delay = if upper <= base {
                    base.min(max)
                } else {
                    rand::thread_rng().gen_range(base..=upper)
                };
                self.previous_delays.insert(key.to_string(), new_delay);
                new_delay
            }
        };

        Duration::from_millis(jittered)
    }

    /// Returns true if the attempt that just ran was the last one allowed.
    #[must_use]
    pub fn is_exhausted(&self, config: &RetryConfig) -> bool {
        self.attempt + 1 >= config.max_attempts
    }
}

/// Outcome of a retry decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry after the specified delay.
    Retry(Duration),
    /// No more retries, give up.
    GiveUp,
    /// Don't retry, the error is not retryable.
    NotRetryable,
}

/// Decides what to do after a failed attempt.
#[must_use]
pub fn should_retry(
    state: &mut RetryState,
    config: &RetryConfig,
    key: &str,
    retryable: bool,
) -> RetryDecision {
    if !retryable {
        return RetryDecision::NotRetryable;
    }
    if state.is_exhausted(config) {
        return RetryDecision::GiveUp;
    }

    let delay = state.calculate_delay(key, config);
    state.increment(config);

    RetryDecision::Retry(delay)
}

fn default_narrowing_factor() -> f64 {
    0.5
}

/// How much each retry shrinks the scope and chunk allowance.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NarrowingPolicy {
    /// Multiplier in (0, 1] applied to every numeric limit per retry.
    #[serde(default = "default_narrowing_factor")]
    pub factor: f64,
}

impl Default for NarrowingPolicy {
    fn default() -> Self {
        Self {
            factor: default_narrowing_factor(),
        }
    }
}

impl NarrowingPolicy {
    /// Creates a policy with the given factor.
    #[must_use]
    pub fn new(factor: f64) -> Self {
        Self { factor }
    }

    /// Checks that the factor lies in (0, 1].
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::OutOfRange` otherwise.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.factor > 0.0 && self.factor <= 1.0 {
            Ok(())
        } else {
            Err(ConfigError::OutOfRange {
                field: "execution.narrowing.factor",
                reason: format!("{} is not in (0, 1]", self.factor),
            })
        }
    }

    /// The scope for the next attempt.
    #[must_use]
    pub fn narrow_scope(&self, scope: &Scope) -> Scope {
        scope.narrowed(self.factor)
    }

    /// The chunk allowance for the next attempt.
    #[must_use]
    pub fn narrow_chunks(&self, allowance: &Budget) -> u64 {
        allowance.narrowed_chunks(self.factor)
    }
}

/// Wall-clock deadline of one execution.
///
/// Started once per execution from the time budget; every attempt's timeout
/// is whatever is left on it.
#[derive(Debug, Clone, Copy)]
pub struct ExecutionClock {
    started: Instant,
    deadline: Instant,
}

impl ExecutionClock {
    /// Starts the clock with the given time budget.
    #[must_use]
    pub fn start(time_budget: Duration) -> Self {
        let started = Instant::now();
        let deadline = started
            .checked_add(time_budget)
            .or_else(|| started.checked_add(Duration::from_secs(u64::from(u32::MAX))))
            .unwrap_or(started);
        Self { started, deadline }
    }

    /// Time left before the deadline.
    #[must_use]
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// Time since the clock started.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Returns true once the deadline has passed.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.remaining().is_zero()
    }

    /// Milliseconds from the execution start to `at`.
    #[must_use]
    pub fn offset_ms(&self, at: Instant) -> f64 {
        at.saturating_duration_since(self.started).as_secs_f64() * 1000.0
    }
}

pub(crate) fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Everything one stage did across its attempts.
#[derive(Debug)]
pub struct RetryOutcome {
    /// Output of the successful attempt, or the error that ended the stage.
    pub result: Result<StageOutput, StageError>,
    /// Every attempt in order.
    pub attempts: Vec<StageAttempt>,
    /// Resources reported by the last attempt that returned an output.
    pub usage: ResourceUsage,
}

/// Runs a stage until it succeeds, fails permanently or runs out of attempts.
#[derive(Clone)]
pub struct RetryController {
    retry: RetryConfig,
    narrowing: NarrowingPolicy,
    events: Arc<dyn EventSink>,
}

impl RetryController {
    /// Creates a controller.
    #[must_use]
    pub fn new(retry: RetryConfig, narrowing: NarrowingPolicy, events: Arc<dyn EventSink>) -> Self {
        Self {
            retry,
            narrowing,
            events,
        }
    }

    /// Runs `stage` with `allowance` as its private budget snapshot.
    ///
    /// The caller charges `RetryOutcome::usage` to the real budget.
    pub async fn run_with_retry(
        &self,
        stage: &dyn Stage,
        base: &StageContext,
        scope: Scope,
        allowance: Budget,
        clock: ExecutionClock,
    ) -> RetryOutcome {
        let stage_id = base.stage_id().to_string();
        let mut local = allowance;
        let mut scope = scope;
        let mut chunk_allowance = local.chunks_remaining();
        let mut state = RetryState::new();
        let mut attempts = Vec::new();
        let mut usage = ResourceUsage::default();

        loop {
            let attempt = u32::try_from(state.attempt + 1).unwrap_or(u32::MAX);
            if attempt > 1 && base.is_cancelled() {
                let reason = base.cancellation().reason().unwrap_or_default();
                return RetryOutcome {
                    result: Err(StageError::Cancelled(reason)),
                    attempts,
                    usage,
                };
            }

            let remaining = clock.remaining();
            let started = Instant::now();
            let raw = if remaining.is_zero() {
                Err(StageError::Timeout {
                    stage: stage_id.clone(),
                    elapsed_ms: 0,
                })
            } else {
                let budget = Budget::new(
                    remaining,
                    local.tokens_remaining(),
                    local.chunks_remaining(),
                    local.files_remaining(),
                )
                .with_chunk_allowance(chunk_allowance);
                let ctx = base.for_attempt(attempt, scope.clone(), budget);
                run_attempt(stage, &ctx, remaining).await
            };
            let ended = Instant::now();

            let attempt_usage = raw.as_ref().map_or_else(|_| ResourceUsage::default(), |o| o.usage);
            if raw.is_ok() {
                usage = attempt_usage;
            }
            let result = raw.and_then(|output| {
                charge_output(&mut local, &output, chunk_allowance).map(|()| output)
            });

            attempts.push(StageAttempt {
                stage_id: stage_id.clone(),
                attempt,
                started_offset_ms: clock.offset_ms(started),
                ended_offset_ms: clock.offset_ms(ended),
                scope: scope.clone(),
                chunk_allowance,
                usage: attempt_usage,
                cache_hit: false,
                error: result
                    .as_ref()
                    .err()
                    .map(|e| ExecutionError::from_stage_error(&stage_id, attempt, e)),
            });

            let error = match result {
                Ok(output) => {
                    debug!(stage = %stage_id, attempt, "Stage attempt succeeded");
                    return RetryOutcome {
                        result: Ok(output),
                        attempts,
                        usage,
                    };
                }
                Err(error) => error,
            };

            let retryable = error.is_retryable() && !base.is_cancelled();
            match should_retry(&mut state, &self.retry, &stage_id, retryable) {
                RetryDecision::Retry(delay) => {
                    let next_scope = self.narrowing.narrow_scope(&scope);
                    let next_chunks = self
                        .narrowing
                        .narrow_chunks(&local.with_chunk_allowance(chunk_allowance));
                    warn!(
                        stage = %stage_id,
                        attempt,
                        delay_ms = millis(delay),
                        max_files = next_scope.max_files(),
                        chunk_allowance = next_chunks,
                        error = %error,
                        "Retrying stage with narrowed scope"
                    );
                    self.events
                        .emit(
                            STAGE_RETRYING,
                            Some(serde_json::json!({
                                "stage": stage_id,
                                "attempt": attempt,
                                "error": error.to_string(),
                                "delay_ms": millis(delay),
                                "scope": next_scope,
                                "chunk_allowance": next_chunks,
                            })),
                        )
                        .await;
                    scope = next_scope;
                    chunk_allowance = next_chunks;
                    backoff(delay, base, &clock).await;
                }
                RetryDecision::GiveUp | RetryDecision::NotRetryable => {
                    debug!(stage = %stage_id, attempt, error = %error, "Stage failed permanently");
                    return RetryOutcome {
                        result: Err(error),
                        attempts,
                        usage,
                    };
                }
            }
        }
    }
}

/// Enforces the attempt's chunk allowance and charges its usage locally.
fn charge_output(local: &mut Budget, output: &StageOutput, chunk_allowance: u64) -> Result<(), StageError> {
    if output.usage.chunks > chunk_allowance {
        return Err(StageError::BudgetExceeded {
            dimension: BudgetDimension::Chunks,
            requested: output.usage.chunks,
            remaining: chunk_allowance,
        });
    }
    local.charge_usage(&output.usage)
}

async fn run_attempt(
    stage: &dyn Stage,
    ctx: &StageContext,
    remaining: Duration,
) -> Result<StageOutput, StageError> {
    let started = Instant::now();
    let work = async {
        if stage.descriptor().edits_files {
            if let Some(edit) = stage.propose_edit(ctx).await {
                check_scope(ctx.scope(), &edit)?;
            }
        }
        stage.execute(ctx).await
    };
    let cancel = ctx.cancellation();

    tokio::select! {
        biased;
        () = cancel.cancelled() => {
            Err(StageError::Cancelled(cancel.reason().unwrap_or_default()))
        }
        outcome = tokio::time::timeout(remaining, work) => {
            outcome.unwrap_or_else(|_| {
                Err(StageError::Timeout {
                    stage: ctx.stage_id().to_string(),
                    elapsed_ms: millis(started.elapsed()),
                })
            })
        }
    }
}

/// Sleeps between attempts; wakes early on cancellation or deadline.
async fn backoff(delay: Duration, ctx: &StageContext, clock: &ExecutionClock) {
    let delay = delay.min(clock.remaining());
    if delay.is_zero() {
        return;
    }
    tokio::select! {
        () = ctx.cancellation().cancelled() => {}
        () = tokio::time::sleep(delay) => {}
    }
}
