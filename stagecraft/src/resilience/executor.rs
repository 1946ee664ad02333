//! Runs fallible external calls under a named resilience policy.

use super::breaker::{CircuitBreaker, CircuitState};
use super::policy::ResiliencePolicy;
use crate::pipeline::{should_retry, RetryDecision, RetryState};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};

/// Outcome of a call made through [`ResilienceExecutor::execute`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResilienceResult<T> {
    /// Whether the call eventually succeeded.
    pub success: bool,
    /// The value of the successful call.
    pub data: Option<T>,
    /// The last error, or why the call was not made.
    pub error: Option<String>,
    /// Calls actually made.
    pub attempts: u32,
}

impl<T> ResilienceResult<T> {
    fn ok(data: T, attempts: u32) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            attempts,
        }
    }

    fn failed(error: impl Into<String>, attempts: u32) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.into()),
            attempts,
        }
    }

    /// Converts into a `Result`.
    ///
    /// # Errors
    ///
    /// Returns the recorded error message when the call failed.
    pub fn into_result(self) -> Result<T, String> {
        match (self.success, self.data) {
            (true, Some(data)) => Ok(data),
            _ => Err(self.error.unwrap_or_else(|| "call failed".to_string())),
        }
    }
}

/// Retries and circuit-breaks calls to external collaborators.
///
/// Each policy name gets its own breaker, created on first use. Names
/// without a configured policy use the default policy.
#[derive(Debug, Default)]
pub struct ResilienceExecutor {
    policies: HashMap<String, ResiliencePolicy>,
    default_policy: ResiliencePolicy,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl ResilienceExecutor {
    /// Creates an executor with only the default policy.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an executor from configured policies.
    #[must_use]
    pub fn from_policies(policies: HashMap<String, ResiliencePolicy>) -> Self {
        Self {
            policies,
            ..Self::default()
        }
    }

    /// Adds or replaces a named policy.
    #[must_use]
    pub fn with_policy(mut self, name: impl Into<String>, policy: ResiliencePolicy) -> Self {
        self.policies.insert(name.into(), policy);
        self
    }

    /// The policy used for `name`.
    #[must_use]
    pub fn policy(&self, name: &str) -> &ResiliencePolicy {
        self.policies.get(name).unwrap_or(&self.default_policy)
    }

    fn breaker(&self, name: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(name.to_string())
            .or_insert_with(|| {
                let policy = self.policy(name);
                Arc::new(CircuitBreaker::new(
                    name,
                    policy.failure_threshold,
                    policy.reset_timeout(),
                    policy.half_open_max_calls,
                ))
            })
            .value()
            .clone()
    }

    /// Breaker state for a policy name; closed if never used.
    #[must_use]
    pub fn circuit_state(&self, name: &str) -> CircuitState {
        self.breakers
            .get(name)
            .map_or(CircuitState::Closed, |b| b.state())
    }

    /// Forces a policy's breaker closed.
    pub fn reset(&self, name: &str) {
        if let Some(breaker) = self.breakers.get(name) {
            breaker.reset();
        }
    }

    /// Calls `operation` until it succeeds, retries run out or the circuit
    /// opens.
    pub async fn execute<T, E, F, Fut>(&self, policy_name: &str, mut operation: F) -> ResilienceResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let policy = self.policy(policy_name).clone();
        let breaker = self.breaker(policy_name);
        let mut state = RetryState::new();
        let mut attempts = 0u32;

        loop {
            if !breaker.allow_request() {
                warn!(policy = %policy_name, attempts, "Circuit open, call rejected");
                return ResilienceResult::failed(
                    format!("circuit open for '{policy_name}'"),
                    attempts,
                );
            }

            attempts += 1;
            match operation().await {
                Ok(data) => {
                    breaker.record_success();
                    return ResilienceResult::ok(data, attempts);
                }
                Err(e) => {
                    breaker.record_failure();
                    match should_retry(&mut state, &policy.retry, policy_name, true) {
                        RetryDecision::Retry(delay) => {
                            debug!(
                                policy = %policy_name,
                                attempt = attempts,
                                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                                error = %e,
                                "Retrying after error"
                            );
                            tokio::time::sleep(delay).await;
                        }
                        RetryDecision::GiveUp | RetryDecision::NotRetryable => {
                            return ResilienceResult::failed(e.to_string(), attempts);
                        }
                    }
                }
            }
        }
    }
}
