//! Named resilience policies.

use crate::errors::ConfigError;
use crate::pipeline::RetryConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Retry and circuit-breaker settings for one kind of external call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResiliencePolicy {
    /// Retry attempts and backoff.
    #[serde(default)]
    pub retry: RetryConfig,
    /// Consecutive failures that open the circuit.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// How long the circuit stays open before trial calls are let through.
    #[serde(default = "default_reset_timeout_ms")]
    pub reset_timeout_ms: u64,
    /// Trial calls allowed while half-open.
    #[serde(default = "default_half_open_max_calls")]
    pub half_open_max_calls: u32,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_reset_timeout_ms() -> u64 {
    30_000
}

fn default_half_open_max_calls() -> u32 {
    1
}

impl Default for ResiliencePolicy {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            failure_threshold: default_failure_threshold(),
            reset_timeout_ms: default_reset_timeout_ms(),
            half_open_max_calls: default_half_open_max_calls(),
        }
    }
}

impl ResiliencePolicy {
    /// Creates the default policy.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the retry configuration.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the failure threshold.
    #[must_use]
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    /// Sets the reset timeout.
    #[must_use]
    pub fn with_reset_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.reset_timeout_ms = timeout_ms;
        self
    }

    /// Reset timeout as a duration.
    #[must_use]
    pub fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout_ms)
    }

    /// Checks the policy for unusable values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Zero` for a zero attempt count, threshold or
    /// half-open allowance.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Zero {
                field: "resilience.retry.max_attempts",
            });
        }
        if self.failure_threshold == 0 {
            return Err(ConfigError::Zero {
                field: "resilience.failure_threshold",
            });
        }
        if self.half_open_max_calls == 0 {
            return Err(ConfigError::Zero {
                field: "resilience.half_open_max_calls",
            });
        }
        Ok(())
    }
}
