//! Engine configuration.
//!
//! Every section deserializes from JSON with per-field defaults, so a config
//! file only needs the values it changes. Environment variables prefixed
//! with `STAGECRAFT_` override file values.

use crate::errors::ConfigError;
use crate::governor::{Budget, BudgetLimits, Scope, ScopeLimits};
use crate::pipeline::{ExecutionStrategy, NarrowingPolicy, RetryConfig};
use crate::resilience::ResiliencePolicy;
use anyhow::Context as _;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Result cache configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Whether the engine consults the cache at all.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Memory tier entry bound.
    #[serde(default = "default_max_memory_entries")]
    pub max_memory_entries: usize,
    /// Memory tier byte bound.
    #[serde(default = "default_max_memory_size_bytes")]
    pub max_memory_size_bytes: u64,
    /// TTL used when a caller passes zero.
    #[serde(default = "default_ttl_ms")]
    pub default_ttl_ms: u64,
    /// SQLite file for the disk tier; in-memory database when unset.
    #[serde(default)]
    pub disk_path: Option<PathBuf>,
    /// Interval of the expiry sweeper.
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
}

fn default_true() -> bool {
    true
}

fn default_max_memory_entries() -> usize {
    1000
}

fn default_max_memory_size_bytes() -> u64 {
    64 * 1024 * 1024 // 64MB
}

fn default_ttl_ms() -> u64 {
    60 * 60 * 1000
}

fn default_sweep_interval_ms() -> u64 {
    60_000
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            max_memory_entries: default_max_memory_entries(),
            max_memory_size_bytes: default_max_memory_size_bytes(),
            default_ttl_ms: default_ttl_ms(),
            disk_path: None,
            sweep_interval_ms: default_sweep_interval_ms(),
        }
    }
}

impl CacheConfig {
    /// Sets the memory entry bound.
    #[must_use]
    pub fn with_max_memory_entries(mut self, entries: usize) -> Self {
        self.max_memory_entries = entries;
        self
    }

    /// Sets the memory byte bound.
    #[must_use]
    pub fn with_max_memory_size_bytes(mut self, bytes: u64) -> Self {
        self.max_memory_size_bytes = bytes;
        self
    }

    /// Sets the disk tier location.
    #[must_use]
    pub fn with_disk_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.disk_path = Some(path.into());
        self
    }

    /// Gets the sweep interval as a Duration.
    #[must_use]
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

/// Stage scheduling configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Strategy used when a request does not name one.
    #[serde(default)]
    pub default_strategy: ExecutionStrategy,
    /// Bound on concurrently running stages per execution.
    #[serde(default = "default_max_concurrent_stages")]
    pub max_concurrent_stages: usize,
    /// Per-stage retry ceiling and backoff.
    #[serde(default = "default_stage_retry")]
    pub retry: RetryConfig,
    /// How scope and chunk allowance shrink between attempts.
    #[serde(default)]
    pub narrowing: NarrowingPolicy,
    /// A stage counts as order-dependent when its parallel mean exceeds its
    /// sequential mean by more than this factor.
    #[serde(default = "default_contention_tolerance")]
    pub contention_tolerance: f64,
    /// Budget used when a request supplies none.
    #[serde(default)]
    pub default_budget: BudgetLimits,
    /// Scope used when a request supplies none.
    #[serde(default)]
    pub default_scope: ScopeLimits,
}

fn default_max_concurrent_stages() -> usize {
    4
}

fn default_stage_retry() -> RetryConfig {
    RetryConfig::new().with_base_delay_ms(0)
}

fn default_contention_tolerance() -> f64 {
    1.5
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            default_strategy: ExecutionStrategy::default(),
            max_concurrent_stages: default_max_concurrent_stages(),
            retry: default_stage_retry(),
            narrowing: NarrowingPolicy::default(),
            contention_tolerance: default_contention_tolerance(),
            default_budget: BudgetLimits::default(),
            default_scope: ScopeLimits::default(),
        }
    }
}

impl ExecutionConfig {
    /// Sets the default strategy.
    #[must_use]
    pub fn with_strategy(mut self, strategy: ExecutionStrategy) -> Self {
        self.default_strategy = strategy;
        self
    }

    /// Sets the concurrency bound.
    #[must_use]
    pub fn with_max_concurrent_stages(mut self, max: usize) -> Self {
        self.max_concurrent_stages = max;
        self
    }

    /// Sets the retry configuration.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Resolves the default budget.
    ///
    /// # Errors
    ///
    /// Returns an error if a configured limit is negative.
    pub fn budget(&self) -> Result<Budget, ConfigError> {
        self.default_budget.into_budget(&Budget::default())
    }

    /// Resolves the default scope.
    ///
    /// # Errors
    ///
    /// Returns an error if a configured limit is zero or negative.
    pub fn scope(&self) -> Result<Scope, ConfigError> {
        self.default_scope.clone().into_scope(&Scope::default())
    }
}

/// History and reporting configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyticsConfig {
    /// Executions kept for history and replay.
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,
    /// Duration samples kept per stage and mode.
    #[serde(default = "default_max_samples")]
    pub max_samples_per_stage: usize,
    /// A stage whose mean exceeds this multiple of the pipeline mean is a
    /// bottleneck.
    #[serde(default = "default_bottleneck_multiplier")]
    pub bottleneck_multiplier: f64,
}

fn default_history_capacity() -> usize {
    100
}

fn default_max_samples() -> usize {
    1000
}

fn default_bottleneck_multiplier() -> f64 {
    2.0
}

impl Default for AnalyticsConfig {
    fn default() -> Self {
        Self {
            history_capacity: default_history_capacity(),
            max_samples_per_stage: default_max_samples(),
            bottleneck_multiplier: default_bottleneck_multiplier(),
        }
    }
}

/// Output format for log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Human-readable output.
    #[default]
    Pretty,
    /// One JSON object per line.
    Json,
}

impl FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Parse(format!("unknown log format '{other}'"))),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` takes precedence.
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Output format.
    #[serde(default)]
    pub format: LogFormat,
    /// Whether to include the event target.
    #[serde(default = "default_true")]
    pub with_target: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
            with_target: default_true(),
        }
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Result cache.
    #[serde(default)]
    pub cache: CacheConfig,
    /// Scheduling, retry and default limits.
    #[serde(default)]
    pub execution: ExecutionConfig,
    /// History and reporting.
    #[serde(default)]
    pub analytics: AnalyticsConfig,
    /// Logging.
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Named policies for the resilience executor.
    #[serde(default)]
    pub resilience: HashMap<String, ResiliencePolicy>,
}

fn parse_var<T: FromStr>(name: &str, raw: &str) -> Result<T, ConfigError> {
    raw.trim()
        .parse()
        .map_err(|_| ConfigError::Parse(format!("invalid value '{raw}' for {name}")))
}

impl EngineConfig {
    /// Creates a configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the cache section.
    #[must_use]
    pub fn with_cache(mut self, cache: CacheConfig) -> Self {
        self.cache = cache;
        self
    }

    /// Sets the execution section.
    #[must_use]
    pub fn with_execution(mut self, execution: ExecutionConfig) -> Self {
        self.execution = execution;
        self
    }

    /// Sets the analytics section.
    #[must_use]
    pub fn with_analytics(mut self, analytics: AnalyticsConfig) -> Self {
        self.analytics = analytics;
        self
    }

    /// Adds a resilience policy.
    #[must_use]
    pub fn with_resilience_policy(mut self, name: impl Into<String>, policy: ResiliencePolicy) -> Self {
        self.resilience.insert(name.into(), policy);
        self
    }

    /// Parses a JSON document.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Parse` for malformed JSON.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Loads, applies environment overrides to, and validates a JSON file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let config = Self::from_json_str(&raw)
            .with_context(|| format!("parsing config file {}", path.display()))?
            .apply_env_overrides()
            .context("applying environment overrides")?;
        config
            .validate()
            .with_context(|| format!("validating config file {}", path.display()))?;
        Ok(config)
    }

    /// Applies `STAGECRAFT_*` environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Parse` for unparsable values.
    pub fn apply_env_overrides(self) -> Result<Self, ConfigError> {
        self.apply_overrides_from(|name| std::env::var(name).ok())
    }

    /// Applies overrides from an arbitrary variable source.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Parse` for unparsable values.
    pub fn apply_overrides_from<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        const STRATEGY: &str = "STAGECRAFT_STRATEGY";
        const MAX_CONCURRENT: &str = "STAGECRAFT_MAX_CONCURRENT_STAGES";
        const MAX_ATTEMPTS: &str = "STAGECRAFT_MAX_ATTEMPTS";
        const CACHE_ENABLED: &str = "STAGECRAFT_CACHE_ENABLED";
        const CACHE_ENTRIES: &str = "STAGECRAFT_CACHE_MAX_ENTRIES";
        const CACHE_BYTES: &str = "STAGECRAFT_CACHE_MAX_BYTES";
        const CACHE_TTL: &str = "STAGECRAFT_CACHE_DEFAULT_TTL_MS";
        const CACHE_PATH: &str = "STAGECRAFT_CACHE_DISK_PATH";
        const HISTORY: &str = "STAGECRAFT_HISTORY_CAPACITY";
        const LOG_LEVEL: &str = "STAGECRAFT_LOG_LEVEL";
        const LOG_FORMAT: &str = "STAGECRAFT_LOG_FORMAT";

        if let Some(v) = lookup(STRATEGY) {
            self.execution.default_strategy = v.parse()?;
        }
        if let Some(v) = lookup(MAX_CONCURRENT) {
            self.execution.max_concurrent_stages = parse_var(MAX_CONCURRENT, &v)?;
        }
        if let Some(v) = lookup(MAX_ATTEMPTS) {
            self.execution.retry.max_attempts = parse_var(MAX_ATTEMPTS, &v)?;
        }
        if let Some(v) = lookup(CACHE_ENABLED) {
            self.cache.enabled = parse_var(CACHE_ENABLED, &v)?;
        }
        if let Some(v) = lookup(CACHE_ENTRIES) {
            self.cache.max_memory_entries = parse_var(CACHE_ENTRIES, &v)?;
        }
        if let Some(v) = lookup(CACHE_BYTES) {
            self.cache.max_memory_size_bytes = parse_var(CACHE_BYTES, &v)?;
        }
        if let Some(v) = lookup(CACHE_TTL) {
            self.cache.default_ttl_ms = parse_var(CACHE_TTL, &v)?;
        }
        if let Some(v) = lookup(CACHE_PATH) {
            self.cache.disk_path = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup(HISTORY) {
            self.analytics.history_capacity = parse_var(HISTORY, &v)?;
        }
        if let Some(v) = lookup(LOG_LEVEL) {
            self.logging.level = v;
        }
        if let Some(v) = lookup(LOG_FORMAT) {
            self.logging.format = v.parse()?;
        }
        Ok(self)
    }

    /// Checks every section for invalid values.
    ///
    /// # Errors
    ///
    /// Returns the first invalid value found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        fn at_least_one(field: &'static str, value: u64) -> Result<(), ConfigError> {
            if value == 0 {
                Err(ConfigError::Zero { field })
            } else {
                Ok(())
            }
        }

        at_least_one("cache.max_memory_entries", self.cache.max_memory_entries as u64)?;
        at_least_one("cache.max_memory_size_bytes", self.cache.max_memory_size_bytes)?;
        at_least_one("cache.default_ttl_ms", self.cache.default_ttl_ms)?;
        at_least_one("cache.sweep_interval_ms", self.cache.sweep_interval_ms)?;
        at_least_one(
            "execution.max_concurrent_stages",
            self.execution.max_concurrent_stages as u64,
        )?;
        at_least_one("execution.retry.max_attempts", self.execution.retry.max_attempts as u64)?;
        self.execution.narrowing.validate()?;
        if !(self.execution.contention_tolerance >= 1.0) {
            return Err(ConfigError::OutOfRange {
                field: "execution.contention_tolerance",
                reason: format!("must be >= 1.0, got {}", self.execution.contention_tolerance),
            });
        }
        self.execution.budget()?;
        self.execution.scope()?;
        at_least_one("analytics.history_capacity", self.analytics.history_capacity as u64)?;
        at_least_one(
            "analytics.max_samples_per_stage",
            self.analytics.max_samples_per_stage as u64,
        )?;
        if !(self.analytics.bottleneck_multiplier > 0.0) {
            return Err(ConfigError::OutOfRange {
                field: "analytics.bottleneck_multiplier",
                reason: format!("must be positive, got {}", self.analytics.bottleneck_multiplier),
            });
        }
        for policy in self.resilience.values() {
            policy.validate()?;
        }
        Ok(())
    }
}
