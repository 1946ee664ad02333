//! Test fixtures for engine testing.

use std::sync::Arc;
use std::time::Duration;

use crate::config::{CacheConfig, EngineConfig, ExecutionConfig};
use crate::errors::RegistryError;
use crate::governor::{Budget, Scope};
use crate::pipeline::{ExecutionStrategy, JitterStrategy, RetryConfig};
use crate::stages::{Stage, StageRegistry};

/// The budget used across the engine tests: one minute, 4000 tokens,
/// 5 chunks and 2 files.
#[must_use]
pub fn budget_fixture() -> Budget {
    Budget::new(Duration::from_secs(60), 4000, 5, 2)
}

/// A roomy scope limited to Rust and Markdown files.
#[must_use]
pub fn scope_fixture() -> Scope {
    Scope::new(8, 400, 16)
        .unwrap_or_default()
        .with_allowed_file_types(["rs", "md"])
        .with_excluded_paths(["target/"])
}

/// Retries that back off for a millisecond without jitter.
#[must_use]
pub fn fast_retry(max_attempts: usize) -> RetryConfig {
    RetryConfig::new()
        .with_max_attempts(max_attempts)
        .with_base_delay_ms(1)
        .with_max_delay_ms(5)
        .with_jitter(JitterStrategy::None)
}

/// Engine configuration for tests: fast retries, an in-process cache and
/// the given default strategy.
#[must_use]
pub fn engine_config(strategy: ExecutionStrategy) -> EngineConfig {
    EngineConfig::new()
        .with_cache(CacheConfig::default().with_max_memory_entries(64))
        .with_execution(
            ExecutionConfig::default()
                .with_strategy(strategy)
                .with_retry(fast_retry(3)),
        )
}

/// Registers every stage in one batch.
///
/// # Errors
///
/// Returns the registry's error for duplicate, unknown or cyclic stages.
pub fn registry_with(
    stages: impl IntoIterator<Item = Arc<dyn Stage>>,
) -> Result<StageRegistry, RegistryError> {
    let mut registry = StageRegistry::new();
    registry.register_all(stages)?;
    Ok(registry)
}
