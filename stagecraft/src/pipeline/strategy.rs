//! Execution strategies and adaptive selection.

use super::ExecutionPlan;
use crate::errors::ConfigError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// How the stages of a plan are scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStrategy {
    /// Plan order, one stage at a time.
    Sequential,
    /// Ready stages run concurrently up to the concurrency bound.
    Parallel,
    /// Parallel when the ready set is wide and history shows the stages do
    /// not slow each other down; sequential otherwise.
    #[default]
    Adaptive,
    /// Adaptive, plus result-cache lookups for cacheable stages.
    Optimized,
}

impl ExecutionStrategy {
    /// Returns true if cacheable stages consult the result cache.
    #[must_use]
    pub fn uses_cache(self) -> bool {
        matches!(self, Self::Optimized)
    }

    /// Returns true if the strategy decides between sequential and parallel
    /// at run time.
    #[must_use]
    pub fn is_adaptive(self) -> bool {
        matches!(self, Self::Adaptive | Self::Optimized)
    }
}

impl fmt::Display for ExecutionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Sequential => "sequential",
            Self::Parallel => "parallel",
            Self::Adaptive => "adaptive",
            Self::Optimized => "optimized",
        };
        f.write_str(s)
    }
}

impl FromStr for ExecutionStrategy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sequential" => Ok(Self::Sequential),
            "parallel" => Ok(Self::Parallel),
            "adaptive" => Ok(Self::Adaptive),
            "optimized" => Ok(Self::Optimized),
            other => Err(ConfigError::Parse(format!("unknown strategy '{other}'"))),
        }
    }
}

/// Resolves a requested strategy to the one that actually runs.
///
/// Adaptive strategies go parallel only when more than one stage is ready at
/// the start and `order_independent` reports the initial ready set as free
/// of contention.
pub fn resolve_strategy<F>(
    requested: ExecutionStrategy,
    plan: &ExecutionPlan,
    order_independent: F,
) -> ExecutionStrategy
where
    F: FnOnce(&[&str]) -> bool,
{
    match requested {
        ExecutionStrategy::Sequential => ExecutionStrategy::Sequential,
        ExecutionStrategy::Parallel => ExecutionStrategy::Parallel,
        ExecutionStrategy::Adaptive | ExecutionStrategy::Optimized => {
            let roots = plan.roots();
            if roots.len() > 1 && order_independent(&roots) {
                ExecutionStrategy::Parallel
            } else {
                ExecutionStrategy::Sequential
            }
        }
    }
}
