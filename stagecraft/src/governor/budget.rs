//! Consumable resource budget for one execution.

use crate::errors::{ConfigError, StageError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// A consumable budget dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetDimension {
    /// Wall-clock time in milliseconds.
    Time,
    /// Model tokens.
    Tokens,
    /// Retrieval chunks (one per external retrieval unit).
    Chunks,
    /// Files touched.
    Files,
}

impl BudgetDimension {
    /// All dimensions, in reporting order.
    pub const ALL: [Self; 4] = [Self::Time, Self::Tokens, Self::Chunks, Self::Files];
}

impl fmt::Display for BudgetDimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Time => write!(f, "time"),
            Self::Tokens => write!(f, "tokens"),
            Self::Chunks => write!(f, "chunks"),
            Self::Files => write!(f, "files"),
        }
    }
}

/// Resources a stage reports having consumed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceUsage {
    /// Tokens consumed.
    #[serde(default)]
    pub tokens: u64,
    /// Retrieval chunks consumed.
    #[serde(default)]
    pub chunks: u64,
    /// Files touched.
    #[serde(default)]
    pub files: u64,
}

impl ResourceUsage {
    /// Creates a usage record.
    #[must_use]
    pub fn new(tokens: u64, chunks: u64, files: u64) -> Self {
        Self { tokens, chunks, files }
    }

    /// Returns true if nothing was consumed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tokens == 0 && self.chunks == 0 && self.files == 0
    }
}

/// Remaining resources for one execution.
///
/// Counters only ever decrease and never go below zero. A counter at zero
/// means the execution must stop starting new work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Budget {
    time_remaining_ms: u64,
    tokens_remaining: u64,
    chunks_remaining: u64,
    files_remaining: u64,
}

impl Default for Budget {
    fn default() -> Self {
        Self {
            time_remaining_ms: 60_000,
            tokens_remaining: 100_000,
            chunks_remaining: 50,
            files_remaining: 20,
        }
    }
}

impl Budget {
    /// Creates a budget.
    #[must_use]
    pub fn new(time: Duration, tokens: u64, chunks: u64, files: u64) -> Self {
        Self {
            time_remaining_ms: u64::try_from(time.as_millis()).unwrap_or(u64::MAX),
            tokens_remaining: tokens,
            chunks_remaining: chunks,
            files_remaining: files,
        }
    }

    /// An empty budget, used for reporting consumption.
    #[must_use]
    pub fn zero() -> Self {
        Self::new(Duration::ZERO, 0, 0, 0)
    }

    /// Remaining time in milliseconds.
    #[must_use]
    pub fn time_remaining_ms(&self) -> u64 {
        self.time_remaining_ms
    }

    /// Remaining time as a duration.
    #[must_use]
    pub fn time_remaining(&self) -> Duration {
        Duration::from_millis(self.time_remaining_ms)
    }

    /// Remaining tokens.
    #[must_use]
    pub fn tokens_remaining(&self) -> u64 {
        self.tokens_remaining
    }

    /// Remaining retrieval chunks.
    #[must_use]
    pub fn chunks_remaining(&self) -> u64 {
        self.chunks_remaining
    }

    /// Remaining files.
    #[must_use]
    pub fn files_remaining(&self) -> u64 {
        self.files_remaining
    }

    /// Returns the remaining amount for a dimension.
    #[must_use]
    pub fn remaining(&self, dimension: BudgetDimension) -> u64 {
        match dimension {
            BudgetDimension::Time => self.time_remaining_ms,
            BudgetDimension::Tokens => self.tokens_remaining,
            BudgetDimension::Chunks => self.chunks_remaining,
            BudgetDimension::Files => self.files_remaining,
        }
    }

    fn slot(&mut self, dimension: BudgetDimension) -> &mut u64 {
        match dimension {
            BudgetDimension::Time => &mut self.time_remaining_ms,
            BudgetDimension::Tokens => &mut self.tokens_remaining,
            BudgetDimension::Chunks => &mut self.chunks_remaining,
            BudgetDimension::Files => &mut self.files_remaining,
        }
    }

    /// Decrements a dimension.
    ///
    /// If the charge would take the counter below zero the counter is clamped
    /// to zero and `BudgetExceeded` is returned; the caller must abort the
    /// current stage.
    pub fn charge(&mut self, dimension: BudgetDimension, amount: u64) -> Result<(), StageError> {
        let slot = self.slot(dimension);
        let remaining = *slot;
        if amount > remaining {
            *slot = 0;
            return Err(StageError::BudgetExceeded {
                dimension,
                requested: amount,
                remaining,
            });
        }
        *slot = remaining - amount;
        Ok(())
    }

    /// Charges every dimension of a usage record.
    ///
    /// All dimensions are charged even after an overrun; the first overrun
    /// is returned.
    pub fn charge_usage(&mut self, usage: &ResourceUsage) -> Result<(), StageError> {
        let tokens = self.charge(BudgetDimension::Tokens, usage.tokens);
        let chunks = self.charge(BudgetDimension::Chunks, usage.chunks);
        let files = self.charge(BudgetDimension::Files, usage.files);
        tokens.and(chunks).and(files)
    }

    /// Records elapsed wall-clock time. Time always passes, so this clamps
    /// instead of failing.
    pub fn elapse(&mut self, elapsed: Duration) {
        let ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
        self.time_remaining_ms = self.time_remaining_ms.saturating_sub(ms);
    }

    /// Returns the first dimension that reached zero, if any.
    #[must_use]
    pub fn exhausted_dimension(&self) -> Option<BudgetDimension> {
        BudgetDimension::ALL
            .into_iter()
            .find(|d| self.remaining(*d) == 0)
    }

    /// Returns true if any dimension reached zero.
    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        self.exhausted_dimension().is_some()
    }

    /// Returns what was consumed between `initial` and `self`.
    #[must_use]
    pub fn used_since(&self, initial: &Self) -> Self {
        Self {
            time_remaining_ms: initial.time_remaining_ms.saturating_sub(self.time_remaining_ms),
            tokens_remaining: initial.tokens_remaining.saturating_sub(self.tokens_remaining),
            chunks_remaining: initial.chunks_remaining.saturating_sub(self.chunks_remaining),
            files_remaining: initial.files_remaining.saturating_sub(self.files_remaining),
        }
    }

    /// Returns a copy with the chunk counter replaced, never raising it.
    #[must_use]
    pub fn with_chunk_allowance(mut self, chunks: u64) -> Self {
        self.chunks_remaining = self.chunks_remaining.min(chunks);
        self
    }

    /// Returns the chunk allowance scaled by `factor`.
    ///
    /// Zero stays zero; any non-zero allowance keeps at least one chunk and
    /// never grows.
    #[must_use]
    pub fn narrowed_chunks(&self, factor: f64) -> u64 {
        let chunks = self.chunks_remaining;
        if chunks == 0 {
            return 0;
        }
        #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let scaled = (chunks as f64 * factor).floor() as u64;
        scaled.clamp(1, chunks)
    }

    /// Returns true if every dimension of `self` is at most `other`'s.
    #[must_use]
    pub fn fits_within(&self, other: &Self) -> bool {
        BudgetDimension::ALL
            .into_iter()
            .all(|d| self.remaining(d) <= other.remaining(d))
    }
}

/// Loosely-typed budget limits as they arrive in a request payload.
///
/// Missing fields fall back to a default budget; negative values are
/// rejected by [`BudgetLimits::into_budget`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetLimits {
    /// Time limit in milliseconds.
    #[serde(default, alias = "time")]
    pub time_ms: Option<i64>,
    /// Token limit.
    #[serde(default)]
    pub tokens: Option<i64>,
    /// Chunk limit.
    #[serde(default)]
    pub chunks: Option<i64>,
    /// File limit.
    #[serde(default)]
    pub files: Option<i64>,
}

fn non_negative(field: &'static str, value: Option<i64>, fallback: u64) -> Result<u64, ConfigError> {
    match value {
        None => Ok(fallback),
        Some(v) => u64::try_from(v).map_err(|_| ConfigError::Negative { field, value: v }),
    }
}

impl BudgetLimits {
    /// Validates the limits into a budget.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Negative` for any negative limit.
    pub fn into_budget(self, defaults: &Budget) -> Result<Budget, ConfigError> {
        Ok(Budget {
            time_remaining_ms: non_negative("time_ms", self.time_ms, defaults.time_remaining_ms)?,
            tokens_remaining: non_negative("tokens", self.tokens, defaults.tokens_remaining)?,
            chunks_remaining: non_negative("chunks", self.chunks, defaults.chunks_remaining)?,
            files_remaining: non_negative("files", self.files, defaults.files_remaining)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn budget() -> Budget {
        Budget::new(Duration::from_secs(60), 4000, 5, 2)
    }

    #[test]
    fn test_charge_decrements() {
        let mut b = budget();
        b.charge(BudgetDimension::Tokens, 1000).unwrap();
        assert_eq!(b.tokens_remaining(), 3000);
        assert!(!b.is_exhausted());
    }

    #[test]
    fn test_overcharge_clamps_to_zero() {
        let mut b = budget();
        let err = b.charge(BudgetDimension::Chunks, 9).unwrap_err();
        assert_eq!(
            err,
            StageError::BudgetExceeded {
                dimension: BudgetDimension::Chunks,
                requested: 9,
                remaining: 5,
            }
        );
        assert_eq!(b.chunks_remaining(), 0);
        assert_eq!(b.exhausted_dimension(), Some(BudgetDimension::Chunks));
    }

    #[test]
    fn test_exact_charge_exhausts() {
        let mut b = budget();
        b.charge(BudgetDimension::Files, 2).unwrap();
        assert!(b.is_exhausted());
    }

    #[test]
    fn test_token_overrun_still_charges_chunks_and_files() {
        let initial = budget();
        let mut b = initial;
        let err = b.charge_usage(&ResourceUsage::new(5000, 3, 1)).unwrap_err();
        assert_eq!(
            err,
            StageError::BudgetExceeded {
                dimension: BudgetDimension::Tokens,
                requested: 5000,
                remaining: 4000,
            }
        );
        assert_eq!(b.tokens_remaining(), 0);
        assert_eq!(b.chunks_remaining(), 2);
        assert_eq!(b.files_remaining(), 1);

        let used = b.used_since(&initial);
        assert_eq!(used.chunks_remaining(), 3);
        assert_eq!(used.files_remaining(), 1);
    }

    #[test]
    fn test_used_since_never_exceeds_initial() {
        let initial = budget();
        let mut b = initial;
        b.charge_usage(&ResourceUsage::new(100, 2, 1)).unwrap();
        b.elapse(Duration::from_secs(120));
        let used = b.used_since(&initial);
        assert_eq!(used.tokens_remaining(), 100);
        assert_eq!(used.chunks_remaining(), 2);
        assert_eq!(used.time_remaining_ms(), 60_000);
        assert!(used.fits_within(&initial));
    }

    #[test]
    fn test_chunk_allowance_never_raises() {
        let b = budget().with_chunk_allowance(50);
        assert_eq!(b.chunks_remaining(), 5);
        let b = budget().with_chunk_allowance(2);
        assert_eq!(b.chunks_remaining(), 2);
    }

    #[test]
    fn test_narrowed_chunks_floor() {
        assert_eq!(budget().narrowed_chunks(0.5), 2);
        assert_eq!(budget().with_chunk_allowance(1).narrowed_chunks(0.5), 1);
        assert_eq!(budget().with_chunk_allowance(0).narrowed_chunks(0.5), 0);
        assert_eq!(budget().narrowed_chunks(3.0), 5);
    }

    #[test]
    fn test_limits_reject_negative() {
        let limits = BudgetLimits {
            tokens: Some(-1),
            ..Default::default()
        };
        assert_eq!(
            limits.into_budget(&Budget::default()),
            Err(ConfigError::Negative { field: "tokens", value: -1 })
        );
    }

    #[test]
    fn test_limits_from_payload() {
        let limits: BudgetLimits =
            serde_json::from_value(serde_json::json!({"time": 1000, "tokens": 10})).unwrap();
        let b = limits.into_budget(&Budget::default()).unwrap();
        assert_eq!(b.time_remaining_ms(), 1000);
        assert_eq!(b.tokens_remaining(), 10);
        assert_eq!(b.files_remaining(), Budget::default().files_remaining());
    }
}
