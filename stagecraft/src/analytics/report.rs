//! Aggregated performance report types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Duration statistics of one stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageStats {
    /// The stage id.
    pub stage_id: String,
    /// Executions in which the stage started, cache hits included.
    pub count: u64,
    /// Mean duration of computed runs in milliseconds.
    pub mean_ms: f64,
    /// Median duration.
    pub p50_ms: f64,
    /// 95th percentile duration.
    pub p95_ms: f64,
    /// 99th percentile duration.
    pub p99_ms: f64,
    /// Slowest recorded run.
    pub max_ms: f64,
    /// Executions in which the stage failed permanently.
    pub failures: u64,
    /// Executions in which the stage was served from the cache.
    pub cache_hits: u64,
}

/// Snapshot of engine performance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceReport {
    /// Per-stage statistics, sorted by stage id.
    pub stages: Vec<StageStats>,
    /// Mean over every recorded stage run.
    pub pipeline_mean_stage_ms: f64,
    /// Stages whose mean exceeds `bottleneck_multiplier` times the pipeline mean.
    pub bottlenecks: Vec<String>,
    /// Multiplier used for bottleneck detection.
    pub bottleneck_multiplier: f64,
    /// Executions recorded.
    pub execution_count: u64,
    /// Fraction of executions that succeeded.
    pub success_rate: f64,
    /// Mean execution duration in milliseconds.
    pub mean_execution_ms: f64,
    /// When the report was produced.
    pub generated_at: DateTime<Utc>,
}

impl PerformanceReport {
    /// Statistics of one stage.
    #[must_use]
    pub fn stage(&self, stage_id: &str) -> Option<&StageStats> {
        self.stages.iter().find(|s| s.stage_id == stage_id)
    }

    /// Returns true if the stage was flagged as a bottleneck.
    #[must_use]
    pub fn is_bottleneck(&self, stage_id: &str) -> bool {
        self.bottlenecks.iter().any(|b| b == stage_id)
    }
}

/// Nearest-rank percentile of a sample set; 0 for an empty set.
#[must_use]
pub fn percentile(data: &[f64], pct: u32) -> f64 {
    if data.is_empty() {
        return 0.0;
    }
    let mut sorted = data.to_vec();
    sorted.sort_by(f64::total_cmp);
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
    let idx = ((f64::from(pct) / 100.0) * (sorted.len() as f64 - 1.0)).round() as usize;
    sorted[idx.min(sorted.len() - 1)]
}

/// Arithmetic mean; 0 for an empty set.
#[must_use]
pub fn mean(data: &[f64]) -> f64 {
    if data.is_empty() {
        return 0.0;
    }
    #[allow(clippy::cast_precision_loss)]
    let n = data.len() as f64;
    data.iter().sum::<f64>() / n
}
