//! Per-stage duration samples and execution totals.

use super::history::ExecutionHistory;
use super::report::{mean, percentile, PerformanceReport, StageStats};
use crate::config::AnalyticsConfig;
use crate::core::StageState;
use crate::pipeline::{ExecutionResult, ExecutionStrategy};
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::{BTreeMap, VecDeque};
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Default)]
struct StageSamples {
    count: u64,
    failures: u64,
    cache_hits: u64,
    sequential: VecDeque<f64>,
    parallel: VecDeque<f64>,
}

impl StageSamples {
    fn push(&mut self, mode: ExecutionStrategy, duration_ms: f64, cap: usize) {
        let samples = if mode == ExecutionStrategy::Parallel {
            &mut self.parallel
        } else {
            &mut self.sequential
        };
        if cap == 0 {
            return;
        }
        while samples.len() >= cap {
            samples.pop_front();
        }
        samples.push_back(duration_ms);
    }

    fn all(&self) -> Vec<f64> {
        self.sequential.iter().chain(self.parallel.iter()).copied().collect()
    }
}

#[derive(Debug, Default)]
struct Totals {
    executions: u64,
    succeeded: u64,
    duration_ms: f64,
}

/// Records execution traces and answers performance questions about them.
///
/// Owned by one engine and shared by its executions; every method takes
/// `&self`.
#[derive(Debug)]
pub struct PerformanceAnalytics {
    config: AnalyticsConfig,
    history: ExecutionHistory,
    stages: RwLock<BTreeMap<String, StageSamples>>,
    totals: RwLock<Totals>,
}

impl PerformanceAnalytics {
    /// Creates an empty tracker.
    #[must_use]
    pub fn new(config: AnalyticsConfig) -> Self {
        Self {
            history: ExecutionHistory::new(config.history_capacity),
            config,
            stages: RwLock::new(BTreeMap::new()),
            totals: RwLock::new(Totals::default()),
        }
    }

    /// Records a finished execution.
    pub fn record(&self, result: &ExecutionResult) {
        {
            let mut stages = self.stages.write();
            for stage_id in &result.stages_executed {
                let attempts = result.attempts_for(stage_id);
                let samples = stages.entry(stage_id.clone()).or_default();
                samples.count += 1;

                if attempts.iter().any(|a| a.cache_hit) {
                    samples.cache_hits += 1;
                    continue;
                }
                if result.stage_state(stage_id) == Some(StageState::Failed) {
                    samples.failures += 1;
                }
                if let (Some(first), Some(last)) = (attempts.first(), attempts.last()) {
                    let duration = (last.ended_offset_ms - first.started_offset_ms).max(0.0);
                    samples.push(result.resolved_strategy, duration, self.config.max_samples_per_stage);
                }
            }
        }
        {
            let mut totals = self.totals.write();
            totals.executions += 1;
            if result.success {
                totals.succeeded += 1;
            }
            totals.duration_ms += result.duration_ms;
        }
        debug!(
            execution_id = %result.execution_id,
            stages = result.stages_executed.len(),
            "Recorded execution"
        );
        self.history.push(result.clone());
    }

    /// Most recent results, newest first.
    #[must_use]
    pub fn history(&self, limit: usize) -> Vec<ExecutionResult> {
        self.history.recent(limit)
    }

    /// The stored result of an execution, unchanged, if it has not aged out.
    #[must_use]
    pub fn replay(&self, execution_id: Uuid) -> Option<ExecutionResult> {
        self.history.find(execution_id)
    }

    /// Builds a performance report from everything recorded so far.
    #[must_use]
    pub fn report(&self) -> PerformanceReport {
        let stages = self.stages.read();
        let mut pooled = Vec::new();
        let mut stats = Vec::with_capacity(stages.len());

        for (stage_id, samples) in stages.iter() {
            let all = samples.all();
            pooled.extend_from_slice(&all);
            stats.push(StageStats {
                stage_id: stage_id.clone(),
                count: samples.count,
                mean_ms: mean(&all),
                p50_ms: percentile(&all, 50),
                p95_ms: percentile(&all, 95),
                p99_ms: percentile(&all, 99),
                max_ms: all.iter().copied().fold(0.0, f64::max),
                failures: samples.failures,
                cache_hits: samples.cache_hits,
            });
        }

        let pipeline_mean = mean(&pooled);
        let multiplier = self.config.bottleneck_multiplier;
        let bottlenecks = stats
            .iter()
            .filter(|s| pipeline_mean > 0.0 && s.mean_ms > multiplier * pipeline_mean)
            .map(|s| s.stage_id.clone())
            .collect();

        let totals = self.totals.read();
        #[allow(clippy::cast_precision_loss)]
        let (success_rate, mean_execution_ms) = if totals.executions == 0 {
            (0.0, 0.0)
        } else {
            let n = totals.executions as f64;
            (totals.succeeded as f64 / n, totals.duration_ms / n)
        };

        PerformanceReport {
            stages: stats,
            pipeline_mean_stage_ms: pipeline_mean,
            bottlenecks,
            bottleneck_multiplier: multiplier,
            execution_count: totals.executions,
            success_rate,
            mean_execution_ms,
            generated_at: Utc::now(),
        }
    }

    /// Returns true if history shows the stages do not slow each other down.
    ///
    /// A stage is contended when its mean under parallel runs exceeds
    /// `tolerance` times its mean under sequential runs. Stages missing
    /// samples in either mode count as independent.
    #[must_use]
    pub fn is_order_independent(&self, stage_ids: &[&str], tolerance: f64) -> bool {
        let stages = self.stages.read();
        stage_ids.iter().all(|id| {
            let Some(samples) = stages.get(*id) else {
                return true;
            };
            if samples.sequential.is_empty() || samples.parallel.is_empty() {
                return true;
            }
            let sequential: Vec<f64> = samples.sequential.iter().copied().collect();
            let parallel: Vec<f64> = samples.parallel.iter().copied().collect();
            mean(&parallel) <= tolerance * mean(&sequential)
        })
    }

    /// Number of results currently held for replay.
    #[must_use]
    pub fn history_len(&self) -> usize {
        self.history.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;
    use crate::governor::{Budget, ResourceUsage, Scope};
    use crate::pipeline::{ExecutionError, StageAttempt};

    fn attempt(stage: &str, start: f64, end: f64, cache_hit: bool) -> StageAttempt {
        StageAttempt {
            stage_id: stage.to_string(),
            attempt: 1,
            started_offset_ms: start,
            ended_offset_ms: end,
            scope: Scope::default(),
            chunk_allowance: 5,
            usage: ResourceUsage::default(),
            cache_hit,
            error: None,
        }
    }

    fn trace(mode: ExecutionStrategy, runs: &[(&str, f64)]) -> ExecutionResult {
        let mut result = ExecutionResult::rejected("analyze", mode, ExecutionError::request("x"));
        result.errors.clear();
        result.success = true;
        result.resolved_strategy = mode;
        result.budget_used = Budget::zero();
        let mut offset = 0.0;
        for (stage, duration) in runs {
            result.stages_executed.push((*stage).to_string());
            result.stage_states.insert((*stage).to_string(), StageState::Succeeded);
            result.attempts.push(attempt(stage, offset, offset + duration, false));
            offset += duration;
        }
        result.duration_ms = offset;
        result
    }

    fn analytics() -> PerformanceAnalytics {
        PerformanceAnalytics::new(AnalyticsConfig::default())
    }

    #[test]
    fn test_report_percentiles_and_totals() {
        let a = analytics();
        for d in [10.0, 20.0, 30.0, 40.0, 50.0] {
            a.record(&trace(ExecutionStrategy::Sequential, &[("docs", d)]));
        }
        let report = a.report();
        let docs = report.stage("docs").unwrap();
        assert_eq!(docs.count, 5);
        assert!((docs.mean_ms - 30.0).abs() < 1e-9);
        assert!((docs.p50_ms - 30.0).abs() < 1e-9);
        assert!((docs.max_ms - 50.0).abs() < 1e-9);
        assert_eq!(report.execution_count, 5);
        assert!((report.success_rate - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_bottleneck_detection() {
        let a = analytics();
        for _ in 0..3 {
            a.record(&trace(
                ExecutionStrategy::Sequential,
                &[("parse", 1.0), ("docs", 1.0), ("search", 1.0), ("edit", 50.0)],
            ));
        }
        let report = a.report();
        assert_eq!(report.bottlenecks, vec!["edit".to_string()]);
        assert!(report.is_bottleneck("edit"));
        assert!(!report.is_bottleneck("docs"));
    }

    #[test]
    fn test_failures_and_cache_hits_counted() {
        let a = analytics();
        let mut failed = trace(ExecutionStrategy::Sequential, &[("fetch", 5.0)]);
        failed.success = false;
        failed.stage_states.insert("fetch".into(), StageState::Failed);
        failed.errors.push(ExecutionError {
            stage_id: "fetch".into(),
            kind: ErrorKind::StageExecution,
            message: "503".into(),
            attempt: 1,
        });
        a.record(&failed);

        let mut cached = trace(ExecutionStrategy::Sequential, &[]);
        cached.stages_executed.push("fetch".into());
        cached.attempts.push(attempt("fetch", 0.0, 0.0, true));
        a.record(&cached);

        let report = a.report();
        let fetch = report.stage("fetch").unwrap();
        assert_eq!(fetch.count, 2);
        assert_eq!(fetch.failures, 1);
        assert_eq!(fetch.cache_hits, 1);
        assert!((report.success_rate - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_order_independence() {
        let a = analytics();
        assert!(a.is_order_independent(&["a", "b"], 1.5));

        a.record(&trace(ExecutionStrategy::Sequential, &[("a", 10.0), ("b", 10.0)]));
        a.record(&trace(ExecutionStrategy::Parallel, &[("a", 12.0), ("b", 40.0)]));
        assert!(a.is_order_independent(&["a"], 1.5));
        assert!(!a.is_order_independent(&["a", "b"], 1.5));
        assert!(a.is_order_independent(&["a", "c"], 1.5));
    }

    #[test]
    fn test_replay_unchanged() {
        let a = analytics();
        let result = trace(ExecutionStrategy::Sequential, &[("a", 1.0)]);
        a.record(&result);
        assert_eq!(a.replay(result.execution_id), Some(result));
        assert!(a.replay(Uuid::new_v4()).is_none());
        assert_eq!(a.history(10).len(), 1);
    }
}
