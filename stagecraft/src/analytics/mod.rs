//! Performance analytics and replay.
//!
//! Every finished execution is recorded here: its result goes into a bounded
//! history for replay, and its stage durations feed the performance report
//! and the adaptive strategy's contention check.

mod history;
mod report;
mod tracker;

pub use history::ExecutionHistory;
pub use report::{mean, percentile, PerformanceReport, StageStats};
pub use tracker::PerformanceAnalytics;
