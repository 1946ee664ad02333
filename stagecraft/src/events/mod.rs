//! Engine lifecycle events.
//!
//! The engine emits these to an injected [`EventSink`]; sinks never affect
//! execution.

mod sink;

pub use sink::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};

/// An execution was accepted and planned.
pub const EXECUTION_STARTED: &str = "execution.started";
/// An execution produced its result.
pub const EXECUTION_COMPLETED: &str = "execution.completed";
/// A stage started its first attempt.
pub const STAGE_STARTED: &str = "stage.started";
/// A stage succeeded.
pub const STAGE_COMPLETED: &str = "stage.completed";
/// A stage failed permanently.
pub const STAGE_FAILED: &str = "stage.failed";
/// A stage attempt failed and will be retried with a narrowed scope.
pub const STAGE_RETRYING: &str = "stage.retrying";
/// A stage was never started.
pub const STAGE_SKIPPED: &str = "stage.skipped";
/// A cacheable stage was served from the cache.
pub const CACHE_HIT: &str = "cache.hit";
/// A cacheable stage had to be computed.
pub const CACHE_MISS: &str = "cache.miss";
