//! Subscriber setup, spans and timing helpers.

use crate::config::{LogFormat, LoggingConfig};
use std::time::Instant;
use tracing_subscriber::EnvFilter;

fn fallback_level(level: &str) -> &'static str {
    match level.trim().to_ascii_lowercase().as_str() {
        "trace" => "trace",
        "debug" => "debug",
        "warn" => "warn",
        "error" => "error",
        _ => "info",
    }
}

/// Installs a global `tracing` subscriber.
///
/// `RUST_LOG` wins over `config.level`. Returns false if a subscriber was
/// already installed.
pub fn init_tracing(config: &LoggingConfig) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .unwrap_or_else(|_| EnvFilter::new(fallback_level(&config.level)));

    match config.format {
        LogFormat::Pretty => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(config.with_target)
            .try_init()
            .is_ok(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(config.with_target)
            .with_current_span(true)
            .try_init()
            .is_ok(),
    }
}

/// The span every execution runs inside.
#[must_use]
pub fn pipeline_span(tool: &str, execution_id: &str, strategy: &str) -> ::tracing::Span {
    ::tracing::info_span!(
        "pipeline.execute",
        tool = %tool,
        execution_id = %execution_id,
        strategy = %strategy,
    )
}

/// The span a single stage runs inside.
#[must_use]
pub fn stage_span(stage_id: &str) -> ::tracing::Span {
    ::tracing::debug_span!("pipeline.stage", stage = %stage_id)
}

/// Simple span timing helper.
#[derive(Debug)]
pub struct SpanTimer {
    start: Instant,
    name: String,
}

impl SpanTimer {
    /// Starts a new span timer.
    #[must_use]
    pub fn start(name: impl Into<String>) -> Self {
        Self {
            start: Instant::now(),
            name: name.into(),
        }
    }

    /// Returns the elapsed time in milliseconds.
    #[must_use]
    pub fn elapsed_ms(&self) -> f64 {
        self.start.elapsed().as_secs_f64() * 1000.0
    }

    /// Returns the span name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Finishes the span, logs and returns the duration.
    #[must_use]
    pub fn finish(self) -> f64 {
        let elapsed = self.elapsed_ms();
        ::tracing::debug!(span = %self.name, duration_ms = elapsed, "Span finished");
        elapsed
    }
}
