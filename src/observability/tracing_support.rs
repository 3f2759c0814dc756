//! Tracing integration for structured logging and spans.

use std::fmt::Display;

use tracing::{Level, Span, span};
use tracing_subscriber::EnvFilter;

/// Log output settings for [`init_logging`].
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Filter used when `RUST_LOG` is unset.
    pub default_filter: String,
    /// Include the event target (module path).
    pub with_target: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            default_filter: "info".to_string(),
            with_target: false,
        }
    }
}

impl LogConfig {
    /// Verbose settings for debugging wiring problems.
    pub fn verbose() -> Self {
        Self {
            default_filter: "debug".to_string(),
            with_target: true,
        }
    }
}

/// Install the global subscriber.
///
/// Does nothing if one is already installed, so tests and embedding
/// applications can call it freely.
pub fn init_logging(config: &LogConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.default_filter));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(config.with_target)
        .try_init();
}

/// Create a span for one pipeline.
#[inline]
pub fn span_pipeline(name: &str) -> Span {
    span!(Level::INFO, "pipeline", name = %name)
}

/// Log a run state change.
#[inline]
pub fn trace_state_change(pipeline: &str, from: &impl Display, to: &impl Display) {
    tracing::info!(
        pipeline = %pipeline,
        from = %from,
        to = %to,
        "pipeline state changed"
    );
}

/// Log a newly opened segment.
#[inline]
pub fn trace_segment(pipeline: &str, location: &str) {
    tracing::info!(
        pipeline = %pipeline,
        location = %location,
        "segment opened"
    );
}
