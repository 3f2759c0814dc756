//! Tracing spans and log setup.
//!
//! The library only emits `tracing` events; binaries decide where they go.
//! [`init_logging`] installs a `tracing-subscriber` formatter filtered by
//! `RUST_LOG` (default `info`).
//!
//! Spans:
//! - `pipeline`: one per assembled or running pipeline, carrying its name
//!
//! ## Example
//!
//! ```rust
//! use mediarig::observability::span_pipeline;
//!
//! let span = span_pipeline("splitmux-s3");
//! let _guard = span.enter();
//! tracing::info!("inside the pipeline span");
//! ```

mod tracing_support;

pub use tracing_support::{
    LogConfig, init_logging, span_pipeline, trace_segment, trace_state_change,
};
