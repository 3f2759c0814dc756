//! # mediarig
//!
//! Orchestration for segment-boundary recording pipelines.
//!
//! A streaming engine does the media work. mediarig decides what the engine
//! builds and how a run starts and stops:
//!
//! - [`pipeline::GraphBuilder`]: creates nodes, applies options and links
//!   static pads from a [`pipeline::PipelineSpec`]
//! - [`pipeline::PadBinder`]: requests, links and releases request pads, and
//!   routes pads a decoder adds while running
//! - [`segment::SegmentNamingPolicy`]: names every fragment
//!   `{prefix}{start}_{end}.{ext}` from the wall clock
//! - [`pipeline::Controller`]: start, bus polling, graceful EOS stop with a
//!   grace period, and teardown that always runs
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use mediarig::clock::{ClockTime, ManualClock};
//! use mediarig::config::RecorderConfig;
//! use mediarig::engine::sim::SimEngine;
//! use mediarig::pipeline::Controller;
//!
//! let mut config = RecorderConfig::default();
//! config.run.stop_after_ms = Some(20_000);
//!
//! let engine = SimEngine::new(Arc::new(ManualClock::new(0)));
//! let spec = config.recipe.spec(&config)?;
//! let report = Controller::assemble(engine, &spec, config.controller_config())?.run();
//!
//! assert!(report.is_success());
//! assert_eq!(report.segments, vec!["vm/0_15000.mp4", "vm/15000_30000.mp4"]);
//! # Ok::<(), mediarig::Error>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod clock;
pub mod config;
pub mod element;
pub mod engine;
pub mod error;
pub mod format;
pub mod interrupt;
pub mod observability;
pub mod pipeline;
pub mod recipes;
pub mod segment;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::clock::{Clock, ClockTime, ManualClock, SystemClock};
    pub use crate::config::RecorderConfig;
    pub use crate::engine::{Engine, EosTarget};
    pub use crate::error::{Error, Result};
    pub use crate::interrupt::Interrupt;
    pub use crate::pipeline::{Controller, ControllerConfig, PipelineSpec, RunReport};
    pub use crate::recipes::Recipe;
}

pub use error::{Error, Result};
