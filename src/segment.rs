//! Segment naming for segmenting sinks.
//!
//! At every rollover the engine asks the segmenting sink's format-location
//! hook where the next fragment goes. [`SegmentNamingPolicy`] answers with
//! `"{prefix}{start}_{end}.{extension}"`, where `start` is the wall clock in
//! Unix milliseconds at callback time and `end = start + duration`, and
//! writes the same identifier to the nested remote sink's key option so the
//! upload lands under that name.

use std::fmt;
use std::sync::{Arc, Weak};

use serde::{Deserialize, Serialize};

use crate::clock::{Clock, ClockTime};
use crate::engine::{Engine, FragmentContext, NodeHandle};
use crate::error::{Error, Result};

/// Naming and duration of fragments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NamingConfig {
    /// Prepended to every identifier, usually a directory (`vm/`).
    pub prefix: String,
    /// File extension without the dot.
    pub extension: String,
    /// Length of one fragment in milliseconds.
    pub duration_ms: u64,
}

impl Default for NamingConfig {
    fn default() -> Self {
        Self {
            prefix: "vm/".to_string(),
            extension: "mp4".to_string(),
            duration_ms: 15_000,
        }
    }
}

impl NamingConfig {
    /// The segment starting at `start_ms`.
    pub fn segment(&self, fragment_id: u32, start_ms: u64) -> Segment {
        let end_ms = start_ms.saturating_add(self.duration_ms);
        Segment {
            fragment_id,
            start_ms,
            end_ms,
            location: format!("{}{}_{}.{}", self.prefix, start_ms, end_ms, self.extension),
        }
    }

    /// Recover `(start, end)` from an identifier produced by this config.
    pub fn parse(&self, location: &str) -> Option<(u64, u64)> {
        let body = location
            .strip_prefix(&self.prefix)?
            .strip_suffix(&self.extension)?
            .strip_suffix('.')?;
        let (start, end) = body.split_once('_')?;
        Some((start.parse().ok()?, end.parse().ok()?))
    }

    /// Fragment duration in engine time units.
    pub fn max_size_time(&self) -> ClockTime {
        ClockTime::from_millis(self.duration_ms)
    }

    /// Reject configurations that cannot name anything.
    pub fn validate(&self) -> Result<()> {
        if self.duration_ms == 0 {
            return Err(Error::Config("segment duration must be positive".into()));
        }
        if self.extension.is_empty() || self.extension.starts_with('.') {
            return Err(Error::Config(format!(
                "invalid segment extension '{}'",
                self.extension
            )));
        }
        Ok(())
    }
}

/// One named fragment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    /// Zero-based index as counted by the segmenting sink.
    pub fragment_id: u32,
    /// Start, Unix milliseconds.
    pub start_ms: u64,
    /// End, Unix milliseconds.
    pub end_ms: u64,
    /// Destination identifier.
    pub location: String,
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} {}", self.fragment_id, self.location)
    }
}

/// Names fragments and points the nested remote sink at each one.
///
/// The engine is held weakly: the hook lives inside the engine and a strong
/// reference would keep it alive forever.
#[derive(Clone)]
pub struct SegmentNamingPolicy {
    config: NamingConfig,
    clock: Arc<dyn Clock>,
    engine: Weak<dyn Engine>,
    nested: NodeHandle,
    key_property: String,
}

impl SegmentNamingPolicy {
    /// Policy writing identifiers to `nested.key_property`.
    pub fn new(
        engine: &Arc<dyn Engine>,
        nested: NodeHandle,
        key_property: impl Into<String>,
        config: NamingConfig,
    ) -> Self {
        Self {
            config,
            clock: engine.clock(),
            engine: Arc::downgrade(engine),
            nested,
            key_property: key_property.into(),
        }
    }

    /// The segment that would open now.
    pub fn next_segment(&self, fragment_id: u32) -> Segment {
        self.config.segment(fragment_id, self.clock.unix_millis())
    }

    /// Format-location callback body.
    pub fn on_format_location(&self, context: &FragmentContext) -> String {
        let segment = self.next_segment(context.fragment_id);
        match self.engine.upgrade() {
            Some(engine) => {
                if let Err(e) =
                    engine.set_property(self.nested, &self.key_property, segment.location.as_str().into())
                {
                    tracing::warn!("could not set {} for {}: {}", self.key_property, segment, e);
                }
            }
            None => tracing::debug!("engine gone, not setting {}", self.key_property),
        }
        tracing::info!(
            "{} segment {} [{} - {}]",
            context.node,
            segment.location,
            segment.start_ms,
            segment.end_ms
        );
        segment.location
    }

    /// Install on the segmenting sink's format-location hook.
    pub fn install(self, engine: &dyn Engine, sink: NodeHandle) -> Result<()> {
        engine.connect_format_location(
            sink,
            Arc::new(move |context: &FragmentContext| self.on_format_location(context)),
        )
    }
}

impl fmt::Debug for SegmentNamingPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SegmentNamingPolicy")
            .field("config", &self.config)
            .field("nested", &self.nested)
            .field("key_property", &self.key_property)
            .finish()
    }
}
