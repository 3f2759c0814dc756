//! The seam between the orchestrator and a streaming engine.
//!
//! The orchestrator never touches media. It asks an [`Engine`] to create
//! nodes, set options, link pads, hand out request pads, change run state
//! and deliver bus messages. Everything behind that seam (buffering,
//! scheduling, codecs, uploads) belongs to the engine.
//!
//! Handles are shared as `Arc<dyn Engine>`: every method takes `&self` and
//! the implementation synchronizes internally, so callbacks running on the
//! engine's delivery path may call back into it.
//!
//! - [`KindCatalog`]: node kinds the engine can instantiate
//! - [`sim::SimEngine`]: deterministic discrete-event engine

pub mod catalog;
pub mod sim;

pub use catalog::KindCatalog;

use std::fmt;
use std::sync::Arc;

use crate::clock::{Clock, ClockTime};
use crate::element::{PadRef, PropertyValue};
use crate::error::Result;
use crate::format::Caps;
use crate::pipeline::Message;

/// Opaque reference to a node inside an engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeHandle(pub(crate) u64);

impl NodeHandle {
    /// Raw identifier, unique per engine.
    pub fn id(&self) -> u64 {
        self.0
    }
}

/// A concrete pad inside an engine.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PadHandle {
    /// Owning node.
    pub node: NodeHandle,
    /// Owning node's name.
    pub node_name: String,
    /// Pad name (e.g. `src`, `audio_0`).
    pub name: String,
    /// Issued per pad instance. A pad requested again under a released
    /// name gets a new serial, so handles to the old pad stop matching.
    pub serial: u64,
}

impl PadHandle {
    /// Name-only reference to this pad.
    pub fn to_ref(&self) -> PadRef {
        PadRef::new(self.node_name.clone(), self.name.clone())
    }
}

impl fmt::Display for PadHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.node_name, self.name)
    }
}

/// Run state of the whole engine graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EngineState {
    /// No resources allocated.
    Null,
    /// Resources allocated, not processing.
    Ready,
    /// Pre-rolled, clock stopped.
    Paused,
    /// Data flowing.
    Playing,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Null => "NULL",
            Self::Ready => "READY",
            Self::Paused => "PAUSED",
            Self::Playing => "PLAYING",
        })
    }
}

/// Where an end-of-stream event is injected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EosTarget {
    /// Into one node, typically the segmenting sink.
    Node(NodeHandle),
    /// Into every source of the graph.
    Pipeline,
}

/// Passed to a format-location hook right before a fragment is opened.
#[derive(Debug, Clone)]
pub struct FragmentContext {
    /// Name of the segmenting sink.
    pub node: String,
    /// Zero-based fragment index.
    pub fragment_id: u32,
    /// Engine running time at which the fragment starts.
    pub running_time: ClockTime,
}

/// A pad that appeared on a running node.
#[derive(Debug, Clone)]
pub struct NewPad {
    /// The new pad.
    pub pad: PadHandle,
    /// What it produces.
    pub caps: Caps,
}

/// Format-location hook: returns the destination of the fragment about to open.
pub type FormatLocationFn = Arc<dyn Fn(&FragmentContext) -> String + Send + Sync>;

/// Pad-added hook.
pub type PadAddedFn = Arc<dyn Fn(&NewPad) + Send + Sync>;

/// A subscription to the engine's message bus.
///
/// Dropping the bus releases the subscription.
pub trait Bus: Send {
    /// Wait up to `timeout` (engine clock) for the next message.
    fn timed_pop(&mut self, timeout: ClockTime) -> Option<Message>;
}

/// Operations the orchestrator needs from a streaming engine.
pub trait Engine: Send + Sync {
    /// Node kinds this engine can instantiate.
    fn catalog(&self) -> &KindCatalog;

    /// Clock driving the engine's running time.
    fn clock(&self) -> Arc<dyn Clock>;

    /// Create a node of `kind` named `name`.
    fn create_node(&self, kind: &str, name: &str) -> Result<NodeHandle>;

    /// Name of a live node.
    fn node_name(&self, node: NodeHandle) -> Option<String>;

    /// Set an option on a node.
    fn set_property(&self, node: NodeHandle, name: &str, value: PropertyValue) -> Result<()>;

    /// Read back an option.
    fn property(&self, node: NodeHandle, name: &str) -> Option<PropertyValue>;

    /// An always-present pad by name.
    fn static_pad(&self, node: NodeHandle, name: &str) -> Option<PadHandle>;

    /// Caps a pad produces or accepts.
    fn pad_caps(&self, pad: &PadHandle) -> Option<Caps>;

    /// Link an output pad to an input pad, optionally through a caps filter.
    fn link_pads(&self, src: &PadHandle, sink: &PadHandle, filter: Option<&Caps>) -> Result<()>;

    /// Whether a pad currently has a peer.
    fn is_linked(&self, pad: &PadHandle) -> bool;

    /// Instantiate a request pad from `template`.
    fn request_pad(&self, node: NodeHandle, template: &str) -> Result<PadHandle>;

    /// Give back a request pad. A pad can be released once.
    fn release_pad(&self, pad: &PadHandle) -> Result<()>;

    /// Destroy a node and free its resources.
    fn destroy_node(&self, node: NodeHandle) -> Result<()>;

    /// Move the whole graph to `state`.
    fn set_state(&self, state: EngineState) -> Result<()>;

    /// Current run state.
    fn state(&self) -> EngineState;

    /// Subscribe to the message bus.
    fn bus(&self) -> Result<Box<dyn Bus>>;

    /// Inject end-of-stream.
    fn send_eos(&self, target: EosTarget) -> Result<()>;

    /// Install the format-location hook of a segmenting sink.
    fn connect_format_location(&self, node: NodeHandle, hook: FormatLocationFn) -> Result<()>;

    /// Install the pad-added hook of a node with sometimes pads.
    fn connect_pad_added(&self, node: NodeHandle, hook: PadAddedFn) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pad_handle_display() {
        let pad = PadHandle {
            node: NodeHandle(3),
            node_name: "mux".into(),
            name: "audio_0".into(),
            serial: 1,
        };
        assert_eq!(pad.to_string(), "mux.audio_0");
        assert_eq!(pad.to_ref(), PadRef::new("mux", "audio_0"));
    }

    #[test]
    fn test_engine_state_order() {
        assert!(EngineState::Null < EngineState::Playing);
        assert_eq!(EngineState::Paused.to_string(), "PAUSED");
    }
}
