//! Pipeline construction and lifecycle.
//!
//! - [`PipelineSpec`]: declarative description of nodes, links, request
//!   links, sometimes-pad routes and the segmenting sink
//! - [`GraphBuilder`]: turns a spec into a [`Graph`] of engine nodes
//! - [`PadBinder`] / [`SometimesRouter`]: request pads and dynamic pads
//! - [`Controller`]: runs a constructed graph to a [`RunReport`]
//! - [`Message`]: bus messages, fanned out through [`MessageSender`]

mod binder;
mod builder;
pub mod controller;
mod events;
mod graph;
pub mod spec;

pub use binder::{PadBinder, RequestedPad, SometimesRouter};
pub use builder::GraphBuilder;
pub use controller::{Controller, ControllerConfig, EosInjection, Outcome, RunReport, RunState};
pub use events::{Message, MessageReceiver, MessageSender};
pub use graph::{Graph, Link, Node, NodeId};
pub use spec::{
    LinkSpec, NodeSpec, PadEndpoint, PipelineSpec, RequestLinkSpec, SegmentSpec, SometimesRoute,
};
