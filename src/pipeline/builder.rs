//! Graph construction from a [`PipelineSpec`].
//!
//! The builder creates every node, applies options and establishes the
//! static links, in declaration order. Construction is all-or-nothing: on the
//! first failure every node created so far is destroyed before the error is
//! returned.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use mediarig::clock::ManualClock;
//! use mediarig::engine::sim::SimEngine;
//! use mediarig::pipeline::{GraphBuilder, NodeSpec, PipelineSpec};
//!
//! let engine = SimEngine::new(Arc::new(ManualClock::new(0)));
//! let spec = PipelineSpec::new("encode")
//!     .with_node(NodeSpec::new("videotestsrc", "src"))
//!     .with_node(NodeSpec::new("x264enc", "enc"))
//!     .with_node(NodeSpec::new("fakesink", "sink"))
//!     .link_many(&["src", "enc", "sink"]);
//!
//! let graph = GraphBuilder::new(engine).build(&spec).unwrap();
//! assert_eq!(graph.edge_count(), 2);
//! ```

use std::sync::Arc;

use crate::engine::{Engine, PadHandle};
use crate::error::{Error, Result};
use crate::format::Caps;
use crate::pipeline::graph::{Graph, Link};
use crate::pipeline::spec::{LinkSpec, PipelineSpec};

/// Builds a [`Graph`] inside an engine.
pub struct GraphBuilder {
    engine: Arc<dyn Engine>,
}

impl GraphBuilder {
    /// Builder creating nodes in `engine`.
    pub fn new(engine: Arc<dyn Engine>) -> Self {
        Self { engine }
    }

    /// Create nodes, apply options and link static pads.
    pub fn build(&self, spec: &PipelineSpec) -> Result<Graph> {
        spec.check()?;
        let mut graph = Graph::new(spec.name.clone(), Arc::clone(&self.engine));

        if let Err(e) = self.populate(&mut graph, spec) {
            tracing::debug!("construction of '{}' failed, destroying {} nodes", spec.name, graph.node_count());
            if let Err(destroy) = graph.destroy() {
                tracing::warn!("cleanup after failed construction: {}", destroy);
            }
            return Err(e);
        }

        tracing::debug!(
            "built '{}': {} nodes, {} links",
            spec.name,
            graph.node_count(),
            graph.edge_count()
        );
        Ok(graph)
    }

    fn populate(&self, graph: &mut Graph, spec: &PipelineSpec) -> Result<()> {
        for node in &spec.nodes {
            let handle = self.engine.create_node(&node.kind, &node.name)?;
            let category = self
                .engine
                .catalog()
                .get(&node.kind)
                .map(|k| k.category)
                .ok_or_else(|| Error::NodeCreation {
                    kind: node.kind.clone(),
                    name: node.name.clone(),
                    reason: "kind missing from catalog".into(),
                })?;
            graph.add_node(node.name.clone(), node.kind.clone(), category, handle);
            tracing::debug!("created {} '{}'", node.kind, node.name);
        }

        // All nodes exist before options apply, so an option may name another node.
        for node in &spec.nodes {
            let handle = graph.handle(&node.name)?;
            for (name, value) in &node.options {
                tracing::debug!("{}.{} = {}", node.name, name, value);
                self.engine.set_property(handle, name, value.clone())?;
            }
        }

        for link in &spec.links {
            self.link_static(graph, link)?;
        }
        Ok(())
    }

    fn link_static(&self, graph: &mut Graph, link: &LinkSpec) -> Result<()> {
        let src = self.static_pad(graph, &link.src.node, &link.src.pad)?;
        let sink = self.static_pad(graph, &link.sink.node, &link.sink.pad)?;
        link_pads(self.engine.as_ref(), graph, &src, &sink, link.caps.as_ref(), false)
    }

    fn static_pad(&self, graph: &Graph, node: &str, pad: &str) -> Result<PadHandle> {
        let handle = graph.handle(node)?;
        self.engine.static_pad(handle, pad).ok_or_else(|| {
            Error::link(
                format!("{}.{}", node, pad),
                "?",
                format!("node '{}' has no pad '{}'", node, pad),
            )
        })
    }
}

/// Link two pads, recording the link in `graph`.
///
/// The caps intersection is checked before the engine is asked, so a link
/// with an incompatible constraint never reaches it.
pub(crate) fn link_pads(
    engine: &dyn Engine,
    graph: &mut Graph,
    src: &PadHandle,
    sink: &PadHandle,
    filter: Option<&Caps>,
    dynamic: bool,
) -> Result<()> {
    let src_caps = engine.pad_caps(src).unwrap_or(Caps::Any);
    let sink_caps = engine.pad_caps(sink).unwrap_or(Caps::Any);
    if src_caps.intersect_filtered(filter, &sink_caps).is_none() {
        let reason = match filter {
            Some(f) => format!("{} does not fit between {} and {}", f, src_caps, sink_caps),
            None => format!("no common format between {} and {}", src_caps, sink_caps),
        };
        return Err(Error::link(src.to_string(), sink.to_string(), reason));
    }

    let edge = graph.add_link(
        &src.node_name,
        &sink.node_name,
        Link {
            src_pad: src.name.clone(),
            sink_pad: sink.name.clone(),
            caps: filter.cloned(),
            dynamic,
        },
    )?;
    if let Err(e) = engine.link_pads(src, sink, filter) {
        graph.remove_link(edge);
        return Err(e);
    }
    tracing::debug!("linked {} -> {}", src, sink);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::engine::sim::{Op, SimEngine};
    use crate::pipeline::spec::NodeSpec;

    fn engine() -> Arc<SimEngine> {
        SimEngine::new(Arc::new(ManualClock::new(0)))
    }

    #[test]
    fn test_build_applies_options_in_order() {
        let engine = engine();
        let spec = PipelineSpec::new("p")
            .with_node(
                NodeSpec::new("x264enc", "enc")
                    .option("speed-preset", 1u32)
                    .option("bitrate", 128u32),
            )
            .with_node(NodeSpec::new("videotestsrc", "src"))
            .with_node(NodeSpec::new("fakesink", "sink"))
            .link_many(&["src", "enc", "sink"]);
        let graph = GraphBuilder::new(engine.clone()).build(&spec).unwrap();
        assert_eq!(graph.node_count(), 3);

        let props: Vec<String> = engine
            .journal()
            .into_iter()
            .filter_map(|op| match op {
                Op::PropertySet { name, .. } => Some(name),
                _ => None,
            })
            .collect();
        assert_eq!(props, vec!["speed-preset", "bitrate"]);
    }

    #[test]
    fn test_unknown_kind_destroys_created_nodes() {
        let engine = engine();
        let spec = PipelineSpec::new("p")
            .with_node(NodeSpec::new("videotestsrc", "src"))
            .with_node(NodeSpec::new("queue", "q"))
            .with_node(NodeSpec::new("nvh264enc", "enc"));
        let err = GraphBuilder::new(engine.clone()).build(&spec).unwrap_err();
        assert!(matches!(err, Error::NodeCreation { .. }));
        assert_eq!(engine.live_nodes(), 0);
        let destroyed: Vec<String> = engine.destroyed_nodes().into_iter().map(|(n, _)| n).collect();
        assert_eq!(destroyed, vec!["q", "src"]);
    }

    #[test]
    fn test_incompatible_filter_never_reaches_engine() {
        let engine = engine();
        let spec = PipelineSpec::new("p")
            .with_node(NodeSpec::new("audiotestsrc", "src"))
            .with_node(NodeSpec::new("fdkaacenc", "enc"))
            .with_node(NodeSpec::new("fakesink", "sink"))
            .link_filtered("src", "enc", Caps::audio_raw(17000, 1))
            .link_many(&["enc", "sink"]);
        let err = GraphBuilder::new(engine.clone()).build(&spec).unwrap_err();
        assert!(matches!(err, Error::Link { .. }));
        assert!(engine.links().is_empty());
        assert_eq!(engine.live_nodes(), 0);
    }

    #[test]
    fn test_missing_pad_is_link_error() {
        let engine = engine();
        let spec = PipelineSpec::new("p")
            .with_node(NodeSpec::new("tee", "tee"))
            .with_node(NodeSpec::new("fakesink", "sink"))
            .link_many(&["tee", "sink"]);
        // tee only has request outputs.
        let err = GraphBuilder::new(engine).build(&spec).unwrap_err();
        assert!(matches!(err, Error::Link { .. }));
    }
}
