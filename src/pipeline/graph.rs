//! The constructed pipeline graph, using daggy.
//!
//! A [`Graph`] owns every node created for one pipeline instance. It mirrors
//! the links established in the engine as DAG edges, rejects cycles,
//! validates structure before the run and destroys nodes in reverse creation
//! order at teardown.

use std::collections::{HashMap, HashSet};
use std::fmt::Write as _;
use std::sync::Arc;

use daggy::{Dag, EdgeIndex, NodeIndex, Walker};

use crate::element::{NodeCategory, PadDirection, PadRef};
use crate::engine::{Engine, NodeHandle};
use crate::error::{Error, Result};
use crate::format::Caps;
use crate::pipeline::spec::SometimesRoute;

/// Unique identifier for a node in the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub(crate) NodeIndex);

impl NodeId {
    /// Get the underlying index.
    pub fn index(&self) -> usize {
        self.0.index()
    }
}

/// A node in the pipeline graph.
#[derive(Debug, Clone)]
pub struct Node {
    name: String,
    kind: String,
    category: NodeCategory,
    handle: NodeHandle,
}

impl Node {
    /// Get the node's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Kind name.
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Category of the kind.
    pub fn category(&self) -> NodeCategory {
        self.category
    }

    /// Engine handle.
    pub fn handle(&self) -> NodeHandle {
        self.handle
    }
}

/// A link between two nodes in the graph.
#[derive(Debug, Clone)]
pub struct Link {
    /// Name of the source pad.
    pub src_pad: String,
    /// Name of the sink pad.
    pub sink_pad: String,
    /// Format constraint, if any.
    pub caps: Option<Caps>,
    /// True if either side is a request pad.
    pub dynamic: bool,
}

/// All nodes and links of one pipeline instance.
pub struct Graph {
    name: String,
    engine: Arc<dyn Engine>,
    dag: Dag<Node, Link>,
    nodes_by_name: HashMap<String, NodeId>,
    creation_order: Vec<NodeId>,
    destroyed: bool,
}

impl Graph {
    /// Create an empty graph whose nodes live in `engine`.
    pub fn new(name: impl Into<String>, engine: Arc<dyn Engine>) -> Self {
        Self {
            name: name.into(),
            engine,
            dag: Dag::new(),
            nodes_by_name: HashMap::new(),
            creation_order: Vec::new(),
            destroyed: false,
        }
    }

    /// Pipeline name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Record a node the engine has created.
    pub fn add_node(
        &mut self,
        name: impl Into<String>,
        kind: impl Into<String>,
        category: NodeCategory,
        handle: NodeHandle,
    ) -> NodeId {
        let name = name.into();
        let idx = self.dag.add_node(Node {
            name: name.clone(),
            kind: kind.into(),
            category,
            handle,
        });
        let id = NodeId(idx);
        self.nodes_by_name.insert(name, id);
        self.creation_order.push(id);
        id
    }

    /// Get a node by ID.
    pub fn get_node(&self, id: NodeId) -> Option<&Node> {
        self.dag.node_weight(id.0)
    }

    /// Get a node ID by name.
    pub fn get_node_id(&self, name: &str) -> Option<NodeId> {
        self.nodes_by_name.get(name).copied()
    }

    /// Engine handle of a node by name.
    pub fn handle(&self, name: &str) -> Result<NodeHandle> {
        self.get_node_id(name)
            .and_then(|id| self.get_node(id))
            .map(Node::handle)
            .ok_or_else(|| Error::InvalidPipeline(format!("no node named '{}'", name)))
    }

    /// Record a link. Fails if it would create a cycle.
    pub fn add_link(&mut self, src: &str, sink: &str, link: Link) -> Result<EdgeIndex> {
        let (Some(a), Some(b)) = (self.get_node_id(src), self.get_node_id(sink)) else {
            return Err(Error::link(
                format!("{}.{}", src, link.src_pad),
                format!("{}.{}", sink, link.sink_pad),
                "unknown node",
            ));
        };
        let (src_pad, sink_pad) = (link.src_pad.clone(), link.sink_pad.clone());
        self.dag.add_edge(a.0, b.0, link).map_err(|_| {
            Error::link(
                format!("{}.{}", src, src_pad),
                format!("{}.{}", sink, sink_pad),
                "linking would create a cycle",
            )
        })
    }

    /// Forget a link recorded with [`Graph::add_link`].
    pub fn remove_link(&mut self, edge: EdgeIndex) {
        self.dag.remove_edge(edge);
    }

    /// Nodes in creation order.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.creation_order
            .iter()
            .filter_map(|id| self.dag.node_weight(id.0))
    }

    /// Links as `(src node, sink node, link)`.
    pub fn links(&self) -> Vec<(&str, &str, &Link)> {
        self.dag
            .graph()
            .edge_indices()
            .filter_map(|e| {
                let (a, b) = self.dag.graph().edge_endpoints(e)?;
                Some((
                    self.dag.node_weight(a)?.name(),
                    self.dag.node_weight(b)?.name(),
                    self.dag.edge_weight(e)?,
                ))
            })
            .collect()
    }

    /// Get the children (downstream nodes) of a node.
    pub fn children(&self, id: NodeId) -> Vec<NodeId> {
        self.dag
            .children(id.0)
            .iter(&self.dag)
            .map(|(_, node_idx)| NodeId(node_idx))
            .collect()
    }

    /// Nodes that originate media.
    pub fn sources(&self) -> Vec<NodeId> {
        self.by_category(|c| matches!(c, NodeCategory::Source | NodeCategory::Decoder))
    }

    /// Terminal nodes.
    pub fn sinks(&self) -> Vec<NodeId> {
        self.by_category(|c| c == NodeCategory::Sink)
    }

    fn by_category(&self, pred: impl Fn(NodeCategory) -> bool) -> Vec<NodeId> {
        self.creation_order
            .iter()
            .copied()
            .filter(|id| self.get_node(*id).is_some_and(|n| pred(n.category)))
            .collect()
    }

    /// Get the number of nodes in the graph.
    pub fn node_count(&self) -> usize {
        self.dag.node_count()
    }

    /// Get the number of links in the graph.
    pub fn edge_count(&self) -> usize {
        self.dag.edge_count()
    }

    /// Check if the graph is empty.
    pub fn is_empty(&self) -> bool {
        self.dag.node_count() == 0
    }

    /// Validate the structure before running.
    ///
    /// Checks that:
    /// - There is at least one source and one sink
    /// - Every always-present pad is linked, except on `embedded` nodes and
    ///   on route targets that get linked while running
    /// - Every node lies on a path from a source to a sink, counting each
    ///   route as an edge from the decoder to its target
    pub fn validate(&self, embedded: &HashSet<String>, routes: &[SometimesRoute]) -> Result<()> {
        if self.is_empty() {
            return Err(Error::InvalidPipeline("pipeline is empty".into()));
        }
        if self.sources().is_empty() {
            return Err(Error::InvalidPipeline("pipeline has no source nodes".into()));
        }
        if self.sinks().is_empty() {
            return Err(Error::InvalidPipeline("pipeline has no sink nodes".into()));
        }

        let deferred: HashSet<&PadRef> = routes.iter().map(|r| &r.target).collect();
        let catalog = self.engine.catalog();
        for node in self.nodes().filter(|n| !embedded.contains(&n.name)) {
            let Some(info) = catalog.get(&node.kind) else {
                continue;
            };
            for template in info.always_inputs().chain(info.always_outputs()) {
                if deferred.contains(&PadRef::new(node.name.clone(), template.name.clone())) {
                    continue;
                }
                let linked = self
                    .engine
                    .static_pad(node.handle, &template.name)
                    .is_some_and(|pad| self.engine.is_linked(&pad));
                if !linked {
                    let side = match template.direction {
                        PadDirection::Input => "input",
                        PadDirection::Output => "output",
                    };
                    return Err(Error::InvalidPipeline(format!(
                        "{} pad '{}.{}' is not linked",
                        side, node.name, template.name
                    )));
                }
            }
        }

        let mut downstream: HashMap<NodeIndex, Vec<NodeIndex>> = HashMap::new();
        let mut upstream: HashMap<NodeIndex, Vec<NodeIndex>> = HashMap::new();
        for edge in self.dag.raw_edges() {
            downstream.entry(edge.source()).or_default().push(edge.target());
            upstream.entry(edge.target()).or_default().push(edge.source());
        }
        for route in routes {
            let (Some(from), Some(to)) = (self.get_node_id(&route.node), self.get_node_id(&route.target.node)) else {
                continue;
            };
            downstream.entry(from.0).or_default().push(to.0);
            upstream.entry(to.0).or_default().push(from.0);
        }
        let fed = reachable(self.sources(), &downstream);
        let drained = reachable(self.sinks(), &upstream);
        for (id, node) in self.creation_order.iter().filter_map(|id| Some((id.0, self.get_node(*id)?))) {
            if embedded.contains(&node.name) {
                continue;
            }
            if !fed.contains(&id) {
                return Err(Error::InvalidPipeline(format!(
                    "node '{}' is not fed by any source",
                    node.name
                )));
            }
            if !drained.contains(&id) {
                return Err(Error::InvalidPipeline(format!(
                    "node '{}' does not reach any sink",
                    node.name
                )));
            }
        }
        Ok(())
    }

    /// Render the graph in GraphViz DOT format.
    pub fn to_dot(&self) -> String {
        let mut dot = String::new();
        let _ = writeln!(dot, "digraph \"{}\" {{", self.name);
        let _ = writeln!(dot, "  rankdir=LR;");
        let _ = writeln!(dot, "  node [shape=box, style=rounded];");
        for node in self.nodes() {
            let _ = writeln!(
                dot,
                "  \"{}\" [label=\"{}\\n{} ({})\"];",
                node.name, node.name, node.kind, node.category
            );
        }
        for (src, sink, link) in self.links() {
            let mut label = format!("{} -> {}", link.src_pad, link.sink_pad);
            if let Some(caps) = &link.caps {
                let _ = write!(label, "\\n{}", caps);
            }
            let style = if link.dynamic { ", style=dashed" } else { "" };
            let _ = writeln!(
                dot,
                "  \"{}\" -> \"{}\" [label=\"{}\"{}];",
                src, sink, label, style
            );
        }
        dot.push_str("}\n");
        dot
    }

    /// Destroy every node in reverse creation order.
    ///
    /// Keeps going after a failure and returns the first error. Calling it
    /// again is a no-op.
    pub fn destroy(&mut self) -> Result<()> {
        if self.destroyed {
            return Ok(());
        }
        self.destroyed = true;
        let mut first_error = None;
        for id in self.creation_order.iter().rev() {
            let Some(node) = self.dag.node_weight(id.0) else {
                continue;
            };
            tracing::debug!("destroying node '{}'", node.name);
            if let Err(e) = self.engine.destroy_node(node.handle) {
                tracing::warn!("failed to destroy node '{}': {}", node.name, e);
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// True once [`Graph::destroy`] ran.
    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }
}

impl Drop for Graph {
    fn drop(&mut self) {
        if !self.destroyed {
            tracing::debug!("graph '{}' dropped without teardown, destroying nodes", self.name);
            if let Err(e) = self.destroy() {
                tracing::warn!("{}", e);
            }
        }
    }
}

/// Every node reachable from `starts` along `edges`, the starts included.
fn reachable(starts: Vec<NodeId>, edges: &HashMap<NodeIndex, Vec<NodeIndex>>) -> HashSet<NodeIndex> {
    let mut seen: HashSet<NodeIndex> = HashSet::new();
    let mut stack: Vec<NodeIndex> = starts.into_iter().map(|id| id.0).collect();
    while let Some(index) = stack.pop() {
        if seen.insert(index) {
            stack.extend(edges.get(&index).into_iter().flatten().copied());
        }
    }
    seen
}

impl std::fmt::Debug for Graph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Graph")
            .field("name", &self.name)
            .field("nodes", &self.node_count())
            .field("edges", &self.edge_count())
            .field("destroyed", &self.destroyed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::engine::sim::SimEngine;

    fn graph_with(kinds: &[(&str, &str)]) -> (Graph, Arc<SimEngine>) {
        let engine = SimEngine::new(Arc::new(ManualClock::new(0)));
        let mut graph = Graph::new("test", engine.clone());
        for (kind, name) in kinds {
            let handle = engine.create_node(kind, name).unwrap();
            let category = engine.catalog().get(kind).unwrap().category;
            graph.add_node(*name, *kind, category, handle);
        }
        (graph, engine)
    }

    fn plain(src_pad: &str, sink_pad: &str) -> Link {
        Link {
            src_pad: src_pad.into(),
            sink_pad: sink_pad.into(),
            caps: None,
            dynamic: false,
        }
    }

    #[test]
    fn test_cycle_detection() {
        let (mut graph, _) = graph_with(&[("queue", "a"), ("queue", "b")]);
        graph.add_link("a", "b", plain("src", "sink")).unwrap();
        let result = graph.add_link("b", "a", plain("src", "sink"));
        assert!(matches!(result, Err(Error::Link { .. })));
        assert_eq!(graph.edge_count(), 1);
    }

    #[test]
    fn test_sources_and_sinks() {
        let (graph, _) = graph_with(&[("videotestsrc", "src"), ("queue", "q"), ("fakesink", "sink")]);
        assert_eq!(graph.sources(), vec![graph.get_node_id("src").unwrap()]);
        assert_eq!(graph.sinks(), vec![graph.get_node_id("sink").unwrap()]);
    }

    /// Link `a.src` to `b.sink` in the engine and record it.
    fn connect(graph: &mut Graph, engine: &SimEngine, a: &str, b: &str) {
        let src = engine.static_pad(graph.handle(a).unwrap(), "src").unwrap();
        let sink = engine.static_pad(graph.handle(b).unwrap(), "sink").unwrap();
        engine.link_pads(&src, &sink, None).unwrap();
        graph.add_link(a, b, plain("src", "sink")).unwrap();
    }

    #[test]
    fn test_validate_reports_unlinked_pads() {
        let (graph, _) = graph_with(&[("videotestsrc", "src"), ("fakesink", "sink")]);
        let err = graph.validate(&HashSet::new(), &[]).unwrap_err();
        assert!(err.to_string().contains("output pad 'src.src'"));

        let (graph, _) = graph_with(&[("fakesink", "sink"), ("videotestsrc", "src")]);
        let err = graph.validate(&HashSet::new(), &[]).unwrap_err();
        assert!(err.to_string().contains("input pad 'sink.sink'"));
    }

    #[test]
    fn test_validate_rejects_dangling_encoder_branch() {
        let (mut graph, engine) = graph_with(&[
            ("audiotestsrc", "a"),
            ("fakesink", "sink"),
            ("videotestsrc", "orphan"),
            ("x264enc", "enc"),
        ]);
        connect(&mut graph, &engine, "a", "sink");
        connect(&mut graph, &engine, "orphan", "enc");

        let err = graph.validate(&HashSet::new(), &[]).unwrap_err();
        assert!(matches!(err, Error::InvalidPipeline(_)));
        assert!(err.to_string().contains("'enc.src'"));
    }

    #[test]
    fn test_validate_rejects_nodes_off_the_source_sink_path() {
        // A tee with no branches has every always pad linked but drains nowhere.
        let (mut graph, engine) = graph_with(&[
            ("audiotestsrc", "a"),
            ("fakesink", "sink"),
            ("audiotestsrc", "b"),
            ("tee", "tee"),
        ]);
        connect(&mut graph, &engine, "a", "sink");
        connect(&mut graph, &engine, "b", "tee");
        let err = graph.validate(&HashSet::new(), &[]).unwrap_err();
        assert!(err.to_string().contains("'tee' does not reach any sink"));

        // A muxer with no requested inputs is never fed.
        let (mut graph, engine) = graph_with(&[
            ("audiotestsrc", "a"),
            ("fakesink", "sink"),
            ("mp4mux", "mux"),
            ("fakesink", "mux_sink"),
        ]);
        connect(&mut graph, &engine, "a", "sink");
        connect(&mut graph, &engine, "mux", "mux_sink");
        let err = graph.validate(&HashSet::new(), &[]).unwrap_err();
        assert!(err.to_string().contains("'mux' is not fed by any source"));
    }

    #[test]
    fn test_validate_counts_routes_and_embedded_nodes() {
        let (mut graph, engine) = graph_with(&[
            ("uridecodebin", "dec"),
            ("queue", "q"),
            ("fakesink", "sink"),
            ("awss3sink", "nested"),
        ]);
        connect(&mut graph, &engine, "q", "sink");
        let embedded = HashSet::from(["nested".to_string()]);

        let err = graph.validate(&embedded, &[]).unwrap_err();
        assert!(err.to_string().contains("'q.sink'"));

        let routes = [SometimesRoute {
            node: "dec".into(),
            class: crate::format::MediaClass::Video,
            target: PadRef::new("q", "sink"),
        }];
        assert!(graph.validate(&embedded, &routes).is_ok());
        assert!(graph.validate(&HashSet::new(), &routes).is_err());
    }

    #[test]
    fn test_validate_empty_graph() {
        let engine = SimEngine::new(Arc::new(ManualClock::new(0)));
        let graph = Graph::new("empty", engine);
        assert!(graph.validate(&HashSet::new(), &[]).is_err());
    }

    #[test]
    fn test_destroy_reverse_order_once() {
        let (mut graph, engine) = graph_with(&[("videotestsrc", "a"), ("queue", "b"), ("fakesink", "c")]);
        graph.destroy().unwrap();
        graph.destroy().unwrap();
        let order: Vec<String> = engine.destroyed_nodes().into_iter().map(|(n, _)| n).collect();
        assert_eq!(order, vec!["c", "b", "a"]);
    }

    #[test]
    fn test_drop_destroys() {
        let (graph, engine) = graph_with(&[("queue", "q")]);
        drop(graph);
        assert_eq!(engine.live_nodes(), 0);
    }

    #[test]
    fn test_drop_keeps_destroying_after_a_failure() {
        let (graph, engine) = graph_with(&[("videotestsrc", "a"), ("queue", "b"), ("fakesink", "c")]);
        engine.destroy_node(graph.handle("b").unwrap()).unwrap();
        drop(graph);
        let order: Vec<String> = engine.destroyed_nodes().into_iter().map(|(n, _)| n).collect();
        assert_eq!(order, vec!["b", "c", "a"]);
        assert_eq!(engine.live_nodes(), 0);
    }

    #[test]
    fn test_dot_output() {
        let (mut graph, _) = graph_with(&[("audiotestsrc", "src"), ("fakesink", "sink")]);
        let mut link = plain("src", "sink");
        link.caps = Some(Caps::audio_raw(48000, 2));
        graph.add_link("src", "sink", link).unwrap();
        let dot = graph.to_dot();
        assert!(dot.starts_with("digraph \"test\""));
        assert!(dot.contains("\"src\" -> \"sink\""));
        assert!(dot.contains("audio/x-raw,rate=48000,channels=2"));
    }
}
