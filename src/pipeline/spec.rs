//! Declarative pipeline descriptions.
//!
//! A [`PipelineSpec`] lists the nodes to create, the static links between
//! always-present pads, the links that need request pads, the routes for
//! pads a decoder adds while running, and the segmenting sink's naming.
//!
//! ```rust
//! use mediarig::format::Caps;
//! use mediarig::pipeline::{NodeSpec, PadEndpoint, PipelineSpec};
//!
//! let spec = PipelineSpec::new("audio")
//!     .with_node(NodeSpec::new("audiotestsrc", "src"))
//!     .with_node(NodeSpec::new("queue", "queue"))
//!     .with_node(NodeSpec::new("mp4mux", "mux"))
//!     .with_node(NodeSpec::new("fakesink", "sink"))
//!     .link_filtered("src", "queue", Caps::audio_raw(48000, 2))
//!     .link_many(&["mux", "sink"])
//!     .request_link(PadEndpoint::fixed("queue", "src"), PadEndpoint::request("mux", "audio_%u"));
//! assert!(spec.check().is_ok());
//! ```

use std::collections::HashSet;

use crate::element::{PadRef, PropertyValue};
use crate::error::{Error, Result};
use crate::format::{Caps, MediaClass};
use crate::segment::NamingConfig;

/// A node to create.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeSpec {
    /// Kind name in the engine catalog.
    pub kind: String,
    /// Unique node name.
    pub name: String,
    /// Options applied once, in order, before linking.
    pub options: Vec<(String, PropertyValue)>,
}

impl NodeSpec {
    /// A node with no options.
    pub fn new(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            name: name.into(),
            options: Vec::new(),
        }
    }

    /// Add an option.
    pub fn option(mut self, name: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        self.options.push((name.into(), value.into()));
        self
    }
}

/// A link between two always-present pads.
#[derive(Debug, Clone, PartialEq)]
pub struct LinkSpec {
    /// Output pad.
    pub src: PadRef,
    /// Input pad.
    pub sink: PadRef,
    /// Optional format constraint.
    pub caps: Option<Caps>,
}

impl LinkSpec {
    /// `src.src -> sink.sink`.
    pub fn new(src: impl Into<String>, sink: impl Into<String>) -> Self {
        Self {
            src: PadRef::new(src, "src"),
            sink: PadRef::new(sink, "sink"),
            caps: None,
        }
    }

    /// Constrain the link to `caps`.
    pub fn filtered(mut self, caps: Caps) -> Self {
        self.caps = Some(caps);
        self
    }
}

/// One side of a link that may need a request pad.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PadEndpoint {
    /// An existing pad (always or sometimes present).
    Static {
        /// Node name.
        node: String,
        /// Pad name.
        pad: String,
    },
    /// A pad instantiated on demand from a request template.
    Request {
        /// Node name.
        node: String,
        /// Template name (e.g. `src_%u`, `video`).
        template: String,
    },
}

impl PadEndpoint {
    /// An existing pad.
    pub fn fixed(node: impl Into<String>, pad: impl Into<String>) -> Self {
        Self::Static {
            node: node.into(),
            pad: pad.into(),
        }
    }

    /// A request pad from `template`.
    pub fn request(node: impl Into<String>, template: impl Into<String>) -> Self {
        Self::Request {
            node: node.into(),
            template: template.into(),
        }
    }

    /// The node this endpoint is on.
    pub fn node(&self) -> &str {
        match self {
            Self::Static { node, .. } | Self::Request { node, .. } => node,
        }
    }
}

/// A link where at least one side is usually a request pad.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestLinkSpec {
    /// Output side.
    pub src: PadEndpoint,
    /// Input side.
    pub sink: PadEndpoint,
}

/// Where a decoder's dynamically added pads of one media class go.
#[derive(Debug, Clone, PartialEq)]
pub struct SometimesRoute {
    /// Node that adds pads while running.
    pub node: String,
    /// Media class this route takes.
    pub class: MediaClass,
    /// Always-present input pad to link to.
    pub target: PadRef,
}

/// The segmenting sink and how its fragments are named.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentSpec {
    /// The segmenting sink node.
    pub sink_node: String,
    /// Sink living inside the segmenting sink, if any.
    pub nested_sink: Option<String>,
    /// Option on the nested sink that receives each fragment's identifier.
    /// Without one the segmenting sink's own `location` pattern names
    /// fragments.
    pub key_property: Option<String>,
    /// Naming and duration.
    pub naming: NamingConfig,
}

/// Everything needed to construct one pipeline instance.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PipelineSpec {
    /// Pipeline name, used in logs and DOT output.
    pub name: String,
    /// Nodes in creation order.
    pub nodes: Vec<NodeSpec>,
    /// Static links in link order.
    pub links: Vec<LinkSpec>,
    /// Request-pad links in link order.
    pub request_links: Vec<RequestLinkSpec>,
    /// Routes for pads added while running.
    pub sometimes_routes: Vec<SometimesRoute>,
    /// Segmenting sink configuration.
    pub segment: Option<SegmentSpec>,
}

impl PipelineSpec {
    /// An empty description.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Add a node.
    pub fn with_node(mut self, node: NodeSpec) -> Self {
        self.nodes.push(node);
        self
    }

    /// Add a static link.
    pub fn with_link(mut self, link: LinkSpec) -> Self {
        self.links.push(link);
        self
    }

    /// Chain `names[0] -> names[1] -> ...` through their `src`/`sink` pads.
    pub fn link_many(mut self, names: &[&str]) -> Self {
        for pair in names.windows(2) {
            self.links.push(LinkSpec::new(pair[0], pair[1]));
        }
        self
    }

    /// Link `src -> sink` constrained by `caps`.
    pub fn link_filtered(mut self, src: &str, sink: &str, caps: Caps) -> Self {
        self.links.push(LinkSpec::new(src, sink).filtered(caps));
        self
    }

    /// Add a request-pad link.
    pub fn request_link(mut self, src: PadEndpoint, sink: PadEndpoint) -> Self {
        self.request_links.push(RequestLinkSpec { src, sink });
        self
    }

    /// Route pads of `class` added by `node` to `target`.
    pub fn route(mut self, node: &str, class: MediaClass, target: PadRef) -> Self {
        self.sometimes_routes.push(SometimesRoute {
            node: node.to_string(),
            class,
            target,
        });
        self
    }

    /// Set the segmenting sink.
    pub fn with_segment(mut self, segment: SegmentSpec) -> Self {
        self.segment = Some(segment);
        self
    }

    /// Look up a node by name.
    pub fn node(&self, name: &str) -> Option<&NodeSpec> {
        self.nodes.iter().find(|n| n.name == name)
    }

    /// Nodes that live inside another node and are never linked directly.
    pub fn embedded_nodes(&self) -> HashSet<String> {
        self.segment
            .iter()
            .filter_map(|s| s.nested_sink.clone())
            .collect()
    }

    /// Check names are unique and every reference resolves.
    pub fn check(&self) -> Result<()> {
        let mut names = HashSet::new();
        for node in &self.nodes {
            if !names.insert(node.name.as_str()) {
                return Err(Error::InvalidPipeline(format!(
                    "duplicate node name '{}'",
                    node.name
                )));
            }
        }

        let known = |name: &str, what: &str| -> Result<()> {
            if names.contains(name) {
                Ok(())
            } else {
                Err(Error::InvalidPipeline(format!(
                    "{} refers to unknown node '{}'",
                    what, name
                )))
            }
        };

        for link in &self.links {
            known(&link.src.node, "link")?;
            known(&link.sink.node, "link")?;
        }
        for link in &self.request_links {
            known(link.src.node(), "request link")?;
            known(link.sink.node(), "request link")?;
        }
        for route in &self.sometimes_routes {
            known(&route.node, "route")?;
            known(&route.target.node, "route")?;
        }
        if let Some(segment) = &self.segment {
            known(&segment.sink_node, "segment")?;
            if let Some(nested) = &segment.nested_sink {
                known(nested, "segment")?;
            }
        }
        Ok(())
    }
}
