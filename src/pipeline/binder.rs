//! Request-pad binding and sometimes-pad routing.
//!
//! [`PadBinder`] requests the pads a link needs from request templates,
//! links them and keeps a [`RequestedPad`] guard for each one. Guards give
//! their pad back exactly once: on [`PadBinder::release_all`] at teardown,
//! when a later link fails, or as a last resort when dropped.
//!
//! [`SometimesRouter`] installs the pad-added hook that links a decoder's
//! new pads to their destinations by media class.

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

use smallvec::SmallVec;

use crate::engine::{Engine, NewPad, PadHandle};
use crate::error::{Error, Result};
use crate::format::MediaClass;
use crate::pipeline::builder::link_pads;
use crate::pipeline::graph::Graph;
use crate::pipeline::spec::{PadEndpoint, RequestLinkSpec, SometimesRoute};

// ============================================================================
// RequestedPad
// ============================================================================

/// Ownership of one request pad.
pub struct RequestedPad {
    engine: Arc<dyn Engine>,
    pad: Option<PadHandle>,
}

impl RequestedPad {
    fn new(engine: Arc<dyn Engine>, pad: PadHandle) -> Self {
        Self {
            engine,
            pad: Some(pad),
        }
    }

    /// The pad, until released.
    pub fn pad(&self) -> Option<&PadHandle> {
        self.pad.as_ref()
    }

    /// True once the pad was given back.
    pub fn is_released(&self) -> bool {
        self.pad.is_none()
    }

    /// Give the pad back. Later calls do nothing.
    pub fn release(&mut self) -> Result<()> {
        match self.pad.take() {
            Some(pad) => {
                tracing::debug!("releasing request pad {}", pad);
                self.engine.release_pad(&pad)
            }
            None => Ok(()),
        }
    }
}

impl Drop for RequestedPad {
    fn drop(&mut self) {
        if let Some(pad) = &self.pad {
            tracing::warn!("request pad {} dropped without release", pad);
            if let Err(e) = self.release() {
                tracing::warn!("{}", e);
            }
        }
    }
}

impl std::fmt::Debug for RequestedPad {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestedPad").field("pad", &self.pad).finish()
    }
}

// ============================================================================
// PadBinder
// ============================================================================

/// Requests, links and releases request pads.
pub struct PadBinder {
    engine: Arc<dyn Engine>,
    pads: Vec<RequestedPad>,
}

impl PadBinder {
    /// Binder working on `engine`.
    pub fn new(engine: Arc<dyn Engine>) -> Self {
        Self {
            engine,
            pads: Vec::new(),
        }
    }

    /// Establish every request link in order.
    ///
    /// If one fails, every pad this binder requested so far is released in
    /// reverse order before the error is returned.
    pub fn bind(&mut self, graph: &mut Graph, links: &[RequestLinkSpec]) -> Result<()> {
        for link in links {
            if let Err(e) = self.bind_one(graph, link) {
                tracing::debug!("binding failed, rolling back {} request pads", self.held());
                if let Err(release) = self.release_all() {
                    tracing::warn!("rollback: {}", release);
                }
                return Err(e);
            }
        }
        Ok(())
    }

    fn bind_one(&mut self, graph: &mut Graph, link: &RequestLinkSpec) -> Result<()> {
        let src = self.resolve(graph, &link.src)?;
        let sink = self.resolve(graph, &link.sink)?;
        let dynamic = matches!(link.src, PadEndpoint::Request { .. })
            || matches!(link.sink, PadEndpoint::Request { .. });
        link_pads(self.engine.as_ref(), graph, &src, &sink, None, dynamic)
    }

    fn resolve(&mut self, graph: &Graph, endpoint: &PadEndpoint) -> Result<PadHandle> {
        match endpoint {
            PadEndpoint::Static { node, pad } => {
                let handle = graph.handle(node)?;
                self.engine.static_pad(handle, pad).ok_or_else(|| {
                    Error::link(
                        format!("{}.{}", node, pad),
                        "?",
                        format!("node '{}' has no pad '{}'", node, pad),
                    )
                })
            }
            PadEndpoint::Request { node, template } => {
                let handle = graph.handle(node)?;
                self.request(handle, template)
            }
        }
    }

    /// Request one pad and keep its guard.
    pub fn request(&mut self, node: crate::engine::NodeHandle, template: &str) -> Result<PadHandle> {
        let pad = self.engine.request_pad(node, template)?;
        tracing::debug!("requested {} from template '{}'", pad, template);
        self.pads
            .push(RequestedPad::new(Arc::clone(&self.engine), pad.clone()));
        Ok(pad)
    }

    /// Release every held pad in reverse request order.
    ///
    /// Keeps going after a failure and returns the first error.
    pub fn release_all(&mut self) -> Result<()> {
        let mut first_error = None;
        while let Some(mut guard) = self.pads.pop() {
            if let Err(e) = guard.release() {
                tracing::warn!("release failed: {}", e);
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Pads currently held.
    pub fn held(&self) -> usize {
        self.pads.iter().filter(|p| !p.is_released()).count()
    }

    /// Held pads in request order.
    pub fn pads(&self) -> impl Iterator<Item = &PadHandle> {
        self.pads.iter().filter_map(RequestedPad::pad)
    }
}

impl Drop for PadBinder {
    fn drop(&mut self) {
        // Reverse order, same as release_all.
        while let Some(guard) = self.pads.pop() {
            drop(guard);
        }
    }
}

impl std::fmt::Debug for PadBinder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PadBinder")
            .field("held", &self.held())
            .finish()
    }
}

// ============================================================================
// SometimesRouter
// ============================================================================

type Targets = SmallVec<[(MediaClass, PadHandle); 2]>;

/// Links pads a node adds while running to their routed destinations.
pub struct SometimesRouter;

impl SometimesRouter {
    /// Install one pad-added hook per routed node.
    pub fn install(engine: &Arc<dyn Engine>, graph: &Graph, routes: &[SometimesRoute]) -> Result<()> {
        let mut by_node: BTreeMap<&str, Targets> = BTreeMap::new();
        for route in routes {
            let target_node = graph.handle(&route.target.node)?;
            let target = engine.static_pad(target_node, &route.target.pad).ok_or_else(|| {
                Error::link(
                    format!("{}.*", route.node),
                    route.target.to_string(),
                    "route target pad does not exist",
                )
            })?;
            by_node
                .entry(route.node.as_str())
                .or_default()
                .push((route.class, target));
        }

        for (node, targets) in by_node {
            let handle = graph.handle(node)?;
            let weak = Arc::downgrade(engine);
            engine.connect_pad_added(
                handle,
                Arc::new(move |new_pad: &NewPad| route_pad(&weak, &targets, new_pad)),
            )?;
            tracing::debug!("routing pads added by '{}'", node);
        }
        Ok(())
    }
}

fn route_pad(engine: &Weak<dyn Engine>, targets: &Targets, new_pad: &NewPad) {
    let Some(engine) = engine.upgrade() else {
        return;
    };
    tracing::info!("received new pad '{}'", new_pad.pad);

    let class = new_pad
        .caps
        .media_class()
        .filter(|_| new_pad.caps.is_raw());
    let Some(class) = class else {
        tracing::info!(
            "pad {} has type '{}' which is not raw audio or video, ignoring",
            new_pad.pad,
            new_pad.caps
        );
        return;
    };
    let Some((_, target)) = targets.iter().find(|(c, _)| *c == class) else {
        tracing::info!("no route for {} pad {}, ignoring", class, new_pad.pad);
        return;
    };
    if engine.is_linked(target) {
        tracing::info!("{} is already linked, ignoring {}", target, new_pad.pad);
        return;
    }
    match engine.link_pads(&new_pad.pad, target, None) {
        Ok(()) => tracing::info!("link succeeded ({} -> {})", new_pad.pad, target),
        Err(e) => tracing::warn!("type is '{}' but link failed: {}", new_pad.caps, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::engine::sim::SimEngine;
    use crate::pipeline::builder::GraphBuilder;
    use crate::pipeline::spec::{NodeSpec, PipelineSpec};

    fn tee_spec() -> PipelineSpec {
        PipelineSpec::new("tee")
            .with_node(NodeSpec::new("audiotestsrc", "src"))
            .with_node(NodeSpec::new("tee", "tee"))
            .with_node(NodeSpec::new("queue", "q1"))
            .with_node(NodeSpec::new("queue", "q2"))
            .with_node(NodeSpec::new("fakesink", "s1"))
            .with_node(NodeSpec::new("fakesink", "s2"))
            .link_many(&["src", "tee"])
            .link_many(&["q1", "s1"])
            .link_many(&["q2", "s2"])
    }

    #[test]
    fn test_bind_requests_one_pad_per_branch() {
        let engine = SimEngine::new(Arc::new(ManualClock::new(0)));
        let spec = tee_spec()
            .request_link(PadEndpoint::request("tee", "src_%u"), PadEndpoint::fixed("q1", "sink"))
            .request_link(PadEndpoint::request("tee", "src_%u"), PadEndpoint::fixed("q2", "sink"));
        let mut graph = GraphBuilder::new(engine.clone()).build(&spec).unwrap();
        let mut binder = PadBinder::new(engine.clone());
        binder.bind(&mut graph, &spec.request_links).unwrap();

        let names: Vec<&str> = binder.pads().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["src_0", "src_1"]);
        assert!(graph.validate(&Default::default(), &[]).is_ok());

        binder.release_all().unwrap();
        assert_eq!(binder.held(), 0);
        let released: Vec<String> = engine.released_pads().into_iter().map(|p| p.pad).collect();
        assert_eq!(released, vec!["src_1", "src_0"]);
    }

    #[test]
    fn test_failed_link_rolls_back_requested_pads() {
        let engine = SimEngine::new(Arc::new(ManualClock::new(0)));
        let spec = tee_spec()
            .request_link(PadEndpoint::request("tee", "src_%u"), PadEndpoint::fixed("q1", "sink"))
            // q1.sink is already taken.
            .request_link(PadEndpoint::request("tee", "src_%u"), PadEndpoint::fixed("q1", "sink"));
        let mut graph = GraphBuilder::new(engine.clone()).build(&spec).unwrap();
        let mut binder = PadBinder::new(engine.clone());
        let err = binder.bind(&mut graph, &spec.request_links).unwrap_err();

        assert!(matches!(err, Error::Link { .. }));
        assert_eq!(binder.held(), 0);
        assert_eq!(engine.requested_pads().len(), 2);
        assert_eq!(engine.released_pads().len(), 2);
    }

    #[test]
    fn test_guard_releases_once_on_drop() {
        let engine = SimEngine::new(Arc::new(ManualClock::new(0)));
        let tee = engine.create_node("tee", "tee").unwrap();
        {
            let mut binder = PadBinder::new(engine.clone());
            binder.request(tee, "src_%u").unwrap();
            binder.request(tee, "src_%u").unwrap();
        }
        assert_eq!(engine.released_pads().len(), 2);

        let pad = engine.request_pad(tee, "src_%u").unwrap();
        let mut guard = RequestedPad::new(engine.clone(), pad);
        guard.release().unwrap();
        guard.release().unwrap();
        drop(guard);
        assert_eq!(engine.released_pads().len(), 3);
    }

    #[test]
    fn test_guard_drop_survives_failed_release() {
        let engine = SimEngine::new(Arc::new(ManualClock::new(0)));
        let tee = engine.create_node("tee", "tee").unwrap();
        let pad = engine.request_pad(tee, "src_%u").unwrap();
        let guard = RequestedPad::new(engine.clone(), pad);

        // The owning node is gone, so the release inside drop fails.
        engine.destroy_node(tee).unwrap();
        drop(guard);
        assert!(engine.released_pads().is_empty());
        assert_eq!(engine.destroyed_nodes(), vec![("tee".to_string(), 1)]);
    }
}
