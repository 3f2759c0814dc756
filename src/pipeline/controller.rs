//! Run lifecycle: start, poll, graceful stop, teardown.
//!
//! ```text
//! Constructed ──start──▶ Playing ──interrupt / timed stop──▶ Stopping
//!      │                    │                                   │
//!      │ rejected           │ EOS / error                       │ EOS / error / grace expired
//!      ▼                    ▼                                   ▼
//!                    Terminated(Success | Error)
//! ```
//!
//! Teardown runs on every path: request pads are released in reverse order,
//! the engine goes to `Null`, nodes are destroyed in reverse creation order
//! and the bus subscription is dropped last.

use std::fmt;
use std::sync::Arc;

use crate::clock::{Clock, ClockTime};
use crate::engine::{Bus, Engine, EngineState, EosTarget};
use crate::error::{EXIT_RUNTIME, Error, Result};
use crate::interrupt::Interrupt;
use crate::observability;
use crate::pipeline::binder::{PadBinder, SometimesRouter};
use crate::pipeline::builder::GraphBuilder;
use crate::pipeline::events::{Message, MessageReceiver, MessageSender};
use crate::pipeline::graph::Graph;
use crate::pipeline::spec::PipelineSpec;
use crate::segment::SegmentNamingPolicy;

// ============================================================================
// State
// ============================================================================

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// End-of-stream reached every sink.
    Success,
    /// Runtime error, rejected start, or grace period expired.
    Error(String),
}

/// Controller state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunState {
    /// Graph built, not started.
    Constructed,
    /// Data flowing.
    Playing,
    /// End-of-stream injected, waiting for it to drain.
    Stopping,
    /// Finished.
    Terminated(Outcome),
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunState::Constructed => write!(f, "constructed"),
            RunState::Playing => write!(f, "playing"),
            RunState::Stopping => write!(f, "stopping"),
            RunState::Terminated(Outcome::Success) => write!(f, "terminated(success)"),
            RunState::Terminated(Outcome::Error(_)) => write!(f, "terminated(error)"),
        }
    }
}

/// Where end-of-stream goes on a graceful stop.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum EosInjection {
    /// Into every source.
    #[default]
    Pipeline,
    /// Into one node by name, usually the segmenting sink.
    Node(String),
}

/// Controller timing and stop behavior.
#[derive(Debug, Clone, PartialEq)]
pub struct ControllerConfig {
    /// Longest single bus wait.
    pub poll_interval: ClockTime,
    /// Time allowed for end-of-stream to drain before a forced stop.
    pub grace_period: ClockTime,
    /// Where end-of-stream is injected.
    pub eos_target: EosInjection,
    /// Stop gracefully after this much running time.
    pub stop_after: Option<ClockTime>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            poll_interval: ClockTime::from_secs(1),
            grace_period: ClockTime::from_secs(60),
            eos_target: EosInjection::Pipeline,
            stop_after: None,
        }
    }
}

/// Summary of one run.
#[derive(Debug, Clone)]
pub struct RunReport {
    /// Final outcome.
    pub outcome: Outcome,
    /// Every state entered, in order.
    pub transitions: Vec<RunState>,
    /// Engine clock when playback started.
    pub started_at: Option<ClockTime>,
    /// Engine clock when end-of-stream was injected.
    pub eos_injected_at: Option<ClockTime>,
    /// Engine clock on termination.
    pub terminated_at: ClockTime,
    /// Fragment locations in opening order.
    pub segments: Vec<String>,
    /// Problems hit during teardown.
    pub teardown_errors: Vec<String>,
}

impl RunReport {
    /// True on a clean end-of-stream.
    pub fn is_success(&self) -> bool {
        self.outcome == Outcome::Success
    }

    /// Process exit code.
    pub fn exit_code(&self) -> u8 {
        match self.outcome {
            Outcome::Success => 0,
            Outcome::Error(_) => EXIT_RUNTIME,
        }
    }
}

// ============================================================================
// Controller
// ============================================================================

/// Drives one constructed pipeline from start to teardown.
pub struct Controller {
    engine: Arc<dyn Engine>,
    clock: Arc<dyn Clock>,
    // Dropped before the graph so pads go back before their nodes.
    binder: PadBinder,
    graph: Graph,
    config: ControllerConfig,
    interrupt: Interrupt,
    messages: MessageSender,
    state: RunState,
    transitions: Vec<RunState>,
    started_at: Option<ClockTime>,
    eos_injected_at: Option<ClockTime>,
    segments: Vec<String>,
}

impl Controller {
    /// Controller over an already built and bound graph.
    pub fn new(engine: Arc<dyn Engine>, graph: Graph, binder: PadBinder, config: ControllerConfig) -> Self {
        Self {
            clock: engine.clock(),
            engine,
            graph,
            binder,
            config,
            interrupt: Interrupt::new(),
            messages: MessageSender::default(),
            state: RunState::Constructed,
            transitions: vec![RunState::Constructed],
            started_at: None,
            eos_injected_at: None,
            segments: Vec::new(),
        }
    }

    /// Build, bind, install hooks and validate `spec`.
    ///
    /// On failure everything acquired so far is released before the error is
    /// returned.
    pub fn assemble(engine: Arc<dyn Engine>, spec: &PipelineSpec, config: ControllerConfig) -> Result<Self> {
        let _span = observability::span_pipeline(&spec.name).entered();
        let mut graph = GraphBuilder::new(Arc::clone(&engine)).build(spec)?;
        let mut binder = PadBinder::new(Arc::clone(&engine));

        let wired = binder
            .bind(&mut graph, &spec.request_links)
            .and_then(|()| SometimesRouter::install(&engine, &graph, &spec.sometimes_routes))
            .and_then(|()| install_segmenting(&engine, &graph, spec))
            .and_then(|()| graph.validate(&spec.embedded_nodes(), &spec.sometimes_routes));
        if let Err(e) = wired {
            tracing::error!("cannot assemble '{}': {}", spec.name, e);
            if let Err(release) = binder.release_all() {
                tracing::warn!("{}", release);
            }
            if let Err(destroy) = graph.destroy() {
                tracing::warn!("{}", destroy);
            }
            return Err(e);
        }

        tracing::info!(
            "assembled '{}': {} nodes, {} links, {} request pads",
            spec.name,
            graph.node_count(),
            graph.edge_count(),
            binder.held()
        );
        Ok(Self::new(engine, graph, binder, config))
    }

    /// Use `interrupt` instead of the controller's own flag.
    pub fn with_interrupt(mut self, interrupt: Interrupt) -> Self {
        self.interrupt = interrupt;
        self
    }

    /// Handle that stops the run gracefully when raised.
    pub fn interrupt(&self) -> Interrupt {
        self.interrupt.clone()
    }

    /// Follow every bus message of the run.
    pub fn subscribe(&self) -> MessageReceiver {
        self.messages.subscribe()
    }

    /// The constructed graph.
    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    /// Current state.
    pub fn state(&self) -> &RunState {
        &self.state
    }

    /// Run to completion. Teardown always happens.
    pub fn run(mut self) -> RunReport {
        let span = observability::span_pipeline(self.graph.name());
        let _guard = span.enter();

        let bus = match self.engine.bus() {
            Ok(bus) => Some(bus),
            Err(e) => {
                self.terminate(Outcome::Error(e.to_string()));
                None
            }
        };
        if let Some(mut bus) = bus {
            if self.start().is_ok() {
                self.poll(bus.as_mut());
            }
            self.teardown(Some(bus))
        } else {
            self.teardown(None)
        }
    }

    fn start(&mut self) -> Result<()> {
        if let Err(e) = self.engine.set_state(EngineState::Playing) {
            tracing::error!("failed to start '{}': {}", self.graph.name(), e);
            self.terminate(Outcome::Error(e.to_string()));
            return Err(e);
        }
        self.started_at = Some(self.clock.now());
        self.enter(RunState::Playing);
        Ok(())
    }

    fn poll(&mut self, bus: &mut dyn Bus) {
        while !matches!(self.state, RunState::Terminated(_)) {
            if self.state == RunState::Playing {
                if self.interrupt.is_raised() {
                    self.begin_stop("interrupt");
                } else if self.stop_due() {
                    self.begin_stop("timed stop");
                }
                if matches!(self.state, RunState::Terminated(_)) {
                    break;
                }
            }

            let timeout = match self.next_timeout() {
                Some(timeout) => timeout,
                None => {
                    tracing::warn!(
                        "'{}' did not drain within {}, forcing stop",
                        self.graph.name(),
                        self.config.grace_period
                    );
                    self.terminate(Outcome::Error(format!(
                        "graceful shutdown timed out after {}",
                        self.config.grace_period
                    )));
                    break;
                }
            };

            if let Some(message) = bus.timed_pop(timeout) {
                self.handle(message);
            }
        }
    }

    /// Wait for the next poll. `None` once the grace period is over.
    fn next_timeout(&self) -> Option<ClockTime> {
        let now = self.clock.now();
        let deadline = match (&self.state, self.eos_injected_at, self.started_at) {
            (RunState::Stopping, Some(injected), _) => {
                let deadline = injected + self.config.grace_period;
                if now >= deadline {
                    return None;
                }
                Some(deadline)
            }
            (RunState::Playing, _, Some(started)) => self.config.stop_after.map(|after| started + after),
            _ => None,
        };
        Some(match deadline {
            Some(deadline) => self.config.poll_interval.min(deadline.saturating_sub(now)),
            None => self.config.poll_interval,
        })
    }

    fn stop_due(&self) -> bool {
        match (self.config.stop_after, self.started_at) {
            (Some(after), Some(started)) => self.clock.now() >= started + after,
            _ => false,
        }
    }

    fn begin_stop(&mut self, reason: &str) {
        let target = match &self.config.eos_target {
            EosInjection::Pipeline => Ok(EosTarget::Pipeline),
            EosInjection::Node(name) => self.graph.handle(name).map(EosTarget::Node),
        };
        let sent = target.and_then(|target| self.engine.send_eos(target));
        match sent {
            Ok(()) => {
                let now = self.clock.now();
                tracing::info!("{}: sending EOS at {}", reason, now);
                self.eos_injected_at = Some(now);
                self.enter(RunState::Stopping);
            }
            Err(e) => {
                tracing::error!("{}: could not send EOS: {}", reason, e);
                self.terminate(Outcome::Error(e.to_string()));
            }
        }
    }

    fn handle(&mut self, message: Message) {
        match &message {
            Message::Eos => {
                tracing::info!("end of stream reached");
                self.terminate(Outcome::Success);
            }
            Message::Error { message: text, node, debug: details } => {
                let error = Error::RuntimeSignal {
                    message: text.clone(),
                    node: node.clone(),
                };
                tracing::error!("{}", error);
                if let Some(details) = details {
                    tracing::error!("debugging information: {}", details);
                }
                self.terminate(Outcome::Error(error.to_string()));
            }
            Message::Warning { .. } => tracing::warn!("{}", message),
            Message::FragmentOpened { location, .. } => {
                observability::trace_segment(self.graph.name(), location);
                self.segments.push(location.clone());
            }
            Message::StateChanged { from, to } => {
                tracing::debug!("pipeline state changed from {} to {}", from, to);
            }
            _ => tracing::debug!("{}", message),
        }
        self.messages.send(message);
    }

    fn enter(&mut self, state: RunState) {
        observability::trace_state_change(self.graph.name(), &self.state, &state);
        self.transitions.push(state.clone());
        self.state = state;
    }

    fn terminate(&mut self, outcome: Outcome) {
        if !matches!(self.state, RunState::Terminated(_)) {
            self.enter(RunState::Terminated(outcome));
        }
    }

    fn teardown(mut self, bus: Option<Box<dyn Bus>>) -> RunReport {
        let mut errors = Vec::new();
        if let Err(e) = self.binder.release_all() {
            errors.push(e.to_string());
        }
        if let Err(e) = self.engine.set_state(EngineState::Null) {
            tracing::warn!("cannot stop engine: {}", e);
            errors.push(e.to_string());
        }
        if let Err(e) = self.graph.destroy() {
            errors.push(e.to_string());
        }
        drop(bus);
        tracing::debug!("teardown of '{}' complete", self.graph.name());

        let outcome = match &self.state {
            RunState::Terminated(outcome) => outcome.clone(),
            other => Outcome::Error(format!("run ended while {}", other)),
        };
        RunReport {
            outcome,
            transitions: std::mem::take(&mut self.transitions),
            started_at: self.started_at,
            eos_injected_at: self.eos_injected_at,
            terminated_at: self.clock.now(),
            segments: std::mem::take(&mut self.segments),
            teardown_errors: errors,
        }
    }
}

impl fmt::Debug for Controller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Controller")
            .field("graph", &self.graph)
            .field("state", &self.state)
            .field("config", &self.config)
            .finish()
    }
}

/// Apply the segment duration and install the naming policy.
fn install_segmenting(engine: &Arc<dyn Engine>, graph: &Graph, spec: &PipelineSpec) -> Result<()> {
    let Some(segment) = &spec.segment else {
        return Ok(());
    };
    segment.naming.validate()?;
    let sink = graph.handle(&segment.sink_node)?;
    engine.set_property(
        sink,
        "max-size-time",
        segment.naming.max_size_time().nanos().into(),
    )?;
    if let (Some(nested), Some(key)) = (&segment.nested_sink, &segment.key_property) {
        let nested = graph.handle(nested)?;
        SegmentNamingPolicy::new(engine, nested, key.clone(), segment.naming.clone())
            .install(engine.as_ref(), sink)?;
        tracing::debug!("naming policy installed on '{}'", segment.sink_node);
    }
    Ok(())
}
