//! Deterministic discrete-event engine.
//!
//! `SimEngine` implements [`Engine`] without moving any media. It models what
//! the orchestrator can observe from a real streaming engine:
//!
//! - node creation from a [`KindCatalog`], options, always/request/sometimes pads
//! - caps-checked linking
//! - segment rollovers on segmenting sinks every `max-size-time` nanoseconds,
//!   calling the format-location hook right before each fragment opens
//! - end-of-stream propagation to sinks after a configurable drain latency
//! - scheduled runtime errors and arbitrary timed actions
//!
//! Time comes from the shared [`Clock`]. With a [`ManualClock`] a run that
//! would take minutes completes instantly: `timed_pop` jumps the clock to the
//! next due event.
//!
//! Every operation is recorded in a journal so tests can check request/release
//! balance, destroy order and property writes.
//!
//! ```rust
//! use std::sync::Arc;
//! use mediarig::clock::ManualClock;
//! use mediarig::engine::{Engine, sim::SimEngine};
//!
//! let engine = SimEngine::new(Arc::new(ManualClock::new(0)));
//! let tee = engine.create_node("tee", "t").unwrap();
//! let a = engine.request_pad(tee, "src_%u").unwrap();
//! let b = engine.request_pad(tee, "src_%u").unwrap();
//! assert_ne!(a.name, b.name);
//! ```
//!
//! [`ManualClock`]: crate::clock::ManualClock

use std::cmp::{Ordering, Reverse};
use std::collections::{BTreeMap, BinaryHeap, HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use crate::clock::{Clock, ClockTime};
use crate::element::{
    KindInfo, NodeCategory, PadDirection, PadPresence, PadRef, PropertyValue,
};
use crate::engine::{
    Bus, Engine, EngineState, EosTarget, FormatLocationFn, FragmentContext, KindCatalog,
    NewPad, NodeHandle, PadAddedFn, PadHandle,
};
use crate::error::{Error, Result};
use crate::format::{AudioFormatCaps, Caps, Framerate, PixelFormat, SampleFormat};
use crate::pipeline::Message;

// ============================================================================
// Configuration
// ============================================================================

/// Behavior knobs for a simulated run.
#[derive(Debug, Clone)]
pub struct SimConfig {
    /// Running time at which sources run dry and post EOS by themselves.
    pub source_eos_at: Option<ClockTime>,
    /// Time from EOS injection until every affected sink has flushed.
    /// `None` means EOS never drains.
    pub drain_latency: Option<ClockTime>,
    /// Reject transitions into this state.
    pub reject_state: Option<EngineState>,
    /// Streams a decoder exposes as sometimes pads once playing.
    pub decoder_streams: Vec<Caps>,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            source_eos_at: None,
            drain_latency: Some(ClockTime::from_millis(500)),
            reject_state: None,
            decoder_streams: vec![
                Caps::video_raw(PixelFormat::I420, 1280, 720, Framerate::FPS_30),
                Caps::AudioRaw(
                    AudioFormatCaps::any()
                        .with_format(SampleFormat::F32Le)
                        .with_rate(48000)
                        .with_channels(2),
                ),
            ],
        }
    }
}

// ============================================================================
// Journal
// ============================================================================

/// One recorded engine operation.
#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    /// A node was created.
    NodeCreated {
        /// Node name.
        node: String,
        /// Kind name.
        kind: String,
    },
    /// An option was set.
    PropertySet {
        /// Node name.
        node: String,
        /// Option name.
        name: String,
        /// New value.
        value: PropertyValue,
    },
    /// Two pads were linked.
    Linked {
        /// Output pad.
        src: PadRef,
        /// Input pad.
        sink: PadRef,
    },
    /// A request pad was handed out.
    PadRequested {
        /// The new pad.
        pad: PadRef,
    },
    /// A request pad was given back.
    PadReleased {
        /// The released pad.
        pad: PadRef,
    },
    /// The engine changed state.
    StateChanged {
        /// Previous state.
        from: EngineState,
        /// New state.
        to: EngineState,
    },
    /// End-of-stream was injected.
    EosSent {
        /// Node name, or `pipeline`.
        target: String,
    },
    /// A fragment was opened.
    FragmentOpened {
        /// Segmenting sink name.
        node: String,
        /// Fragment destination.
        location: String,
        /// Engine clock at opening.
        at: ClockTime,
    },
    /// A node was destroyed.
    NodeDestroyed {
        /// Node name.
        node: String,
        /// Request pads still held at destruction.
        outstanding_request_pads: usize,
    },
    /// A bus subscription was dropped.
    BusReleased,
}

// ============================================================================
// Internal state
// ============================================================================

struct SimPad {
    name: String,
    /// Distinguishes successive pads that reuse a name. Zero for always pads.
    serial: u64,
    direction: PadDirection,
    presence: PadPresence,
    caps: Caps,
    peer: Option<(u64, String)>,
}

struct SimNode {
    name: String,
    info: KindInfo,
    properties: BTreeMap<String, PropertyValue>,
    pads: Vec<SimPad>,
    request_index: HashMap<String, u32>,
    released: HashSet<u64>,
    next_serial: u64,
    format_location: Option<FormatLocationFn>,
    pad_added: Option<PadAddedFn>,
    eos: bool,
    open_fragment: Option<String>,
    next_fragment: u32,
}

impl SimNode {
    fn pad(&self, name: &str) -> Option<&SimPad> {
        self.pads.iter().find(|p| p.name == name)
    }

    /// The live pad a handle refers to. A handle to a released pad matches
    /// nothing, even if a pad with the same name was requested since.
    fn pad_for(&self, handle: &PadHandle) -> Option<&SimPad> {
        self.pads
            .iter()
            .find(|p| p.name == handle.name && p.serial == handle.serial)
    }

    fn pad_for_mut(&mut self, handle: &PadHandle) -> Option<&mut SimPad> {
        self.pads
            .iter_mut()
            .find(|p| p.name == handle.name && p.serial == handle.serial)
    }

    fn issue_serial(&mut self) -> u64 {
        self.next_serial += 1;
        self.next_serial
    }

    fn pad_mut(&mut self, name: &str) -> Option<&mut SimPad> {
        self.pads.iter_mut().find(|p| p.name == name)
    }

    fn request_pads(&self) -> usize {
        self.pads
            .iter()
            .filter(|p| p.presence == PadPresence::Request)
            .count()
    }
}

enum SimEvent {
    Rollover { node: u64 },
    SourcesDry,
    Drain { target: EosTarget },
    Error { node: String, message: String },
    ExposePads { node: u64 },
    CheckLinks,
    Action(Box<dyn FnOnce() + Send>),
}

struct Scheduled {
    at: ClockTime,
    seq: u64,
    event: SimEvent,
}

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.seq == other.seq
    }
}

impl Eq for Scheduled {}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scheduled {
    fn cmp(&self, other: &Self) -> Ordering {
        self.at.cmp(&other.at).then(self.seq.cmp(&other.seq))
    }
}

struct SimState {
    nodes: BTreeMap<u64, SimNode>,
    names: HashMap<String, u64>,
    next_id: u64,
    state: EngineState,
    playing_since: Option<ClockTime>,
    queue: BinaryHeap<Reverse<Scheduled>>,
    next_seq: u64,
    pending: VecDeque<Message>,
    eos_posted: bool,
    open_buses: usize,
    journal: Vec<Op>,
}

impl SimState {
    fn schedule(&mut self, at: ClockTime, event: SimEvent) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.queue.push(Reverse(Scheduled { at, seq, event }));
    }

    fn node(&self, handle: NodeHandle) -> Option<&SimNode> {
        self.nodes.get(&handle.0)
    }

    fn node_mut(&mut self, handle: NodeHandle) -> Option<&mut SimNode> {
        self.nodes.get_mut(&handle.0)
    }

    /// Nodes living inside another node (a segmenting sink's `sink` option).
    fn embedded(&self) -> HashSet<u64> {
        self.nodes
            .values()
            .filter_map(|n| n.properties.get("sink").and_then(|v| v.as_str()))
            .filter_map(|name| self.names.get(name).copied())
            .collect()
    }

    fn top_level_sinks(&self) -> Vec<u64> {
        let embedded = self.embedded();
        self.nodes
            .iter()
            .filter(|(id, n)| n.info.category == NodeCategory::Sink && !embedded.contains(*id))
            .map(|(id, _)| *id)
            .collect()
    }

    /// Sinks reachable by following output pads from `start`.
    fn downstream_sinks(&self, start: u64) -> Vec<u64> {
        let mut seen = HashSet::new();
        let mut stack = vec![start];
        let mut sinks = Vec::new();
        while let Some(id) = stack.pop() {
            if !seen.insert(id) {
                continue;
            }
            let Some(node) = self.nodes.get(&id) else {
                continue;
            };
            if node.info.category == NodeCategory::Sink {
                sinks.push(id);
            }
            stack.extend(
                node.pads
                    .iter()
                    .filter(|p| p.direction == PadDirection::Output)
                    .filter_map(|p| p.peer.as_ref().map(|(peer, _)| *peer)),
            );
        }
        sinks
    }

    fn first_unlinked_input(&self) -> Option<String> {
        let embedded = self.embedded();
        self.nodes
            .iter()
            .filter(|(id, _)| !embedded.contains(*id))
            .flat_map(|(_, n)| {
                n.pads
                    .iter()
                    .filter(|p| {
                        p.direction == PadDirection::Input
                            && p.presence == PadPresence::Always
                            && p.peer.is_none()
                    })
                    .map(move |p| format!("{}.{}", n.name, p.name))
            })
            .next()
    }

    fn running_time(&self, now: ClockTime) -> ClockTime {
        self.playing_since
            .map(|since| now - since)
            .unwrap_or(ClockTime::ZERO)
    }
}

// ============================================================================
// SimEngine
// ============================================================================

/// A deterministic, journaled [`Engine`].
pub struct SimEngine {
    catalog: KindCatalog,
    clock: Arc<dyn Clock>,
    config: SimConfig,
    state: Mutex<SimState>,
    self_ref: Weak<SimEngine>,
}

impl SimEngine {
    /// Engine with the standard catalog and default behavior.
    pub fn new(clock: Arc<dyn Clock>) -> Arc<Self> {
        Self::with_config(clock, SimConfig::default())
    }

    /// Engine with the standard catalog and custom behavior.
    pub fn with_config(clock: Arc<dyn Clock>, config: SimConfig) -> Arc<Self> {
        Self::with_catalog(clock, config, KindCatalog::standard())
    }

    /// Engine with a custom catalog.
    pub fn with_catalog(clock: Arc<dyn Clock>, config: SimConfig, catalog: KindCatalog) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            catalog,
            clock,
            config,
            state: Mutex::new(SimState {
                nodes: BTreeMap::new(),
                names: HashMap::new(),
                next_id: 1,
                state: EngineState::Null,
                playing_since: None,
                queue: BinaryHeap::new(),
                next_seq: 0,
                pending: VecDeque::new(),
                eos_posted: false,
                open_buses: 0,
                journal: Vec::new(),
            }),
            self_ref: self_ref.clone(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Post a runtime error from `node` at engine clock `at`.
    pub fn schedule_error(&self, at: ClockTime, node: &str, message: &str) {
        self.lock().schedule(
            at,
            SimEvent::Error {
                node: node.to_string(),
                message: message.to_string(),
            },
        );
    }

    /// Run `action` when the engine clock reaches `at`.
    ///
    /// A pending `timed_pop` returns early after the action runs, so callers
    /// polling the bus get a chance to react to whatever the action changed.
    pub fn schedule_action(&self, at: ClockTime, action: impl FnOnce() + Send + 'static) {
        self.lock().schedule(at, SimEvent::Action(Box::new(action)));
    }

    // ========================================================================
    // Journal queries
    // ========================================================================

    /// Everything recorded so far.
    pub fn journal(&self) -> Vec<Op> {
        self.lock().journal.clone()
    }

    /// Pads handed out by `request_pad`.
    pub fn requested_pads(&self) -> Vec<PadRef> {
        self.lock()
            .journal
            .iter()
            .filter_map(|op| match op {
                Op::PadRequested { pad } => Some(pad.clone()),
                _ => None,
            })
            .collect()
    }

    /// Pads given back by `release_pad`.
    pub fn released_pads(&self) -> Vec<PadRef> {
        self.lock()
            .journal
            .iter()
            .filter_map(|op| match op {
                Op::PadReleased { pad } => Some(pad.clone()),
                _ => None,
            })
            .collect()
    }

    /// Destroyed nodes in destruction order, with request pads they still held.
    pub fn destroyed_nodes(&self) -> Vec<(String, usize)> {
        self.lock()
            .journal
            .iter()
            .filter_map(|op| match op {
                Op::NodeDestroyed {
                    node,
                    outstanding_request_pads,
                } => Some((node.clone(), *outstanding_request_pads)),
                _ => None,
            })
            .collect()
    }

    /// Created nodes in creation order.
    pub fn created_nodes(&self) -> Vec<String> {
        self.lock()
            .journal
            .iter()
            .filter_map(|op| match op {
                Op::NodeCreated { node, .. } => Some(node.clone()),
                _ => None,
            })
            .collect()
    }

    /// Opened fragment locations with the clock reading at opening.
    pub fn fragments(&self) -> Vec<(String, ClockTime)> {
        self.lock()
            .journal
            .iter()
            .filter_map(|op| match op {
                Op::FragmentOpened { location, at, .. } => Some((location.clone(), *at)),
                _ => None,
            })
            .collect()
    }

    /// Every value written to `node.name`, in order.
    pub fn property_writes(&self, node: &str, name: &str) -> Vec<PropertyValue> {
        self.lock()
            .journal
            .iter()
            .filter_map(|op| match op {
                Op::PropertySet {
                    node: n,
                    name: p,
                    value,
                } if n == node && p == name => Some(value.clone()),
                _ => None,
            })
            .collect()
    }

    /// State transitions in order.
    pub fn state_changes(&self) -> Vec<(EngineState, EngineState)> {
        self.lock()
            .journal
            .iter()
            .filter_map(|op| match op {
                Op::StateChanged { from, to } => Some((*from, *to)),
                _ => None,
            })
            .collect()
    }

    /// Number of EOS injections.
    pub fn eos_injections(&self) -> usize {
        self.lock()
            .journal
            .iter()
            .filter(|op| matches!(op, Op::EosSent { .. }))
            .count()
    }

    /// Current links as `(src, sink)`.
    pub fn links(&self) -> Vec<(PadRef, PadRef)> {
        let state = self.lock();
        state
            .nodes
            .values()
            .flat_map(|n| {
                n.pads
                    .iter()
                    .filter(|p| p.direction == PadDirection::Output)
                    .filter_map(|p| {
                        let (peer, peer_pad) = p.peer.as_ref()?;
                        let peer_name = &state.nodes.get(peer)?.name;
                        Some((
                            PadRef::new(n.name.clone(), p.name.clone()),
                            PadRef::new(peer_name.clone(), peer_pad.clone()),
                        ))
                    })
            })
            .collect()
    }

    /// Live node count.
    pub fn live_nodes(&self) -> usize {
        self.lock().nodes.len()
    }

    /// Bus subscriptions not yet dropped.
    pub fn open_buses(&self) -> usize {
        self.lock().open_buses
    }

    // ========================================================================
    // Event loop
    // ========================================================================

    fn pop_message(&self, timeout: ClockTime) -> Option<Message> {
        let deadline = self.clock.now().saturating_add(timeout);
        loop {
            let next = {
                let mut state = self.lock();
                if let Some(message) = state.pending.pop_front() {
                    return Some(message);
                }
                let due = state
                    .queue
                    .peek()
                    .is_some_and(|Reverse(s)| s.at <= deadline);
                if due {
                    state.queue.pop().map(|Reverse(s)| s)
                } else {
                    None
                }
            };

            let Some(scheduled) = next else {
                self.clock.sleep_until(deadline);
                return None;
            };

            self.clock.sleep_until(scheduled.at);
            let wake = matches!(scheduled.event, SimEvent::Action(_));
            self.dispatch(scheduled.at, scheduled.event);
            if wake {
                return self.lock().pending.pop_front();
            }
        }
    }

    fn dispatch(&self, at: ClockTime, event: SimEvent) {
        match event {
            SimEvent::Rollover { node } => self.rollover(at, node),
            SimEvent::SourcesDry => {
                tracing::debug!("sources ran dry at {}", at);
                if let Some(latency) = self.config.drain_latency {
                    self.lock().schedule(
                        at + latency,
                        SimEvent::Drain {
                            target: EosTarget::Pipeline,
                        },
                    );
                }
            }
            SimEvent::Drain { target } => self.drain(at, target),
            SimEvent::Error { node, message } => {
                let mut state = self.lock();
                if state.state == EngineState::Playing {
                    tracing::debug!("posting simulated error from '{}'", node);
                    state.pending.push_back(Message::Error {
                        message,
                        node: Some(node),
                        debug: Some(format!("simulated failure at {}", at)),
                    });
                }
            }
            SimEvent::ExposePads { node } => self.expose_pads(node),
            SimEvent::CheckLinks => {
                let mut state = self.lock();
                if state.state != EngineState::Playing {
                    return;
                }
                if let Some(pad) = state.first_unlinked_input() {
                    let node = pad.split('.').next().map(str::to_string);
                    state.pending.push_back(Message::Error {
                        message: "Internal data stream error".to_string(),
                        node,
                        debug: Some(format!("streaming stopped, reason not-linked ({})", pad)),
                    });
                }
            }
            SimEvent::Action(action) => action(),
        }
    }

    fn rollover(&self, at: ClockTime, node: u64) {
        let (context, hook, pattern) = {
            let mut state = self.lock();
            if state.state != EngineState::Playing {
                return;
            }
            let running_time = state.running_time(at);
            let Some(n) = state.nodes.get_mut(&node) else {
                return;
            };
            if n.eos {
                return;
            }
            let fragment_id = n.next_fragment;
            n.next_fragment += 1;
            let closed = n.open_fragment.take().map(|location| Message::FragmentClosed {
                node: n.name.clone(),
                location,
                running_time,
            });
            let context = FragmentContext {
                node: n.name.clone(),
                fragment_id,
                running_time,
            };
            let hook = n.format_location.clone();
            let pattern = n.properties.get("location").map(|v| v.as_string());
            if let Some(closed) = closed {
                state.pending.push_back(closed);
            }
            (context, hook, pattern)
        };

        // Hooks may call back into the engine.
        let location = match hook {
            Some(hook) => hook(&context),
            None => match pattern {
                Some(pattern) => format_fragment_pattern(&pattern, context.fragment_id),
                None => format!("{}-{:05}", context.node, context.fragment_id),
            },
        };

        let mut state = self.lock();
        let interval = {
            let Some(n) = state.nodes.get_mut(&node) else {
                return;
            };
            n.open_fragment = Some(location.clone());
            n.properties
                .get("max-size-time")
                .and_then(|v| v.as_u64())
                .unwrap_or(0)
        };
        tracing::debug!(
            "{} opened fragment {} '{}'",
            context.node,
            context.fragment_id,
            location
        );
        state.journal.push(Op::FragmentOpened {
            node: context.node.clone(),
            location: location.clone(),
            at,
        });
        state.pending.push_back(Message::FragmentOpened {
            node: context.node,
            location,
            running_time: context.running_time,
        });
        if interval > 0 {
            state.schedule(at + ClockTime::from_nanos(interval), SimEvent::Rollover { node });
        }
    }

    fn drain(&self, at: ClockTime, target: EosTarget) {
        let mut state = self.lock();
        if state.state != EngineState::Playing {
            return;
        }
        let affected = match target {
            EosTarget::Pipeline => state.top_level_sinks(),
            EosTarget::Node(handle) => state.downstream_sinks(handle.0),
        };
        let running_time = state.running_time(at);
        for id in affected {
            let closed = match state.nodes.get_mut(&id) {
                Some(n) if !n.eos => {
                    n.eos = true;
                    n.open_fragment.take().map(|location| Message::FragmentClosed {
                        node: n.name.clone(),
                        location,
                        running_time,
                    })
                }
                _ => None,
            };
            if let Some(closed) = closed {
                state.pending.push_back(closed);
            }
        }

        let sinks = state.top_level_sinks();
        let all_done = sinks
            .iter()
            .all(|id| state.nodes.get(id).is_some_and(|n| n.eos));
        if all_done && !sinks.is_empty() && !state.eos_posted {
            state.eos_posted = true;
            tracing::debug!("all sinks reached EOS at {}", at);
            state.pending.push_back(Message::Eos);
        }
    }

    fn expose_pads(&self, node: u64) {
        let (hook, new_pads) = {
            let mut state = self.lock();
            if state.state != EngineState::Playing {
                return;
            }
            let Some(n) = state.nodes.get_mut(&node) else {
                return;
            };
            let Some(template) = n
                .info
                .templates
                .iter()
                .find(|t| t.presence == PadPresence::Sometimes)
                .cloned()
            else {
                return;
            };
            let mut added = Vec::new();
            for (index, caps) in self.config.decoder_streams.iter().enumerate() {
                let name = template.instantiate(index as u32);
                let serial = n.issue_serial();
                n.pads.push(SimPad {
                    name: name.clone(),
                    serial,
                    direction: template.direction,
                    presence: PadPresence::Sometimes,
                    caps: caps.clone(),
                    peer: None,
                });
                added.push((name, serial, caps.clone()));
            }
            let node_name = n.name.clone();
            let hook = n.pad_added.clone();
            let mut new_pads = Vec::new();
            for (name, serial, caps) in added {
                state.pending.push_back(Message::PadAdded {
                    node: node_name.clone(),
                    pad: name.clone(),
                });
                new_pads.push(NewPad {
                    pad: PadHandle {
                        node: NodeHandle(node),
                        node_name: node_name.clone(),
                        name,
                        serial,
                    },
                    caps,
                });
            }
            (hook, new_pads)
        };

        if let Some(hook) = hook {
            for pad in &new_pads {
                hook(pad);
            }
        }
    }
}

impl fmt::Debug for SimEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("SimEngine")
            .field("clock", &self.clock.name())
            .field("state", &state.state)
            .field("nodes", &state.nodes.len())
            .field("scheduled", &state.queue.len())
            .finish()
    }
}

impl Engine for SimEngine {
    fn catalog(&self) -> &KindCatalog {
        &self.catalog
    }

    fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.clock)
    }

    fn create_node(&self, kind: &str, name: &str) -> Result<NodeHandle> {
        let info = self.catalog.get(kind).cloned().ok_or_else(|| Error::NodeCreation {
            kind: kind.to_string(),
            name: name.to_string(),
            reason: "no such kind".to_string(),
        })?;

        let mut state = self.lock();
        if state.names.contains_key(name) {
            return Err(Error::NodeCreation {
                kind: kind.to_string(),
                name: name.to_string(),
                reason: "name already in use".to_string(),
            });
        }

        let id = state.next_id;
        state.next_id += 1;
        let pads = info
            .always_pads()
            .map(|t| SimPad {
                name: t.name.clone(),
                serial: 0,
                direction: t.direction,
                presence: PadPresence::Always,
                caps: t.caps.clone(),
                peer: None,
            })
            .collect();
        state.nodes.insert(
            id,
            SimNode {
                name: name.to_string(),
                info,
                properties: BTreeMap::new(),
                pads,
                request_index: HashMap::new(),
                released: HashSet::new(),
                next_serial: 0,
                format_location: None,
                pad_added: None,
                eos: false,
                open_fragment: None,
                next_fragment: 0,
            },
        );
        state.names.insert(name.to_string(), id);
        state.journal.push(Op::NodeCreated {
            node: name.to_string(),
            kind: kind.to_string(),
        });
        Ok(NodeHandle(id))
    }

    fn node_name(&self, node: NodeHandle) -> Option<String> {
        self.lock().node(node).map(|n| n.name.clone())
    }

    fn set_property(&self, node: NodeHandle, name: &str, value: PropertyValue) -> Result<()> {
        let mut state = self.lock();
        let property_error = |node: &str, reason: &str| Error::Property {
            node: node.to_string(),
            property: name.to_string(),
            reason: reason.to_string(),
        };

        let Some(n) = state.node(node) else {
            return Err(property_error(&format!("#{}", node.0), "no such node"));
        };
        let node_name = n.name.clone();
        if n.info.segmenting {
            match name {
                "max-size-time" if value.as_u64().is_none() => {
                    return Err(property_error(&node_name, "expected nanoseconds"));
                }
                "sink" => {
                    let target = value.as_str().unwrap_or_default();
                    if !state.names.contains_key(target) {
                        return Err(property_error(&node_name, "no such node to embed"));
                    }
                }
                _ => {}
            }
        }

        if let Some(n) = state.node_mut(node) {
            n.properties.insert(name.to_string(), value.clone());
        }
        state.journal.push(Op::PropertySet {
            node: node_name,
            name: name.to_string(),
            value,
        });
        Ok(())
    }

    fn property(&self, node: NodeHandle, name: &str) -> Option<PropertyValue> {
        self.lock()
            .node(node)
            .and_then(|n| n.properties.get(name).cloned())
    }

    fn static_pad(&self, node: NodeHandle, name: &str) -> Option<PadHandle> {
        let state = self.lock();
        let n = state.node(node)?;
        n.pad(name)
            .filter(|p| p.presence != PadPresence::Request)
            .map(|p| PadHandle {
                node,
                node_name: n.name.clone(),
                name: p.name.clone(),
                serial: p.serial,
            })
    }

    fn pad_caps(&self, pad: &PadHandle) -> Option<Caps> {
        self.lock()
            .node(pad.node)
            .and_then(|n| n.pad_for(pad))
            .map(|p| p.caps.clone())
    }

    fn link_pads(&self, src: &PadHandle, sink: &PadHandle, filter: Option<&Caps>) -> Result<()> {
        let mut state = self.lock();
        let fail = |reason: String| Error::link(src.to_string(), sink.to_string(), reason);

        let src_pad = state
            .node(src.node)
            .and_then(|n| n.pad_for(src))
            .ok_or_else(|| fail("no such source pad".into()))?;
        let sink_pad = state
            .node(sink.node)
            .and_then(|n| n.pad_for(sink))
            .ok_or_else(|| fail("no such sink pad".into()))?;

        if src_pad.direction != PadDirection::Output || sink_pad.direction != PadDirection::Input {
            return Err(fail("wrong pad direction".into()));
        }
        if src_pad.peer.is_some() {
            return Err(fail(format!("{} is already linked", src)));
        }
        if sink_pad.peer.is_some() {
            return Err(fail(format!("{} is already linked", sink)));
        }
        if src_pad
            .caps
            .intersect_filtered(filter, &sink_pad.caps)
            .is_none()
        {
            return Err(fail(format!(
                "no common format between {} and {}",
                src_pad.caps, sink_pad.caps
            )));
        }

        if let Some(p) = state.node_mut(src.node).and_then(|n| n.pad_for_mut(src)) {
            p.peer = Some((sink.node.0, sink.name.clone()));
        }
        if let Some(p) = state.node_mut(sink.node).and_then(|n| n.pad_for_mut(sink)) {
            p.peer = Some((src.node.0, src.name.clone()));
        }
        state.journal.push(Op::Linked {
            src: src.to_ref(),
            sink: sink.to_ref(),
        });
        Ok(())
    }

    fn is_linked(&self, pad: &PadHandle) -> bool {
        self.lock()
            .node(pad.node)
            .and_then(|n| n.pad_for(pad))
            .is_some_and(|p| p.peer.is_some())
    }

    fn request_pad(&self, node: NodeHandle, template: &str) -> Result<PadHandle> {
        let mut state = self.lock();
        let Some(n) = state.node_mut(node) else {
            return Err(Error::PadRequest {
                node: format!("#{}", node.0),
                template: template.to_string(),
                reason: "no such node".to_string(),
            });
        };
        let request_error = |reason: &str| Error::PadRequest {
            node: n.name.clone(),
            template: template.to_string(),
            reason: reason.to_string(),
        };

        let Some(tmpl) = n
            .info
            .template(template)
            .filter(|t| t.presence == PadPresence::Request)
            .cloned()
        else {
            return Err(request_error("no request template with that name"));
        };

        let pad_name = if tmpl.is_pattern() {
            let index = n.request_index.entry(tmpl.name.clone()).or_insert(0);
            let name = tmpl.instantiate(*index);
            *index += 1;
            name
        } else if n.pad(&tmpl.name).is_some() {
            return Err(request_error("pad already requested"));
        } else {
            tmpl.name.clone()
        };

        let serial = n.issue_serial();
        n.pads.push(SimPad {
            name: pad_name.clone(),
            serial,
            direction: tmpl.direction,
            presence: PadPresence::Request,
            caps: tmpl.caps.clone(),
            peer: None,
        });
        let handle = PadHandle {
            node,
            node_name: n.name.clone(),
            name: pad_name,
            serial,
        };
        state.journal.push(Op::PadRequested {
            pad: handle.to_ref(),
        });
        Ok(handle)
    }

    fn release_pad(&self, pad: &PadHandle) -> Result<()> {
        let mut state = self.lock();
        let release_error = |reason: &str| Error::PadRelease {
            pad: pad.to_string(),
            reason: reason.to_string(),
        };

        let Some(n) = state.node_mut(pad.node) else {
            return Err(release_error("owning node no longer exists"));
        };
        let Some(index) = n
            .pads
            .iter()
            .position(|p| {
                p.name == pad.name && p.serial == pad.serial && p.presence == PadPresence::Request
            })
        else {
            return Err(if n.released.contains(&pad.serial) {
                release_error("already released")
            } else {
                release_error("not a request pad")
            });
        };

        let removed = n.pads.remove(index);
        n.released.insert(removed.serial);
        if let Some((peer, peer_pad)) = removed.peer {
            if let Some(p) = state.nodes.get_mut(&peer).and_then(|n| n.pad_mut(&peer_pad)) {
                p.peer = None;
            }
        }
        state.journal.push(Op::PadReleased { pad: pad.to_ref() });
        Ok(())
    }

    fn destroy_node(&self, node: NodeHandle) -> Result<()> {
        let mut state = self.lock();
        let Some(removed) = state.nodes.remove(&node.0) else {
            return Err(Error::InvalidPipeline(format!(
                "cannot destroy node #{}: no such node",
                node.0
            )));
        };
        state.names.remove(&removed.name);
        for pad in &removed.pads {
            if let Some((peer, peer_pad)) = &pad.peer {
                if let Some(p) = state.nodes.get_mut(peer).and_then(|n| n.pad_mut(peer_pad)) {
                    p.peer = None;
                }
            }
        }
        let outstanding = removed.request_pads();
        if outstanding > 0 {
            tracing::warn!(
                "node '{}' destroyed with {} request pads still held",
                removed.name,
                outstanding
            );
        }
        state.journal.push(Op::NodeDestroyed {
            node: removed.name,
            outstanding_request_pads: outstanding,
        });
        Ok(())
    }

    fn set_state(&self, to: EngineState) -> Result<()> {
        let now = self.clock.now();
        let mut state = self.lock();
        let from = state.state;
        if from == to {
            return Ok(());
        }
        if self.config.reject_state == Some(to) {
            return Err(Error::EngineState {
                from,
                to,
                reason: "transition refused".to_string(),
            });
        }
        state.state = to;
        state.journal.push(Op::StateChanged { from, to });
        state.pending.push_back(Message::StateChanged { from, to });
        tracing::debug!("engine state {} -> {}", from, to);

        if to == EngineState::Playing {
            state.playing_since = Some(now);
            state.eos_posted = false;
            let ids: Vec<(u64, NodeCategory, bool)> = state
                .nodes
                .iter()
                .map(|(id, n)| (*id, n.info.category, n.info.segmenting))
                .collect();
            for (id, category, segmenting) in ids {
                if segmenting {
                    state.schedule(now, SimEvent::Rollover { node: id });
                }
                if category == NodeCategory::Decoder {
                    state.schedule(now, SimEvent::ExposePads { node: id });
                }
            }
            // After decoders exposed their pads.
            state.schedule(now, SimEvent::CheckLinks);
            if let Some(after) = self.config.source_eos_at {
                state.schedule(now + after, SimEvent::SourcesDry);
            }
        } else if from == EngineState::Playing {
            state.playing_since = None;
            let kept: Vec<Reverse<Scheduled>> = state
                .queue
                .drain()
                .filter(|Reverse(s)| matches!(s.event, SimEvent::Action(_) | SimEvent::Error { .. }))
                .collect();
            state.queue.extend(kept);
            for n in state.nodes.values_mut() {
                n.open_fragment = None;
            }
        }
        Ok(())
    }

    fn state(&self) -> EngineState {
        self.lock().state
    }

    fn bus(&self) -> Result<Box<dyn Bus>> {
        let engine = self
            .self_ref
            .upgrade()
            .ok_or_else(|| Error::InvalidPipeline("engine is shutting down".into()))?;
        self.lock().open_buses += 1;
        Ok(Box::new(SimBus { engine }))
    }

    fn send_eos(&self, target: EosTarget) -> Result<()> {
        let now = self.clock.now();
        let mut state = self.lock();
        let label = match target {
            EosTarget::Pipeline => "pipeline".to_string(),
            EosTarget::Node(handle) => match state.node(handle) {
                Some(n) => n.name.clone(),
                None => {
                    return Err(Error::InvalidPipeline(format!(
                        "cannot send EOS to node #{}: no such node",
                        handle.0
                    )));
                }
            },
        };
        state.journal.push(Op::EosSent {
            target: label.clone(),
        });
        if state.state != EngineState::Playing {
            tracing::debug!("EOS to {} ignored, engine is {}", label, state.state);
            return Ok(());
        }
        match self.config.drain_latency {
            Some(latency) => state.schedule(now + latency, SimEvent::Drain { target }),
            None => tracing::debug!("EOS to {} will never drain", label),
        }
        Ok(())
    }

    fn connect_format_location(&self, node: NodeHandle, hook: FormatLocationFn) -> Result<()> {
        let mut state = self.lock();
        match state.node_mut(node) {
            Some(n) if n.info.segmenting => {
                n.format_location = Some(hook);
                Ok(())
            }
            Some(n) => Err(Error::InvalidPipeline(format!(
                "node '{}' has no format-location hook",
                n.name
            ))),
            None => Err(Error::InvalidPipeline(format!("no node #{}", node.0))),
        }
    }

    fn connect_pad_added(&self, node: NodeHandle, hook: PadAddedFn) -> Result<()> {
        let mut state = self.lock();
        match state.node_mut(node) {
            Some(n)
                if n
                    .info
                    .templates
                    .iter()
                    .any(|t| t.presence == PadPresence::Sometimes) =>
            {
                n.pad_added = Some(hook);
                Ok(())
            }
            Some(n) => Err(Error::InvalidPipeline(format!(
                "node '{}' never adds pads",
                n.name
            ))),
            None => Err(Error::InvalidPipeline(format!("no node #{}", node.0))),
        }
    }
}

// ============================================================================
// Bus
// ============================================================================

struct SimBus {
    engine: Arc<SimEngine>,
}

impl Bus for SimBus {
    fn timed_pop(&mut self, timeout: ClockTime) -> Option<Message> {
        self.engine.pop_message(timeout)
    }
}

impl Drop for SimBus {
    fn drop(&mut self) {
        let mut state = self.engine.lock();
        state.open_buses = state.open_buses.saturating_sub(1);
        state.journal.push(Op::BusReleased);
    }
}

/// Expand the first `%d`, `%u` or `%0Nd` in a fragment location pattern.
fn format_fragment_pattern(pattern: &str, fragment_id: u32) -> String {
    let Some(pos) = pattern.find('%') else {
        return pattern.to_string();
    };
    let spec = &pattern[pos + 1..];
    let digits: String = spec.chars().take_while(|c| c.is_ascii_digit()).collect();
    let rest = &spec[digits.len()..];
    let Some(tail) = rest.strip_prefix('d').or_else(|| rest.strip_prefix('u')) else {
        return pattern.to_string();
    };
    let width: usize = digits.parse().unwrap_or(0);
    let number = if digits.starts_with('0') {
        format!("{:0width$}", fragment_id, width = width)
    } else {
        format!("{:width$}", fragment_id, width = width)
    };
    format!("{}{}{}", &pattern[..pos], number, tail)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn engine() -> (Arc<SimEngine>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(0));
        (SimEngine::new(clock.clone()), clock)
    }

    #[test]
    fn test_fragment_pattern() {
        assert_eq!(format_fragment_pattern("chunk%02d.mp4", 3), "chunk03.mp4");
        assert_eq!(format_fragment_pattern("seg%d.ts", 12), "seg12.ts");
        assert_eq!(format_fragment_pattern("seg%05u", 7), "seg00007");
        assert_eq!(format_fragment_pattern("plain.mp4", 1), "plain.mp4");
        assert_eq!(format_fragment_pattern("odd%s", 1), "odd%s");
    }

    #[test]
    fn test_unknown_kind_and_duplicate_name() {
        let (engine, _) = engine();
        assert!(matches!(
            engine.create_node("nosuchkind", "x"),
            Err(Error::NodeCreation { .. })
        ));
        engine.create_node("queue", "q").unwrap();
        assert!(matches!(
            engine.create_node("queue", "q"),
            Err(Error::NodeCreation { .. })
        ));
    }

    #[test]
    fn test_request_pad_indices_and_release() {
        let (engine, _) = engine();
        let mux = engine.create_node("splitmuxsink", "mux").unwrap();
        let a = engine.request_pad(mux, "audio_%u").unwrap();
        let b = engine.request_pad(mux, "audio_%u").unwrap();
        assert_eq!(a.name, "audio_0");
        assert_eq!(b.name, "audio_1");

        let v = engine.request_pad(mux, "video").unwrap();
        assert!(matches!(
            engine.request_pad(mux, "video"),
            Err(Error::PadRequest { .. })
        ));
        assert!(matches!(
            engine.request_pad(mux, "subtitle_%u"),
            Err(Error::PadRequest { .. })
        ));

        engine.release_pad(&a).unwrap();
        assert!(matches!(engine.release_pad(&a), Err(Error::PadRelease { .. })));
        engine.release_pad(&b).unwrap();
        engine.release_pad(&v).unwrap();

        // Indices are never reused.
        let c = engine.request_pad(mux, "audio_%u").unwrap();
        assert_eq!(c.name, "audio_2");
    }

    #[test]
    fn test_released_fixed_pad_handle_stays_dead() {
        let (engine, _) = engine();
        let mux = engine.create_node("splitmuxsink", "smx").unwrap();
        let enc = engine.create_node("x264enc", "enc").unwrap();
        let enc_src = engine.static_pad(enc, "src").unwrap();

        let first = engine.request_pad(mux, "video").unwrap();
        engine.release_pad(&first).unwrap();
        let second = engine.request_pad(mux, "video").unwrap();
        assert_eq!(first.name, second.name);
        assert_ne!(first, second);

        // The old handle reaches neither the new pad nor its link.
        assert!(matches!(
            engine.release_pad(&first),
            Err(Error::PadRelease { ref reason, .. }) if reason == "already released"
        ));
        assert!(matches!(
            engine.link_pads(&enc_src, &first, None),
            Err(Error::Link { .. })
        ));
        assert!(!engine.is_linked(&enc_src));
        assert!(engine.pad_caps(&first).is_none());

        engine.link_pads(&enc_src, &second, None).unwrap();
        assert!(!engine.is_linked(&first));
        assert!(engine.is_linked(&second));
        engine.release_pad(&second).unwrap();
    }

    #[test]
    fn test_link_checks_caps() {
        let (engine, _) = engine();
        let resample = engine.create_node("audioresample", "resample").unwrap();
        let enc = engine.create_node("fdkaacenc", "enc").unwrap();
        let src = engine.static_pad(resample, "src").unwrap();
        let sink = engine.static_pad(enc, "sink").unwrap();

        let bad = Caps::audio_raw(17000, 1);
        assert!(matches!(
            engine.link_pads(&src, &sink, Some(&bad)),
            Err(Error::Link { .. })
        ));
        assert!(!engine.is_linked(&src));

        engine
            .link_pads(&src, &sink, Some(&Caps::audio_raw(16000, 1)))
            .unwrap();
        assert!(engine.is_linked(&sink));
        assert!(matches!(
            engine.link_pads(&src, &sink, None),
            Err(Error::Link { .. })
        ));
    }

    #[test]
    fn test_unlinked_input_posts_error() {
        let (engine, _) = engine();
        engine.create_node("videotestsrc", "src").unwrap();
        engine.create_node("fakesink", "sink").unwrap();
        engine.set_state(EngineState::Playing).unwrap();

        let mut bus = engine.bus().unwrap();
        let mut error_node = None;
        while let Some(msg) = bus.timed_pop(ClockTime::from_millis(10)) {
            if let Message::Error { node, .. } = msg {
                error_node = node;
            }
        }
        assert_eq!(error_node.as_deref(), Some("sink"));
    }

    #[test]
    fn test_rejected_state() {
        let clock = Arc::new(ManualClock::new(0));
        let config = SimConfig {
            reject_state: Some(EngineState::Playing),
            ..SimConfig::default()
        };
        let engine = SimEngine::with_config(clock, config);
        let err = engine.set_state(EngineState::Playing).unwrap_err();
        assert!(matches!(err, Error::EngineState { .. }));
        assert_eq!(engine.state(), EngineState::Null);
    }

    #[test]
    fn test_rollover_and_drain() {
        let (engine, clock) = engine();
        let src = engine.create_node("audiotestsrc", "src").unwrap();
        let mux = engine.create_node("splitmuxsink", "mux").unwrap();
        engine
            .set_property(mux, "max-size-time", PropertyValue::from(1_000_000_000u64))
            .unwrap();
        engine
            .set_property(mux, "location", PropertyValue::from("chunk%02d.mp4"))
            .unwrap();
        let pad = engine.request_pad(mux, "audio_%u").unwrap();
        engine
            .link_pads(&engine.static_pad(src, "src").unwrap(), &pad, None)
            .unwrap();
        engine.set_state(EngineState::Playing).unwrap();

        let mut bus = engine.bus().unwrap();
        let mut opened = Vec::new();
        while clock.now() < ClockTime::from_millis(2500) {
            if let Some(Message::FragmentOpened { location, .. }) =
                bus.timed_pop(ClockTime::from_millis(100))
            {
                opened.push(location);
            }
        }
        assert_eq!(opened, vec!["chunk00.mp4", "chunk01.mp4", "chunk02.mp4"]);

        engine.send_eos(EosTarget::Node(mux)).unwrap();
        let mut got_eos = false;
        for _ in 0..20 {
            if bus.timed_pop(ClockTime::from_millis(100)) == Some(Message::Eos) {
                got_eos = true;
                break;
            }
        }
        assert!(got_eos);
        drop(bus);
        assert_eq!(engine.open_buses(), 0);
    }

    #[test]
    fn test_stalled_drain_never_posts_eos() {
        let clock = Arc::new(ManualClock::new(0));
        let config = SimConfig {
            drain_latency: None,
            ..SimConfig::default()
        };
        let engine = SimEngine::with_config(clock.clone(), config);
        let src = engine.create_node("videotestsrc", "src").unwrap();
        let sink = engine.create_node("fakesink", "sink").unwrap();
        engine
            .link_pads(
                &engine.static_pad(src, "src").unwrap(),
                &engine.static_pad(sink, "sink").unwrap(),
                None,
            )
            .unwrap();
        engine.set_state(EngineState::Playing).unwrap();
        engine.send_eos(EosTarget::Pipeline).unwrap();

        let mut bus = engine.bus().unwrap();
        let mut seen = Vec::new();
        while let Some(msg) = bus.timed_pop(ClockTime::from_secs(10)) {
            seen.push(msg);
        }
        assert!(!seen.contains(&Message::Eos));
        assert_eq!(clock.now(), ClockTime::from_secs(10));
    }

    #[test]
    fn test_action_wakes_poll() {
        let (engine, clock) = engine();
        let flag = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let f = flag.clone();
        engine.schedule_action(ClockTime::from_millis(300), move || {
            f.store(true, std::sync::atomic::Ordering::SeqCst)
        });
        let mut bus = engine.bus().unwrap();
        assert!(bus.timed_pop(ClockTime::from_secs(1)).is_none());
        assert!(flag.load(std::sync::atomic::Ordering::SeqCst));
        assert_eq!(clock.now(), ClockTime::from_millis(300));
    }

    #[test]
    fn test_destroy_reports_outstanding_pads() {
        let (engine, _) = engine();
        let tee = engine.create_node("tee", "tee").unwrap();
        engine.request_pad(tee, "src_%u").unwrap();
        engine.destroy_node(tee).unwrap();
        assert_eq!(engine.destroyed_nodes(), vec![("tee".to_string(), 1)]);
        assert!(engine.destroy_node(tee).is_err());
    }
}
