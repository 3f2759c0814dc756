//! Bus messages posted by the engine and forwarded by the controller.
//!
//! The engine posts [`Message`]s on its bus. The controller pops them while
//! polling and republishes every one on a broadcast channel so observers
//! (CLI progress output, tests) can follow a run without owning the bus.

use std::fmt;
use tokio::sync::broadcast;

use crate::clock::ClockTime;
use crate::engine::EngineState;

/// Messages posted on the engine bus.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// End of stream reached on every sink.
    Eos,

    /// An error occurred while running.
    Error {
        /// The error message.
        message: String,
        /// The node where the error occurred (if known).
        node: Option<String>,
        /// Extra detail for logs.
        debug: Option<String>,
    },

    /// Warning (non-fatal issue).
    Warning {
        /// The warning message.
        message: String,
        /// The node that emitted the warning (if known).
        node: Option<String>,
    },

    /// Engine state has changed.
    StateChanged {
        /// Previous state.
        from: EngineState,
        /// New state.
        to: EngineState,
    },

    /// A segmenting sink opened a new fragment.
    FragmentOpened {
        /// The segmenting sink.
        node: String,
        /// Where the fragment is written.
        location: String,
        /// Running time of the first byte.
        running_time: ClockTime,
    },

    /// A segmenting sink finished a fragment.
    FragmentClosed {
        /// The segmenting sink.
        node: String,
        /// Where the fragment was written.
        location: String,
        /// Running time of the boundary.
        running_time: ClockTime,
    },

    /// A node exposed a new sometimes pad.
    PadAdded {
        /// The node.
        node: String,
        /// The new pad's name.
        pad: String,
    },
}

impl Message {
    /// True for messages that end a run.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Message::Eos | Message::Error { .. })
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Message::Eos => write!(f, "EOS"),
            Message::Error { message, node, .. } => {
                if let Some(n) = node {
                    write!(f, "Error in {}: {}", n, message)
                } else {
                    write!(f, "Error: {}", message)
                }
            }
            Message::Warning { message, node } => {
                if let Some(n) = node {
                    write!(f, "Warning in {}: {}", n, message)
                } else {
                    write!(f, "Warning: {}", message)
                }
            }
            Message::StateChanged { from, to } => write!(f, "StateChanged: {} -> {}", from, to),
            Message::FragmentOpened {
                node,
                location,
                running_time,
            } => write!(f, "{} opened '{}' at {}", node, location, running_time),
            Message::FragmentClosed {
                node,
                location,
                running_time,
            } => write!(f, "{} closed '{}' at {}", node, location, running_time),
            Message::PadAdded { node, pad } => write!(f, "Pad {}.{} added", node, pad),
        }
    }
}

/// Publishes forwarded bus messages to any number of observers.
#[derive(Clone)]
pub struct MessageSender {
    sender: broadcast::Sender<Message>,
}

impl MessageSender {
    /// Create a new sender with the given capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish a message. Returns the number of observers that got it.
    pub fn send(&self, message: Message) -> usize {
        self.sender.send(message).unwrap_or(0)
    }

    /// Create a receiver.
    pub fn subscribe(&self) -> MessageReceiver {
        MessageReceiver {
            receiver: self.sender.subscribe(),
        }
    }
}

impl Default for MessageSender {
    fn default() -> Self {
        Self::new(256)
    }
}

impl fmt::Debug for MessageSender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageSender")
            .field("receivers", &self.sender.receiver_count())
            .finish()
    }
}

/// Observer end of a [`MessageSender`].
pub struct MessageReceiver {
    receiver: broadcast::Receiver<Message>,
}

impl MessageReceiver {
    /// Receive the next message, waiting if none is queued.
    ///
    /// Returns `None` once the sender has been dropped.
    pub async fn recv(&mut self) -> Option<Message> {
        loop {
            match self.receiver.recv().await {
                Ok(message) => return Some(message),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Take the next queued message without waiting.
    pub fn try_recv(&mut self) -> Option<Message> {
        loop {
            match self.receiver.try_recv() {
                Ok(message) => return Some(message),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }

    /// Drain everything queued so far.
    pub fn drain(&mut self) -> Vec<Message> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }
}
