//! Error types for mediarig.

use thiserror::Error;

/// Result type alias using mediarig's Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Process exit code for construction and linking failures (`-1` as a byte).
pub const EXIT_CONSTRUCTION: u8 = 255;

/// Process exit code for runtime failures.
pub const EXIT_RUNTIME: u8 = 1;

/// Process exit code for usage and configuration errors.
pub const EXIT_USAGE: u8 = 2;

/// Main error type for mediarig operations.
#[derive(Error, Debug)]
pub enum Error {
    /// A requested node kind is not available in the engine.
    #[error("cannot create node '{name}' of kind '{kind}': {reason}")]
    NodeCreation {
        /// Kind that was requested.
        kind: String,
        /// Name the node would have had.
        name: String,
        /// Why the engine refused.
        reason: String,
    },

    /// A static or dynamic link could not be established.
    #[error("cannot link {src} -> {sink}: {reason}")]
    Link {
        /// Source endpoint (`node.pad`).
        src: String,
        /// Sink endpoint (`node.pad`).
        sink: String,
        /// Why the link failed.
        reason: String,
    },

    /// A request pad could not be obtained.
    #[error("cannot request pad '{template}' on '{node}': {reason}")]
    PadRequest {
        /// Node owning the request template.
        node: String,
        /// Template name (e.g. `audio_%u`).
        template: String,
        /// Why the request failed.
        reason: String,
    },

    /// A request pad could not be released.
    #[error("cannot release pad '{pad}': {reason}")]
    PadRelease {
        /// Pad endpoint (`node.pad`).
        pad: String,
        /// Why the release failed.
        reason: String,
    },

    /// The engine rejected a state transition.
    #[error("engine rejected state change {from:?} -> {to:?}: {reason}")]
    EngineState {
        /// State before the transition.
        from: crate::engine::EngineState,
        /// Requested state.
        to: crate::engine::EngineState,
        /// Why the engine refused.
        reason: String,
    },

    /// An asynchronous error arrived on the bus while running.
    #[error("runtime error{}: {message}", .node.as_deref().map(|n| format!(" in '{n}'")).unwrap_or_default())]
    RuntimeSignal {
        /// Error message from the engine.
        message: String,
        /// Node that posted the error, if known.
        node: Option<String>,
    },

    /// The pipeline structure is invalid.
    #[error("invalid pipeline: {0}")]
    InvalidPipeline(String),

    /// A property could not be applied.
    #[error("property '{property}' on '{node}': {reason}")]
    Property {
        /// Node name.
        node: String,
        /// Property name.
        property: String,
        /// Why it failed.
        reason: String,
    },

    /// Configuration is invalid.
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration file could not be parsed.
    #[error("cannot parse configuration: {0}")]
    Toml(#[from] toml::de::Error),
}

impl Error {
    /// Returns true for errors raised while constructing the graph.
    pub fn is_construction(&self) -> bool {
        matches!(
            self,
            Error::NodeCreation { .. }
                | Error::Link { .. }
                | Error::PadRequest { .. }
                | Error::InvalidPipeline(_)
                | Error::Property { .. }
        )
    }

    /// Process exit code for this error.
    pub fn exit_code(&self) -> u8 {
        match self {
            e if e.is_construction() => EXIT_CONSTRUCTION,
            Error::Config(_) | Error::Toml(_) | Error::Io(_) => EXIT_USAGE,
            _ => EXIT_RUNTIME,
        }
    }

    pub(crate) fn link(src: impl Into<String>, sink: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::Link {
            src: src.into(),
            sink: sink.into(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        let err = Error::NodeCreation {
            kind: "x264enc".into(),
            name: "enc".into(),
            reason: "no such kind".into(),
        };
        assert_eq!(err.exit_code(), EXIT_CONSTRUCTION);
        assert_eq!(Error::link("a.src", "b.sink", "caps").exit_code(), EXIT_CONSTRUCTION);
        assert_eq!(Error::Config("bad".into()).exit_code(), EXIT_USAGE);

        let err = Error::RuntimeSignal {
            message: "upload failed".into(),
            node: Some("gcs_sink".into()),
        };
        assert_eq!(err.exit_code(), EXIT_RUNTIME);
    }

    #[test]
    fn test_runtime_signal_display() {
        let err = Error::RuntimeSignal {
            message: "boom".into(),
            node: Some("enc".into()),
        };
        assert_eq!(err.to_string(), "runtime error in 'enc': boom");

        let err = Error::RuntimeSignal {
            message: "boom".into(),
            node: None,
        };
        assert_eq!(err.to_string(), "runtime error: boom");
    }
}
