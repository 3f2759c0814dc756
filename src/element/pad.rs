//! Pads: the connection points of nodes.
//!
//! Every node kind declares pad templates. A template is either always
//! present (instantiated when the node is created), sometimes present
//! (created by the node itself while it runs) or request (instantiated on
//! demand by the orchestrator and released before the node is destroyed).

use std::fmt;

use crate::format::Caps;

/// Direction of a pad (input or output).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PadDirection {
    /// An input pad (receives data from upstream).
    Input,
    /// An output pad (sends data downstream).
    Output,
}

impl fmt::Display for PadDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Input => "sink",
            Self::Output => "src",
        })
    }
}

/// Whether a pad is always present or created dynamically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PadPresence {
    /// Pad is always present on the node.
    Always,
    /// Pad appears while running (e.g. decoder outputs).
    Sometimes,
    /// Pad is created when requested.
    Request,
}

/// Template for creating pads.
#[derive(Debug, Clone, PartialEq)]
pub struct PadTemplate {
    /// Name or name pattern (e.g. `sink`, `src_%u`, `audio_%u`).
    pub name: String,
    /// Direction of pads made from this template.
    pub direction: PadDirection,
    /// Presence of pads made from this template.
    pub presence: PadPresence,
    /// What pads of this template accept or produce.
    pub caps: Caps,
}

impl PadTemplate {
    /// Create a new pad template.
    pub fn new(
        name: impl Into<String>,
        direction: PadDirection,
        presence: PadPresence,
        caps: Caps,
    ) -> Self {
        Self {
            name: name.into(),
            direction,
            presence,
            caps,
        }
    }

    /// Always-present input pad.
    pub fn input(name: impl Into<String>, caps: Caps) -> Self {
        Self::new(name, PadDirection::Input, PadPresence::Always, caps)
    }

    /// Always-present output pad.
    pub fn output(name: impl Into<String>, caps: Caps) -> Self {
        Self::new(name, PadDirection::Output, PadPresence::Always, caps)
    }

    /// Sometimes-present output pad.
    pub fn sometimes_output(name: impl Into<String>, caps: Caps) -> Self {
        Self::new(name, PadDirection::Output, PadPresence::Sometimes, caps)
    }

    /// Request input pad.
    pub fn request_input(name: impl Into<String>, caps: Caps) -> Self {
        Self::new(name, PadDirection::Input, PadPresence::Request, caps)
    }

    /// Request output pad.
    pub fn request_output(name: impl Into<String>, caps: Caps) -> Self {
        Self::new(name, PadDirection::Output, PadPresence::Request, caps)
    }

    /// True if the name contains a `%u`/`%d` style index placeholder.
    pub fn is_pattern(&self) -> bool {
        self.name.contains('%')
    }

    /// Pad name for the given instance index.
    ///
    /// ```rust
    /// use mediarig::element::PadTemplate;
    /// use mediarig::format::Caps;
    ///
    /// let t = PadTemplate::request_input("audio_%u", Caps::Any);
    /// assert_eq!(t.instantiate(1), "audio_1");
    /// ```
    pub fn instantiate(&self, index: u32) -> String {
        match self.name.find('%') {
            Some(pos) => {
                let rest = &self.name[pos + 1..];
                let tail = rest.get(1..).unwrap_or("");
                format!("{}{}{}", &self.name[..pos], index, tail)
            }
            None => self.name.clone(),
        }
    }

    /// Check whether a concrete pad name was made from this template.
    pub fn matches(&self, pad_name: &str) -> bool {
        match self.name.find('%') {
            Some(pos) => {
                let prefix = &self.name[..pos];
                let suffix = self.name[pos + 1..].get(1..).unwrap_or("");
                pad_name
                    .strip_prefix(prefix)
                    .and_then(|rest| rest.strip_suffix(suffix))
                    .is_some_and(|idx| !idx.is_empty() && idx.bytes().all(|b| b.is_ascii_digit()))
            }
            None => self.name == pad_name,
        }
    }
}

/// A concrete pad on a named node, rendered as `node.pad`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PadRef {
    /// Owning node name.
    pub node: String,
    /// Pad name.
    pub pad: String,
}

impl PadRef {
    /// Create a pad reference.
    pub fn new(node: impl Into<String>, pad: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            pad: pad.into(),
        }
    }
}

impl fmt::Display for PadRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.node, self.pad)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pad_template() {
        let template = PadTemplate::input("sink", Caps::Any);
        assert_eq!(template.direction, PadDirection::Input);
        assert_eq!(template.presence, PadPresence::Always);
        assert!(!template.is_pattern());

        let template = PadTemplate::sometimes_output("src_%u", Caps::Any);
        assert_eq!(template.direction, PadDirection::Output);
        assert_eq!(template.presence, PadPresence::Sometimes);
        assert!(template.is_pattern());
    }

    #[test]
    fn test_template_instantiate() {
        assert_eq!(PadTemplate::request_output("src_%u", Caps::Any).instantiate(0), "src_0");
        assert_eq!(PadTemplate::request_input("video_%d", Caps::Any).instantiate(3), "video_3");
        assert_eq!(PadTemplate::request_input("video", Caps::Any).instantiate(3), "video");
    }

    #[test]
    fn test_template_matches() {
        let t = PadTemplate::request_input("audio_%u", Caps::Any);
        assert!(t.matches("audio_0"));
        assert!(t.matches("audio_12"));
        assert!(!t.matches("audio_"));
        assert!(!t.matches("audio_x"));
        assert!(!t.matches("video_0"));

        let plain = PadTemplate::request_input("video", Caps::Any);
        assert!(plain.matches("video"));
        assert!(!plain.matches("video_0"));
    }

    #[test]
    fn test_pad_ref_display() {
        assert_eq!(PadRef::new("tee", "src_0").to_string(), "tee.src_0");
    }
}
