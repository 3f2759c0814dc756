//! Node kinds: the instantiable stage types an engine offers.

use std::fmt;

use super::pad::{PadDirection, PadPresence, PadTemplate};

/// Role of a node in a recording graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeCategory {
    /// Produces media (test pattern, tone, capture).
    Source,
    /// Decodes a URI into raw streams on sometimes pads.
    Decoder,
    /// Converts, resamples, buffers or otherwise transforms raw media.
    Filter,
    /// Compresses raw media.
    Encoder,
    /// Interleaves streams into a container.
    Muxer,
    /// Duplicates one stream onto many request pads.
    FanOut,
    /// Terminal stage.
    Sink,
}

impl fmt::Display for NodeCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Source => "source",
            Self::Decoder => "decoder",
            Self::Filter => "filter",
            Self::Encoder => "encoder",
            Self::Muxer => "muxer",
            Self::FanOut => "fan-out",
            Self::Sink => "sink",
        })
    }
}

/// Description of one node kind: its category and pad templates.
#[derive(Debug, Clone)]
pub struct KindInfo {
    /// Kind name (e.g. `x264enc`).
    pub name: String,
    /// Category of nodes of this kind.
    pub category: NodeCategory,
    /// Pad templates in declaration order.
    pub templates: Vec<PadTemplate>,
    /// True for sinks that cut their input into fragments and expose a
    /// format-location hook.
    pub segmenting: bool,
    /// One-line description for listings.
    pub description: String,
}

impl KindInfo {
    /// Create a kind with no templates.
    pub fn new(name: impl Into<String>, category: NodeCategory, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            category,
            templates: Vec::new(),
            segmenting: false,
            description: description.into(),
        }
    }

    /// Add a pad template.
    pub fn with_template(mut self, template: PadTemplate) -> Self {
        self.templates.push(template);
        self
    }

    /// Mark as a segmenting sink.
    pub fn segmenting(mut self) -> Self {
        self.segmenting = true;
        self
    }

    /// Find the template named exactly `name`.
    pub fn template(&self, name: &str) -> Option<&PadTemplate> {
        self.templates.iter().find(|t| t.name == name)
    }

    /// Find the template a concrete pad name belongs to.
    pub fn template_for_pad(&self, pad_name: &str) -> Option<&PadTemplate> {
        self.templates
            .iter()
            .find(|t| t.name == pad_name)
            .or_else(|| self.templates.iter().find(|t| t.matches(pad_name)))
    }

    /// Always-present templates.
    pub fn always_pads(&self) -> impl Iterator<Item = &PadTemplate> {
        self.templates
            .iter()
            .filter(|t| t.presence == PadPresence::Always)
    }

    /// Always-present input templates.
    pub fn always_inputs(&self) -> impl Iterator<Item = &PadTemplate> {
        self.always_pads()
            .filter(|t| t.direction == PadDirection::Input)
    }

    /// Always-present output templates.
    pub fn always_outputs(&self) -> impl Iterator<Item = &PadTemplate> {
        self.always_pads()
            .filter(|t| t.direction == PadDirection::Output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::Caps;

    #[test]
    fn test_template_lookup() {
        let info = KindInfo::new("splitmuxsink", NodeCategory::Sink, "segmenting muxer sink")
            .with_template(PadTemplate::request_input("video", Caps::Any))
            .with_template(PadTemplate::request_input("audio_%u", Caps::Any))
            .segmenting();

        assert!(info.segmenting);
        assert_eq!(info.template_for_pad("audio_2").map(|t| t.name.as_str()), Some("audio_%u"));
        assert_eq!(info.template_for_pad("video").map(|t| t.name.as_str()), Some("video"));
        assert!(info.template_for_pad("subtitle_0").is_none());
        assert_eq!(info.always_inputs().count(), 0);
        assert_eq!(info.always_outputs().count(), 0);
    }

    #[test]
    fn test_always_pads_split_by_direction() {
        let info = KindInfo::new("x264enc", NodeCategory::Encoder, "H.264 encoder")
            .with_template(PadTemplate::input("sink", Caps::Any))
            .with_template(PadTemplate::output("src", Caps::Any));

        let inputs: Vec<&str> = info.always_inputs().map(|t| t.name.as_str()).collect();
        let outputs: Vec<&str> = info.always_outputs().map(|t| t.name.as_str()).collect();
        assert_eq!(inputs, vec!["sink"]);
        assert_eq!(outputs, vec!["src"]);
    }
}
