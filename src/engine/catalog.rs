//! Registry of node kinds an engine can instantiate.

use std::collections::HashMap;

use crate::element::{KindInfo, NodeCategory, PadTemplate};
use crate::format::{
    AudioCodec, AudioFormatCaps, Caps, CapsValue, ContainerFormat, PixelFormat, SampleFormat,
    VideoCodec, VideoFormatCaps,
};

/// Registry of node kinds by name.
#[derive(Debug, Clone, Default)]
pub struct KindCatalog {
    kinds: HashMap<String, KindInfo>,
}

impl KindCatalog {
    /// Create an empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Catalog with the kinds used by the recording recipes.
    pub fn standard() -> Self {
        let mut catalog = Self::new();

        // Sources
        catalog.register(
            KindInfo::new("videotestsrc", NodeCategory::Source, "Synthetic test pattern")
                .with_template(PadTemplate::output("src", raw_video_formats())),
        );
        catalog.register(
            KindInfo::new("audiotestsrc", NodeCategory::Source, "Synthetic test tone")
                .with_template(PadTemplate::output("src", Caps::any_audio_raw())),
        );
        catalog.register(
            KindInfo::new("uridecodebin", NodeCategory::Decoder, "Decode a URI into raw streams")
                .with_template(PadTemplate::sometimes_output("src_%u", Caps::Any)),
        );

        // Filters
        catalog.register(
            KindInfo::new("queue", NodeCategory::Filter, "Thread boundary and buffer")
                .with_template(PadTemplate::input("sink", Caps::Any))
                .with_template(PadTemplate::output("src", Caps::Any)),
        );
        catalog.register(
            KindInfo::new("videoconvert", NodeCategory::Filter, "Pixel layout conversion")
                .with_template(PadTemplate::input("sink", Caps::any_video_raw()))
                .with_template(PadTemplate::output("src", Caps::any_video_raw())),
        );
        catalog.register(
            KindInfo::new("audioconvert", NodeCategory::Filter, "Sample format conversion")
                .with_template(PadTemplate::input("sink", Caps::any_audio_raw()))
                .with_template(PadTemplate::output("src", Caps::any_audio_raw())),
        );
        catalog.register(
            KindInfo::new("audioresample", NodeCategory::Filter, "Sample rate conversion")
                .with_template(PadTemplate::input("sink", Caps::any_audio_raw()))
                .with_template(PadTemplate::output("src", Caps::any_audio_raw())),
        );
        let rgb = Caps::VideoRaw(VideoFormatCaps::any().with_formats(vec![PixelFormat::Rgb]));
        catalog.register(
            KindInfo::new("faceblur", NodeCategory::Filter, "Blur detected faces")
                .with_template(PadTemplate::input("sink", rgb.clone()))
                .with_template(PadTemplate::output("src", rgb)),
        );

        // Encoders
        catalog.register(
            KindInfo::new("x264enc", NodeCategory::Encoder, "H.264 software encoder")
                .with_template(PadTemplate::input(
                    "sink",
                    Caps::VideoRaw(VideoFormatCaps::any().with_formats(vec![
                        PixelFormat::I420,
                        PixelFormat::Nv12,
                        PixelFormat::Yuy2,
                    ])),
                ))
                .with_template(PadTemplate::output("src", Caps::VideoEncoded(VideoCodec::H264))),
        );
        catalog.register(
            KindInfo::new("avenc_aac", NodeCategory::Encoder, "AAC encoder")
                .with_template(PadTemplate::input(
                    "sink",
                    Caps::AudioRaw(AudioFormatCaps {
                        sample_format: CapsValue::Fixed(SampleFormat::F32Le),
                        sample_rate: CapsValue::Range { min: 8000, max: 96000 },
                        channels: CapsValue::Range { min: 1, max: 6 },
                    }),
                ))
                .with_template(PadTemplate::output("src", Caps::AudioEncoded(AudioCodec::Aac))),
        );
        catalog.register(
            KindInfo::new("fdkaacenc", NodeCategory::Encoder, "Fraunhofer AAC encoder")
                .with_template(PadTemplate::input(
                    "sink",
                    Caps::AudioRaw(AudioFormatCaps {
                        sample_format: CapsValue::Fixed(SampleFormat::S16Le),
                        sample_rate: CapsValue::List(vec![
                            8000, 11025, 12000, 16000, 22050, 24000, 32000, 44100, 48000, 88200,
                            96000,
                        ]),
                        channels: CapsValue::Range { min: 1, max: 8 },
                    }),
                ))
                .with_template(PadTemplate::output("src", Caps::AudioEncoded(AudioCodec::Aac))),
        );

        // Muxers
        catalog.register(
            KindInfo::new("mp4mux", NodeCategory::Muxer, "ISO MP4 multiplexer")
                .with_template(PadTemplate::request_input(
                    "video_%u",
                    Caps::VideoEncoded(VideoCodec::H264),
                ))
                .with_template(PadTemplate::request_input(
                    "audio_%u",
                    Caps::AudioEncoded(AudioCodec::Aac),
                ))
                .with_template(PadTemplate::output("src", Caps::Container(ContainerFormat::Mp4))),
        );
        catalog.register(
            KindInfo::new("flvmux", NodeCategory::Muxer, "FLV multiplexer")
                .with_template(PadTemplate::request_input(
                    "video",
                    Caps::VideoEncoded(VideoCodec::H264),
                ))
                .with_template(PadTemplate::request_input(
                    "audio",
                    Caps::AudioEncoded(AudioCodec::Aac),
                ))
                .with_template(PadTemplate::output("src", Caps::Container(ContainerFormat::Flv))),
        );

        // Fan-out
        catalog.register(
            KindInfo::new("tee", NodeCategory::FanOut, "Duplicate a stream")
                .with_template(PadTemplate::input("sink", Caps::Any))
                .with_template(PadTemplate::request_output("src_%u", Caps::Any)),
        );

        // Sinks
        catalog.register(
            KindInfo::new("splitmuxsink", NodeCategory::Sink, "Mux into size/time bounded fragments")
                .with_template(PadTemplate::request_input("video", Caps::Any))
                .with_template(PadTemplate::request_input("audio_%u", Caps::Any))
                .segmenting(),
        );
        for (name, description) in [
            ("filesink", "Write to a local file"),
            ("fakesink", "Discard everything"),
            ("awss3sink", "Upload to an S3-compatible object store"),
        ] {
            catalog.register(
                KindInfo::new(name, NodeCategory::Sink, description)
                    .with_template(PadTemplate::input("sink", Caps::Any)),
            );
        }
        catalog.register(
            KindInfo::new("autovideosink", NodeCategory::Sink, "Display video")
                .with_template(PadTemplate::input("sink", Caps::any_video_raw())),
        );
        catalog.register(
            KindInfo::new("autoaudiosink", NodeCategory::Sink, "Play audio")
                .with_template(PadTemplate::input("sink", Caps::any_audio_raw())),
        );

        catalog
    }

    /// Register a kind, replacing any kind with the same name.
    pub fn register(&mut self, info: KindInfo) {
        self.kinds.insert(info.name.clone(), info);
    }

    /// Remove a kind. Returns it if it was registered.
    pub fn remove(&mut self, name: &str) -> Option<KindInfo> {
        self.kinds.remove(name)
    }

    /// Look up a kind.
    pub fn get(&self, name: &str) -> Option<&KindInfo> {
        self.kinds.get(name)
    }

    /// Check if a kind is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.kinds.contains_key(name)
    }

    /// All kinds, sorted by name.
    pub fn list(&self) -> Vec<&KindInfo> {
        let mut kinds: Vec<&KindInfo> = self.kinds.values().collect();
        kinds.sort_by(|a, b| a.name.cmp(&b.name));
        kinds
    }

    /// Number of registered kinds.
    pub fn len(&self) -> usize {
        self.kinds.len()
    }

    /// Check if the catalog is empty.
    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }
}

fn raw_video_formats() -> Caps {
    Caps::VideoRaw(VideoFormatCaps::any().with_formats(vec![
        PixelFormat::I420,
        PixelFormat::Nv12,
        PixelFormat::Yuy2,
        PixelFormat::Rgb,
        PixelFormat::Rgba,
        PixelFormat::Bgrx,
    ]))
}
