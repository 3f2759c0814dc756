//! Named recording topologies.
//!
//! Each [`Recipe`] expands a [`RecorderConfig`] into a [`PipelineSpec`]. The
//! node names are stable so EOS targets, error reports and DOT dumps read
//! the same across runs.
//!
//! | recipe | output |
//! |---|---|
//! | `encode-fakesink` | H.264 encode, discarded |
//! | `mp4mux-fakesink` | H.264 into MP4, discarded |
//! | `av-mp4mux-fakesink` | H.264 + AAC into MP4, discarded |
//! | `splitmux-s3` | H.264 + AAC segments uploaded to object storage |
//! | `splitmux-s3-audio` | AAC-only segments uploaded to object storage |
//! | `splitmux-filesink` | H.264 + AAC segments written to local files |
//! | `doubletee-s3` | uploaded segments plus a continuous local FLV |
//! | `faceblur` | decoded URI, faces blurred, uploaded segments plus FLV |

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::config::RecorderConfig;
use crate::element::PadRef;
use crate::error::Result;
use crate::format::MediaClass;
use crate::pipeline::controller::EosInjection;
use crate::pipeline::spec::{NodeSpec, PadEndpoint, PipelineSpec, SegmentSpec};

/// Segmenting sink name used by every segmenting recipe.
pub const SEGMENT_SINK: &str = "split_mux_sink";

/// Remote sink nested in the segmenting sink.
pub const REMOTE_SINK: &str = "gcs_sink";

/// Local sink nested in the segmenting sink.
pub const LOCAL_SINK: &str = "custom_file_sink";

const FACE_CASCADE: &str = "/usr/share/opencv4/haarcascades/haarcascade_frontalface_alt.xml";

/// A named topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Recipe {
    /// Test pattern encoded to H.264 and discarded.
    EncodeFakesink,
    /// Test pattern encoded and muxed into MP4, then discarded.
    Mp4muxFakesink,
    /// Video and audio encoded and muxed into MP4, then discarded.
    AvMp4muxFakesink,
    /// Video and audio segmented and uploaded.
    #[default]
    SplitmuxS3,
    /// Audio-only segments uploaded.
    SplitmuxS3Audio,
    /// Video and audio segmented into local files.
    SplitmuxFilesink,
    /// Uploaded segments and a local FLV from the same encoders.
    DoubleteeS3,
    /// A decoded URI with faces blurred, uploaded and recorded to FLV.
    Faceblur,
}

impl Recipe {
    /// Every recipe.
    pub const ALL: [Recipe; 8] = [
        Recipe::EncodeFakesink,
        Recipe::Mp4muxFakesink,
        Recipe::AvMp4muxFakesink,
        Recipe::SplitmuxS3,
        Recipe::SplitmuxS3Audio,
        Recipe::SplitmuxFilesink,
        Recipe::DoubleteeS3,
        Recipe::Faceblur,
    ];

    /// Kebab-case name.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Recipe::EncodeFakesink => "encode-fakesink",
            Recipe::Mp4muxFakesink => "mp4mux-fakesink",
            Recipe::AvMp4muxFakesink => "av-mp4mux-fakesink",
            Recipe::SplitmuxS3 => "splitmux-s3",
            Recipe::SplitmuxS3Audio => "splitmux-s3-audio",
            Recipe::SplitmuxFilesink => "splitmux-filesink",
            Recipe::DoubleteeS3 => "doubletee-s3",
            Recipe::Faceblur => "faceblur",
        }
    }

    /// Name of the segmenting sink, if the recipe has one.
    pub fn segment_sink(&self) -> Option<&'static str> {
        match self {
            Recipe::EncodeFakesink | Recipe::Mp4muxFakesink | Recipe::AvMp4muxFakesink => None,
            _ => Some(SEGMENT_SINK),
        }
    }

    /// True when segments go to object storage.
    pub fn uses_storage(&self) -> bool {
        matches!(
            self,
            Recipe::SplitmuxS3 | Recipe::SplitmuxS3Audio | Recipe::DoubleteeS3 | Recipe::Faceblur
        )
    }

    /// True when the input is a decoded URI rather than a live source.
    pub fn decodes_uri(&self) -> bool {
        matches!(self, Recipe::Faceblur)
    }

    /// Where end-of-stream goes unless configured otherwise.
    ///
    /// Single-branch segmenting recipes stop at the segmenting sink so the
    /// last fragment is finalized without waiting on the sources. Tee
    /// topologies need every branch drained.
    pub fn default_eos_target(&self) -> EosInjection {
        match self {
            Recipe::SplitmuxS3 | Recipe::SplitmuxS3Audio | Recipe::SplitmuxFilesink => {
                EosInjection::Node(SEGMENT_SINK.to_string())
            }
            _ => EosInjection::Pipeline,
        }
    }

    /// Expand into a pipeline description.
    pub fn spec(&self, config: &RecorderConfig) -> Result<PipelineSpec> {
        let name = self.as_str();
        let spec = match self {
            Recipe::EncodeFakesink => PipelineSpec::new(name)
                .with_node(NodeSpec::new("videotestsrc", "video_source"))
                .with_node(NodeSpec::new("queue", "video_queue"))
                .with_node(NodeSpec::new("videoconvert", "csp"))
                .with_node(x264(config))
                .with_node(NodeSpec::new("fakesink", "fake_sink").option("sync", true))
                .link_many(&["video_source", "video_queue", "csp", "x264_enc", "fake_sink"]),

            Recipe::Mp4muxFakesink => PipelineSpec::new(name)
                .with_node(NodeSpec::new("videotestsrc", "video_source"))
                .with_node(NodeSpec::new("queue", "video_queue"))
                .with_node(NodeSpec::new("videoconvert", "csp"))
                .with_node(x264(config))
                .with_node(NodeSpec::new("queue", "video_mp4_queue"))
                .with_node(NodeSpec::new("mp4mux", "mp4_mux"))
                .with_node(NodeSpec::new("fakesink", "fake_sink").option("sync", true))
                .link_many(&["video_source", "video_queue", "csp", "x264_enc", "video_mp4_queue"])
                .link_many(&["mp4_mux", "fake_sink"])
                .request_link(
                    PadEndpoint::fixed("video_mp4_queue", "src"),
                    PadEndpoint::request("mp4_mux", "video_%u"),
                ),

            Recipe::AvMp4muxFakesink => {
                let spec = PipelineSpec::new(name)
                    .with_node(NodeSpec::new("videotestsrc", "video_source"))
                    .with_node(NodeSpec::new("queue", "video_queue"))
                    .with_node(NodeSpec::new("videoconvert", "csp"))
                    .with_node(x264(config))
                    .with_node(NodeSpec::new("queue", "video_mp4_queue"))
                    .link_filtered("video_source", "video_queue", config.video_caps()?)
                    .link_many(&["video_queue", "csp", "x264_enc", "video_mp4_queue"]);
                audio_chain(spec, config, "avenc_aac")
                    .with_node(NodeSpec::new("queue", "audio_mp4_queue"))
                    .with_node(NodeSpec::new("mp4mux", "mp4_mux"))
                    .with_node(NodeSpec::new("fakesink", "fake_sink").option("sync", true))
                    .link_many(&["avenc_aac", "audio_mp4_queue"])
                    .link_many(&["mp4_mux", "fake_sink"])
                    .request_link(
                        PadEndpoint::fixed("video_mp4_queue", "src"),
                        PadEndpoint::request("mp4_mux", "video_%u"),
                    )
                    .request_link(
                        PadEndpoint::fixed("audio_mp4_queue", "src"),
                        PadEndpoint::request("mp4_mux", "audio_%u"),
                    )
            }

            Recipe::SplitmuxS3 => {
                let spec = audio_chain(video_chain(PipelineSpec::new(name), config)?, config, "avenc_aac");
                remote_segments(spec, config)
                    .request_link(
                        PadEndpoint::fixed("x264_enc", "src"),
                        PadEndpoint::request(SEGMENT_SINK, "video"),
                    )
                    .request_link(
                        PadEndpoint::fixed("avenc_aac", "src"),
                        PadEndpoint::request(SEGMENT_SINK, "audio_%u"),
                    )
            }

            Recipe::SplitmuxS3Audio => {
                let spec = audio_chain(PipelineSpec::new(name), config, "fdkaacenc");
                remote_segments(spec, config).request_link(
                    PadEndpoint::fixed("avenc_aac", "src"),
                    PadEndpoint::request(SEGMENT_SINK, "audio_%u"),
                )
            }

            Recipe::SplitmuxFilesink => {
                let spec = audio_chain(video_chain(PipelineSpec::new(name), config)?, config, "avenc_aac");
                spec.with_node(
                    NodeSpec::new("splitmuxsink", SEGMENT_SINK)
                        .option("send-keyframe-requests", true)
                        .option("location", config.output.location_pattern.as_str())
                        .option("sink", LOCAL_SINK),
                )
                .with_node(NodeSpec::new("filesink", LOCAL_SINK).option("sync", true))
                .with_segment(SegmentSpec {
                    sink_node: SEGMENT_SINK.to_string(),
                    nested_sink: Some(LOCAL_SINK.to_string()),
                    key_property: None,
                    naming: config.segment.clone(),
                })
                .request_link(
                    PadEndpoint::fixed("x264_enc", "src"),
                    PadEndpoint::request(SEGMENT_SINK, "video"),
                )
                .request_link(
                    PadEndpoint::fixed("avenc_aac", "src"),
                    PadEndpoint::request(SEGMENT_SINK, "audio_%u"),
                )
            }

            Recipe::DoubleteeS3 => {
                let spec = audio_chain(video_chain(PipelineSpec::new(name), config)?, config, "avenc_aac");
                tee_outputs(spec, config)
            }

            Recipe::Faceblur => {
                let spec = PipelineSpec::new(name)
                    .with_node(
                        NodeSpec::new("uridecodebin", "source")
                            .option("uri", config.output.source_uri.as_str()),
                    )
                    .with_node(NodeSpec::new("queue", "video_queue"))
                    .with_node(NodeSpec::new("videoconvert", "video_convert"))
                    .with_node(
                        NodeSpec::new("faceblur", "face_blur")
                            .option("scale-factor", 1.1)
                            .option("profile", FACE_CASCADE),
                    )
                    .with_node(NodeSpec::new("videoconvert", "video_convert2"))
                    .with_node(
                        NodeSpec::new("x264enc", "x264_enc")
                            .option("speed-preset", 2u32)
                            .option("pass", 5u32)
                            .option("bitrate", 1200u32)
                            .option("key-int-max", 30u32)
                            .option("quantizer", 22u32),
                    )
                    .with_node(NodeSpec::new("queue", "audio_queue"))
                    .with_node(NodeSpec::new("audioconvert", "audio_convert"))
                    .with_node(NodeSpec::new("audioresample", "audio_resample"))
                    .with_node(
                        NodeSpec::new("fdkaacenc", "avenc_aac")
                            .option("rate-control", 1u32)
                            .option("vbr-preset", 1u32),
                    )
                    .link_many(&["video_queue", "video_convert", "face_blur", "video_convert2", "x264_enc"])
                    .link_many(&["audio_queue", "audio_convert", "audio_resample"])
                    .link_filtered("audio_resample", "avenc_aac", config.encode_audio_caps())
                    .route("source", MediaClass::Video, PadRef::new("video_queue", "sink"))
                    .route("source", MediaClass::Audio, PadRef::new("audio_queue", "sink"));
                tee_outputs(spec, config)
            }
        };
        Ok(spec)
    }
}

impl fmt::Display for Recipe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Recipe {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Recipe::ALL
            .into_iter()
            .find(|r| r.as_str() == s)
            .ok_or_else(|| {
                let known: Vec<&str> = Recipe::ALL.iter().map(Recipe::as_str).collect();
                format!("unknown recipe '{}' (known: {})", s, known.join(", "))
            })
    }
}

// ============================================================================
// Shared fragments
// ============================================================================

fn x264(config: &RecorderConfig) -> NodeSpec {
    NodeSpec::new("x264enc", "x264_enc")
        .option("speed-preset", config.video.speed_preset)
        .option("bitrate", config.video.bitrate)
}

/// Test pattern, capture filter, queue, conversion and encoder ending at `x264_enc`.
fn video_chain(spec: PipelineSpec, config: &RecorderConfig) -> Result<PipelineSpec> {
    Ok(spec
        .with_node(NodeSpec::new("videotestsrc", "video_source"))
        .with_node(NodeSpec::new("queue", "video_queue"))
        .with_node(NodeSpec::new("videoconvert", "video_convert"))
        .with_node(x264(config))
        .link_filtered("video_source", "video_queue", config.video_caps()?)
        .link_many(&["video_queue", "video_convert", "x264_enc"]))
}

/// Test tone through capture and encode filters ending at `avenc_aac`.
///
/// The encoder node is always named `avenc_aac`; `encoder` picks its kind.
fn audio_chain(spec: PipelineSpec, config: &RecorderConfig, encoder: &str) -> PipelineSpec {
    spec.with_node(NodeSpec::new("audiotestsrc", "audio_source"))
        .with_node(NodeSpec::new("queue", "audio_queue"))
        .with_node(NodeSpec::new("audioconvert", "audio_convert"))
        .with_node(NodeSpec::new("audioresample", "audio_resample"))
        .with_node(NodeSpec::new(encoder, "avenc_aac").option("bitrate", config.audio.bitrate))
        .link_filtered("audio_source", "audio_queue", config.capture_audio_caps())
        .link_many(&["audio_queue", "audio_convert", "audio_resample"])
        .link_filtered("audio_resample", "avenc_aac", config.encode_audio_caps())
}

/// Segmenting sink with the remote sink nested inside it.
fn remote_segments(spec: PipelineSpec, config: &RecorderConfig) -> PipelineSpec {
    let storage = &config.storage;
    spec.with_node(
        NodeSpec::new("splitmuxsink", SEGMENT_SINK)
            .option("send-keyframe-requests", true)
            .option("sink", REMOTE_SINK),
    )
    .with_node(
        NodeSpec::new("awss3sink", REMOTE_SINK)
            .option("access-key", storage.access_key.as_str())
            .option("secret-access-key", storage.secret_access_key.as_str())
            .option("bucket", storage.bucket.as_str())
            .option("region", storage.region.as_str())
            .option("endpoint-uri", storage.endpoint_uri.as_str())
            .option("force-path-style", storage.force_path_style)
            .option("sync", true),
    )
    .with_segment(SegmentSpec {
        sink_node: SEGMENT_SINK.to_string(),
        nested_sink: Some(REMOTE_SINK.to_string()),
        key_property: Some(storage.key_property.clone()),
        naming: config.segment.clone(),
    })
}

/// Tees after both encoders feeding the uploaded segments and a local FLV.
fn tee_outputs(spec: PipelineSpec, config: &RecorderConfig) -> PipelineSpec {
    let spec = spec
        .with_node(NodeSpec::new("tee", "video_tee"))
        .with_node(NodeSpec::new("tee", "audio_tee"))
        .with_node(NodeSpec::new("queue", "video_flv_queue"))
        .with_node(NodeSpec::new("queue", "audio_flv_queue"))
        .with_node(
            NodeSpec::new("flvmux", "flv_mux")
                .option("streamable", true)
                .option("enforce-increasing-timestamps", false),
        )
        .with_node(
            NodeSpec::new("filesink", "flv_filesink")
                .option("location", config.output.flv_location.as_str())
                .option("sync", true),
        )
        .link_many(&["x264_enc", "video_tee"])
        .link_many(&["avenc_aac", "audio_tee"])
        .link_many(&["flv_mux", "flv_filesink"]);

    remote_segments(spec, config)
        .request_link(
            PadEndpoint::request("video_tee", "src_%u"),
            PadEndpoint::fixed("video_flv_queue", "sink"),
        )
        .request_link(
            PadEndpoint::request("video_tee", "src_%u"),
            PadEndpoint::request(SEGMENT_SINK, "video"),
        )
        .request_link(
            PadEndpoint::request("audio_tee", "src_%u"),
            PadEndpoint::fixed("audio_flv_queue", "sink"),
        )
        .request_link(
            PadEndpoint::request("audio_tee", "src_%u"),
            PadEndpoint::request(SEGMENT_SINK, "audio_%u"),
        )
        .request_link(
            PadEndpoint::fixed("video_flv_queue", "src"),
            PadEndpoint::request("flv_mux", "video"),
        )
        .request_link(
            PadEndpoint::fixed("audio_flv_queue", "src"),
            PadEndpoint::request("flv_mux", "audio"),
        )
}
