//! Recording configuration loaded from TOML.
//!
//! Every field has a default, so an empty file (or no file) gives the
//! standard recording setup: 15 s segments named `vm/{start}_{end}.mp4`,
//! I420 360x640 at 15 fps, audio captured at 48 kHz stereo and encoded at
//! 16 kHz mono, and uploads to an S3-compatible endpoint.
//!
//! ```toml
//! recipe = "splitmux-s3-audio"
//!
//! [segment]
//! prefix = "vm2/"
//! duration_ms = 15000
//!
//! [run]
//! grace_period_ms = 30000
//!
//! [storage]
//! bucket = "recordings"
//! region = "asia-southeast1"
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::clock::ClockTime;
use crate::error::{Error, Result};
use crate::format::{Caps, Framerate, PixelFormat};
use crate::pipeline::controller::{ControllerConfig, EosInjection};
use crate::recipes::Recipe;
use crate::segment::NamingConfig;

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RecorderConfig {
    /// Topology to build.
    pub recipe: Recipe,
    /// Segment naming and duration.
    pub segment: NamingConfig,
    /// Controller timing.
    pub run: RunSettings,
    /// Video capture and encoding.
    pub video: VideoSettings,
    /// Audio capture and encoding.
    pub audio: AudioSettings,
    /// Remote object storage.
    pub storage: StorageSettings,
    /// Local outputs and inputs.
    pub output: OutputSettings,
}

/// Where end-of-stream goes on a graceful stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EosTargetSetting {
    /// Whatever the recipe uses.
    #[default]
    Auto,
    /// Into every source.
    Pipeline,
    /// Into the segmenting sink.
    SegmentSink,
}

/// Controller timing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RunSettings {
    /// Longest single bus wait.
    pub poll_interval_ms: u64,
    /// Time allowed for end-of-stream to drain.
    pub grace_period_ms: u64,
    /// Stop gracefully after this long.
    pub stop_after_ms: Option<u64>,
    /// Where end-of-stream goes.
    pub eos_target: EosTargetSetting,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1_000,
            grace_period_ms: 60_000,
            stop_after_ms: None,
            eos_target: EosTargetSetting::Auto,
        }
    }
}

/// Video capture and encoding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct VideoSettings {
    /// Pixel layout of the capture filter.
    pub format: String,
    /// Frame width.
    pub width: u32,
    /// Frame height.
    pub height: u32,
    /// Frames per second.
    pub framerate: u32,
    /// Encoder speed preset.
    pub speed_preset: u32,
    /// Encoder bitrate in kbit/s.
    pub bitrate: u32,
}

impl Default for VideoSettings {
    fn default() -> Self {
        Self {
            format: "I420".to_string(),
            width: 360,
            height: 640,
            framerate: 15,
            speed_preset: 1,
            bitrate: 128,
        }
    }
}

/// Audio capture and encoding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AudioSettings {
    /// Capture sample rate.
    pub capture_rate: u32,
    /// Capture channel count.
    pub capture_channels: u16,
    /// Sample rate fed to the encoder.
    pub encode_rate: u32,
    /// Channel count fed to the encoder.
    pub encode_channels: u16,
    /// Encoder bitrate.
    pub bitrate: u32,
}

impl Default for AudioSettings {
    fn default() -> Self {
        Self {
            capture_rate: 48_000,
            capture_channels: 2,
            encode_rate: 16_000,
            encode_channels: 1,
            bitrate: 256,
        }
    }
}

/// S3-compatible storage options, set once on the remote sink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StorageSettings {
    /// Access key id.
    pub access_key: String,
    /// Secret key.
    pub secret_access_key: String,
    /// Bucket name.
    pub bucket: String,
    /// Region.
    pub region: String,
    /// Service endpoint.
    pub endpoint_uri: String,
    /// Use path-style addressing.
    pub force_path_style: bool,
    /// Option receiving each segment's object key.
    pub key_property: String,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            access_key: String::new(),
            secret_access_key: String::new(),
            bucket: String::new(),
            region: String::new(),
            endpoint_uri: "https://storage.googleapis.com".to_string(),
            force_path_style: true,
            key_property: "key".to_string(),
        }
    }
}

/// Local outputs and inputs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OutputSettings {
    /// Fragment location pattern for local segmenting.
    pub location_pattern: String,
    /// FLV recording path.
    pub flv_location: String,
    /// Input URI for decoding recipes.
    pub source_uri: String,
}

impl Default for OutputSettings {
    fn default() -> Self {
        Self {
            location_pattern: "chunk%02d.mp4".to_string(),
            flv_location: "output.flv".to_string(),
            source_uri: String::new(),
        }
    }
}

impl RecorderConfig {
    /// Load and validate a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&text)?;
        tracing::debug!("loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Parse and validate TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Check values that would make construction or the run meaningless.
    pub fn validate(&self) -> Result<()> {
        self.segment.validate()?;
        self.pixel_format()?;

        let v = &self.video;
        if v.width == 0 || v.height == 0 || v.framerate == 0 {
            return Err(Error::Config(format!(
                "invalid video geometry {}x{}@{}",
                v.width, v.height, v.framerate
            )));
        }
        let a = &self.audio;
        if a.capture_rate == 0 || a.encode_rate == 0 || a.capture_channels == 0 || a.encode_channels == 0 {
            return Err(Error::Config("audio rates and channel counts must be positive".into()));
        }
        if self.run.poll_interval_ms == 0 {
            return Err(Error::Config("poll interval must be positive".into()));
        }
        if self.run.stop_after_ms == Some(0) {
            return Err(Error::Config("stop_after_ms must be positive".into()));
        }
        if self.recipe.uses_storage() && self.storage.endpoint_uri.is_empty() {
            return Err(Error::Config(format!(
                "recipe '{}' uploads segments but storage.endpoint_uri is empty",
                self.recipe
            )));
        }
        if self.recipe.decodes_uri() && self.output.source_uri.is_empty() {
            return Err(Error::Config(format!(
                "recipe '{}' needs output.source_uri",
                self.recipe
            )));
        }
        Ok(())
    }

    /// Pixel layout of the capture filter.
    pub fn pixel_format(&self) -> Result<PixelFormat> {
        self.video.format.parse().map_err(Error::Config)
    }

    /// Capture filter between the video source and its queue.
    pub fn video_caps(&self) -> Result<Caps> {
        Ok(Caps::video_raw(
            self.pixel_format()?,
            self.video.width,
            self.video.height,
            Framerate::new(self.video.framerate, 1),
        ))
    }

    /// Capture filter between the audio source and its queue.
    pub fn capture_audio_caps(&self) -> Caps {
        Caps::audio_raw(self.audio.capture_rate, self.audio.capture_channels)
    }

    /// Filter between the resampler and the encoder.
    pub fn encode_audio_caps(&self) -> Caps {
        Caps::audio_raw(self.audio.encode_rate, self.audio.encode_channels)
    }

    /// Controller settings for this configuration.
    pub fn controller_config(&self) -> ControllerConfig {
        let eos_target = match self.run.eos_target {
            EosTargetSetting::Auto => self.recipe.default_eos_target(),
            EosTargetSetting::Pipeline => EosInjection::Pipeline,
            EosTargetSetting::SegmentSink => match self.recipe.segment_sink() {
                Some(sink) => EosInjection::Node(sink.to_string()),
                None => EosInjection::Pipeline,
            },
        };
        ControllerConfig {
            poll_interval: ClockTime::from_millis(self.run.poll_interval_ms),
            grace_period: ClockTime::from_millis(self.run.grace_period_ms),
            eos_target,
            stop_after: self.run.stop_after_ms.map(ClockTime::from_millis),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RecorderConfig::from_toml_str("").unwrap();
        assert_eq!(config, RecorderConfig::default());
        assert_eq!(config.segment.duration_ms, 15_000);
        assert_eq!(config.segment.prefix, "vm/");
        assert_eq!(
            config.video_caps().unwrap().to_string(),
            "video/x-raw,format=I420,width=360,height=640,framerate=15/1"
        );
        let controller = config.controller_config();
        assert_eq!(controller.grace_period, ClockTime::from_secs(60));
        assert_eq!(controller.poll_interval, ClockTime::from_secs(1));
    }

    #[test]
    fn test_overrides() {
        let config = RecorderConfig::from_toml_str(
            r#"
            recipe = "splitmux-s3-audio"

            [segment]
            prefix = "vm2/"

            [run]
            stop_after_ms = 40000
            eos_target = "pipeline"

            [audio]
            encode_rate = 22050
            "#,
        )
        .unwrap();
        assert_eq!(config.recipe, Recipe::SplitmuxS3Audio);
        assert_eq!(config.segment.prefix, "vm2/");
        assert_eq!(config.segment.extension, "mp4");
        assert_eq!(config.encode_audio_caps(), Caps::audio_raw(22050, 1));
        let controller = config.controller_config();
        assert_eq!(controller.stop_after, Some(ClockTime::from_secs(40)));
        assert_eq!(controller.eos_target, EosInjection::Pipeline);
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(matches!(
            RecorderConfig::from_toml_str("[video]\nformat = \"XYZ\""),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            RecorderConfig::from_toml_str("[segment]\nduration_ms = 0"),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            RecorderConfig::from_toml_str("recipe = \"faceblur\""),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            RecorderConfig::from_toml_str("unknown = 1"),
            Err(Error::Toml(_))
        ));
    }
}
