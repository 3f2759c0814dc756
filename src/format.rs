//! Media format constraints (caps) for links and pad templates.
//!
//! Caps describe what flows over a link: a media type plus constrained
//! parameters. Linking checks that the source pad caps, an optional filter
//! and the sink pad caps have a non-empty intersection.
//!
//! - [`CapsValue<T>`]: A value that can be fixed, range, list, or any
//! - [`VideoFormatCaps`]: Raw video constraints (layout, size, frame rate)
//! - [`AudioFormatCaps`]: Raw audio constraints (rate, channels, sample format)
//! - [`Caps`]: Any of the above, or an encoded / container stream
//!
//! ```rust
//! use mediarig::format::{Caps, Framerate, PixelFormat};
//!
//! let filter = Caps::video_raw(PixelFormat::I420, 360, 640, Framerate::new(15, 1));
//! assert_eq!(
//!     filter.to_string(),
//!     "video/x-raw,format=I420,width=360,height=640,framerate=15/1"
//! );
//! assert!(filter.intersect(&Caps::any_video_raw()).is_some());
//! ```

use std::fmt;

// ============================================================================
// CapsValue - constraint value for negotiation
// ============================================================================

/// A value that can be fixed, range, list, or any.
///
/// ```rust
/// use mediarig::format::CapsValue;
///
/// let fixed: CapsValue<u32> = CapsValue::Fixed(48000);
/// let range: CapsValue<u32> = CapsValue::Range { min: 8000, max: 96000 };
/// assert_eq!(fixed.intersect(&range), Some(CapsValue::Fixed(48000)));
/// ```
#[derive(Clone, Debug, PartialEq, Default)]
pub enum CapsValue<T> {
    /// Exact value.
    Fixed(T),
    /// Range of acceptable values (inclusive).
    Range {
        /// Minimum acceptable value.
        min: T,
        /// Maximum acceptable value.
        max: T,
    },
    /// List of acceptable values, first is preferred.
    List(Vec<T>),
    /// Unconstrained.
    #[default]
    Any,
}

impl<T: Clone + Ord> CapsValue<T> {
    /// Check if a value is accepted by this constraint.
    pub fn accepts(&self, value: &T) -> bool {
        match self {
            Self::Fixed(v) => v == value,
            Self::Range { min, max } => value >= min && value <= max,
            Self::List(values) => values.contains(value),
            Self::Any => true,
        }
    }

    /// Intersect two constraints. Returns `None` if there's no overlap.
    pub fn intersect(&self, other: &Self) -> Option<Self> {
        match (self, other) {
            (Self::Any, other) => Some(other.clone()),
            (self_, Self::Any) => Some(self_.clone()),

            (Self::Fixed(a), Self::Fixed(b)) => (a == b).then(|| Self::Fixed(a.clone())),

            (Self::Fixed(v), Self::Range { min, max })
            | (Self::Range { min, max }, Self::Fixed(v)) => {
                (v >= min && v <= max).then(|| Self::Fixed(v.clone()))
            }

            (Self::Fixed(v), Self::List(list)) | (Self::List(list), Self::Fixed(v)) => {
                list.contains(v).then(|| Self::Fixed(v.clone()))
            }

            (
                Self::Range {
                    min: min1,
                    max: max1,
                },
                Self::Range {
                    min: min2,
                    max: max2,
                },
            ) => {
                let new_min = min1.max(min2);
                let new_max = max1.min(max2);
                match new_min.cmp(new_max) {
                    std::cmp::Ordering::Greater => None,
                    std::cmp::Ordering::Equal => Some(Self::Fixed(new_min.clone())),
                    std::cmp::Ordering::Less => Some(Self::Range {
                        min: new_min.clone(),
                        max: new_max.clone(),
                    }),
                }
            }

            (Self::Range { min, max }, Self::List(list))
            | (Self::List(list), Self::Range { min, max }) => Self::collapse(
                list.iter()
                    .filter(|v| *v >= min && *v <= max)
                    .cloned()
                    .collect(),
            ),

            // Order follows the first list.
            (Self::List(list1), Self::List(list2)) => Self::collapse(
                list1
                    .iter()
                    .filter(|v| list2.contains(v))
                    .cloned()
                    .collect(),
            ),
        }
    }

    fn collapse(mut values: Vec<T>) -> Option<Self> {
        match values.len() {
            0 => None,
            1 => values.pop().map(Self::Fixed),
            _ => Some(Self::List(values)),
        }
    }

    /// Choose a single value: first in list, min in range, `None` for `Any`.
    pub fn fixate(&self) -> Option<T> {
        match self {
            Self::Fixed(v) => Some(v.clone()),
            Self::Range { min, .. } => Some(min.clone()),
            Self::List(values) => values.first().cloned(),
            Self::Any => None,
        }
    }

    /// Check if this is a fixed value.
    #[inline]
    pub fn is_fixed(&self) -> bool {
        matches!(self, Self::Fixed(_))
    }

    /// Check if this accepts any value.
    #[inline]
    pub fn is_any(&self) -> bool {
        matches!(self, Self::Any)
    }

    /// Get the fixed value if this is fixed.
    #[inline]
    pub fn as_fixed(&self) -> Option<&T> {
        match self {
            Self::Fixed(v) => Some(v),
            _ => None,
        }
    }
}

impl<T: Clone + Ord> From<T> for CapsValue<T> {
    fn from(value: T) -> Self {
        Self::Fixed(value)
    }
}

impl<T: Clone + Ord> From<std::ops::RangeInclusive<T>> for CapsValue<T> {
    fn from(range: std::ops::RangeInclusive<T>) -> Self {
        let (min, max) = range.into_inner();
        Self::Range { min, max }
    }
}

impl<T: fmt::Display> CapsValue<T> {
    /// Write as `key=value`, `key=[ min, max ]` or `key={ a, b }`. `Any` writes nothing.
    fn write_field(&self, f: &mut fmt::Formatter<'_>, key: &str) -> fmt::Result {
        match self {
            Self::Fixed(v) => write!(f, ",{key}={v}"),
            Self::Range { min, max } => write!(f, ",{key}=[ {min}, {max} ]"),
            Self::List(values) => {
                write!(f, ",{key}={{ ")?;
                for (i, v) in values.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{v}")?;
                }
                write!(f, " }}")
            }
            Self::Any => Ok(()),
        }
    }
}

// ============================================================================
// Video
// ============================================================================

/// Raw pixel layouts.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub enum PixelFormat {
    /// YUV 4:2:0 planar.
    #[default]
    I420,
    /// YUV 4:2:0 semi-planar.
    Nv12,
    /// YUV 4:2:2 packed (Y0 U Y1 V).
    Yuy2,
    /// RGB packed, 24 bits/pixel.
    Rgb,
    /// RGBA packed, 32 bits/pixel.
    Rgba,
    /// BGRx packed, 32 bits/pixel.
    Bgrx,
}

impl PixelFormat {
    /// Name used in caps strings.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::I420 => "I420",
            Self::Nv12 => "NV12",
            Self::Yuy2 => "YUY2",
            Self::Rgb => "RGB",
            Self::Rgba => "RGBA",
            Self::Bgrx => "BGRx",
        }
    }

    /// All layouts.
    pub const ALL: [PixelFormat; 6] = [
        Self::I420,
        Self::Nv12,
        Self::Yuy2,
        Self::Rgb,
        Self::Rgba,
        Self::Bgrx,
    ];
}

impl std::str::FromStr for PixelFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|f| f.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown pixel format '{}'", s))
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Frame rate as numerator/denominator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Framerate {
    /// Numerator (frames).
    pub num: u32,
    /// Denominator (time units).
    pub den: u32,
}

impl Framerate {
    /// Create a new framerate.
    pub const fn new(num: u32, den: u32) -> Self {
        Self { num, den }
    }

    /// 15 fps.
    pub const FPS_15: Self = Self::new(15, 1);
    /// 30 fps.
    pub const FPS_30: Self = Self::new(30, 1);
}

impl Default for Framerate {
    fn default() -> Self {
        Self::FPS_30
    }
}

impl PartialOrd for Framerate {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Framerate {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // a/b vs c/d => a*d vs c*b
        let lhs = (self.num as u64) * (other.den as u64);
        let rhs = (other.num as u64) * (self.den as u64);
        lhs.cmp(&rhs).then(self.den.cmp(&other.den))
    }
}

impl fmt::Display for Framerate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.num, self.den)
    }
}

/// Raw video constraints.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct VideoFormatCaps {
    /// Pixel layout constraint.
    pub pixel_format: CapsValue<PixelFormat>,
    /// Width constraint.
    pub width: CapsValue<u32>,
    /// Height constraint.
    pub height: CapsValue<u32>,
    /// Framerate constraint.
    pub framerate: CapsValue<Framerate>,
}

impl VideoFormatCaps {
    /// Caps that accept any raw video.
    pub fn any() -> Self {
        Self::default()
    }

    /// Fully fixed raw video caps.
    pub fn fixed(pixel_format: PixelFormat, width: u32, height: u32, framerate: Framerate) -> Self {
        Self {
            pixel_format: CapsValue::Fixed(pixel_format),
            width: CapsValue::Fixed(width),
            height: CapsValue::Fixed(height),
            framerate: CapsValue::Fixed(framerate),
        }
    }

    /// Restrict the pixel layout to a list.
    pub fn with_formats(mut self, formats: Vec<PixelFormat>) -> Self {
        self.pixel_format = CapsValue::List(formats);
        self
    }

    /// Intersect with another video caps.
    pub fn intersect(&self, other: &Self) -> Option<Self> {
        Some(Self {
            pixel_format: self.pixel_format.intersect(&other.pixel_format)?,
            width: self.width.intersect(&other.width)?,
            height: self.height.intersect(&other.height)?,
            framerate: self.framerate.intersect(&other.framerate)?,
        })
    }

    /// Check if fully fixed.
    pub fn is_fixed(&self) -> bool {
        self.width.is_fixed()
            && self.height.is_fixed()
            && self.pixel_format.is_fixed()
            && self.framerate.is_fixed()
    }
}

/// Encoded video streams.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum VideoCodec {
    /// H.264 / AVC.
    H264,
    /// H.265 / HEVC.
    H265,
    /// VP8.
    Vp8,
}

impl VideoCodec {
    /// Media type string.
    pub const fn media_type(&self) -> &'static str {
        match self {
            Self::H264 => "video/x-h264",
            Self::H265 => "video/x-h265",
            Self::Vp8 => "video/x-vp8",
        }
    }
}

// ============================================================================
// Audio
// ============================================================================

/// Audio sample formats.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub enum SampleFormat {
    /// Signed 16-bit little endian.
    #[default]
    S16Le,
    /// Signed 32-bit little endian.
    S32Le,
    /// 32-bit float little endian.
    F32Le,
}

impl fmt::Display for SampleFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::S16Le => "S16LE",
            Self::S32Le => "S32LE",
            Self::F32Le => "F32LE",
        })
    }
}

/// Raw audio constraints.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct AudioFormatCaps {
    /// Sample format constraint.
    pub sample_format: CapsValue<SampleFormat>,
    /// Sample rate constraint.
    pub sample_rate: CapsValue<u32>,
    /// Channel count constraint.
    pub channels: CapsValue<u16>,
}

impl AudioFormatCaps {
    /// Caps that accept any raw audio.
    pub fn any() -> Self {
        Self::default()
    }

    /// Fix the sample rate.
    pub fn with_rate(mut self, rate: u32) -> Self {
        self.sample_rate = CapsValue::Fixed(rate);
        self
    }

    /// Fix the channel count.
    pub fn with_channels(mut self, channels: u16) -> Self {
        self.channels = CapsValue::Fixed(channels);
        self
    }

    /// Fix the sample format.
    pub fn with_format(mut self, format: SampleFormat) -> Self {
        self.sample_format = CapsValue::Fixed(format);
        self
    }

    /// Intersect with another audio caps.
    pub fn intersect(&self, other: &Self) -> Option<Self> {
        Some(Self {
            sample_format: self.sample_format.intersect(&other.sample_format)?,
            sample_rate: self.sample_rate.intersect(&other.sample_rate)?,
            channels: self.channels.intersect(&other.channels)?,
        })
    }
}

/// Encoded audio streams.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AudioCodec {
    /// AAC (MPEG-4 audio).
    Aac,
    /// Opus.
    Opus,
    /// MP3.
    Mp3,
}

impl AudioCodec {
    /// Media type string including the distinguishing field.
    pub const fn media_type(&self) -> &'static str {
        match self {
            Self::Aac => "audio/mpeg,mpegversion=4",
            Self::Opus => "audio/x-opus",
            Self::Mp3 => "audio/mpeg,mpegversion=1,layer=3",
        }
    }
}

/// Multiplexed container streams.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ContainerFormat {
    /// ISO MP4.
    Mp4,
    /// Flash video.
    Flv,
    /// MPEG transport stream.
    MpegTs,
}

impl ContainerFormat {
    /// Media type string.
    pub const fn media_type(&self) -> &'static str {
        match self {
            Self::Mp4 => "video/quicktime,variant=iso",
            Self::Flv => "video/x-flv",
            Self::MpegTs => "video/mpegts",
        }
    }
}

// ============================================================================
// Caps
// ============================================================================

/// Broad media class of a stream, used to route dynamically added pads.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MediaClass {
    /// Video stream.
    Video,
    /// Audio stream.
    Audio,
}

impl fmt::Display for MediaClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Video => "video",
            Self::Audio => "audio",
        })
    }
}

/// Stream constraints on a pad template or a link.
#[derive(Clone, Debug, PartialEq, Default)]
pub enum Caps {
    /// Anything.
    #[default]
    Any,
    /// Raw video.
    VideoRaw(VideoFormatCaps),
    /// Raw audio.
    AudioRaw(AudioFormatCaps),
    /// Encoded video.
    VideoEncoded(VideoCodec),
    /// Encoded audio.
    AudioEncoded(AudioCodec),
    /// Multiplexed container bytes.
    Container(ContainerFormat),
}

impl Caps {
    /// Fixed raw video caps.
    pub fn video_raw(pixel_format: PixelFormat, width: u32, height: u32, framerate: Framerate) -> Self {
        Self::VideoRaw(VideoFormatCaps::fixed(pixel_format, width, height, framerate))
    }

    /// Raw audio caps fixed on rate and channel count.
    pub fn audio_raw(rate: u32, channels: u16) -> Self {
        Self::AudioRaw(AudioFormatCaps::any().with_rate(rate).with_channels(channels))
    }

    /// Any raw video.
    pub fn any_video_raw() -> Self {
        Self::VideoRaw(VideoFormatCaps::any())
    }

    /// Any raw audio.
    pub fn any_audio_raw() -> Self {
        Self::AudioRaw(AudioFormatCaps::any())
    }

    /// Intersect two caps. `None` means the link is not possible.
    pub fn intersect(&self, other: &Self) -> Option<Self> {
        match (self, other) {
            (Self::Any, other) => Some(other.clone()),
            (self_, Self::Any) => Some(self_.clone()),
            (Self::VideoRaw(a), Self::VideoRaw(b)) => a.intersect(b).map(Self::VideoRaw),
            (Self::AudioRaw(a), Self::AudioRaw(b)) => a.intersect(b).map(Self::AudioRaw),
            (Self::VideoEncoded(a), Self::VideoEncoded(b)) if a == b => Some(self.clone()),
            (Self::AudioEncoded(a), Self::AudioEncoded(b)) if a == b => Some(self.clone()),
            (Self::Container(a), Self::Container(b)) if a == b => Some(self.clone()),
            _ => None,
        }
    }

    /// Intersect with an optional filter.
    pub fn intersect_filtered(&self, filter: Option<&Caps>, other: &Self) -> Option<Self> {
        let narrowed = match filter {
            Some(filter) => self.intersect(filter)?,
            None => self.clone(),
        };
        narrowed.intersect(other)
    }

    /// Media class for raw and encoded streams. Containers and `Any` have none.
    pub fn media_class(&self) -> Option<MediaClass> {
        match self {
            Self::VideoRaw(_) | Self::VideoEncoded(_) => Some(MediaClass::Video),
            Self::AudioRaw(_) | Self::AudioEncoded(_) => Some(MediaClass::Audio),
            Self::Container(_) | Self::Any => None,
        }
    }

    /// True for raw (decoded) video or audio.
    pub fn is_raw(&self) -> bool {
        matches!(self, Self::VideoRaw(_) | Self::AudioRaw(_))
    }
}

impl fmt::Display for Caps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Any => f.write_str("ANY"),
            Self::VideoRaw(v) => {
                f.write_str("video/x-raw")?;
                v.pixel_format.write_field(f, "format")?;
                v.width.write_field(f, "width")?;
                v.height.write_field(f, "height")?;
                v.framerate.write_field(f, "framerate")
            }
            Self::AudioRaw(a) => {
                f.write_str("audio/x-raw")?;
                a.sample_format.write_field(f, "format")?;
                a.sample_rate.write_field(f, "rate")?;
                a.channels.write_field(f, "channels")
            }
            Self::VideoEncoded(c) => f.write_str(c.media_type()),
            Self::AudioEncoded(c) => f.write_str(c.media_type()),
            Self::Container(c) => f.write_str(c.media_type()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_caps_value_intersect_fixed_range() {
        let fixed = CapsValue::Fixed(48000u32);
        let range: CapsValue<u32> = (8000..=96000).into();
        assert_eq!(fixed.intersect(&range), Some(CapsValue::Fixed(48000)));

        let outside = CapsValue::Fixed(192000u32);
        assert_eq!(outside.intersect(&range), None);
    }

    #[test]
    fn test_caps_value_intersect_range_range() {
        let a: CapsValue<u32> = (100..=500).into();
        let b: CapsValue<u32> = (300..=800).into();
        assert_eq!(a.intersect(&b), Some(CapsValue::Range { min: 300, max: 500 }));

        let c: CapsValue<u32> = (500..=900).into();
        assert_eq!(a.intersect(&c), Some(CapsValue::Fixed(500)));

        let d: CapsValue<u32> = (600..=900).into();
        assert_eq!(a.intersect(&d), None);
    }

    #[test]
    fn test_caps_value_intersect_list_list() {
        let a = CapsValue::List(vec![1u32, 2, 3]);
        let b = CapsValue::List(vec![3, 2, 9]);
        assert_eq!(a.intersect(&b), Some(CapsValue::List(vec![2, 3])));

        let c = CapsValue::List(vec![3, 9]);
        assert_eq!(a.intersect(&c), Some(CapsValue::Fixed(3)));
    }

    #[test]
    fn test_caps_value_fixate() {
        assert_eq!(CapsValue::List(vec![7u32, 3]).fixate(), Some(7));
        assert_eq!(CapsValue::Range { min: 2u32, max: 5 }.fixate(), Some(2));
        assert_eq!(CapsValue::<u32>::Any.fixate(), None);
        assert!(CapsValue::Fixed(1u32).accepts(&1));
    }

    #[test]
    fn test_framerate_ord() {
        assert!(Framerate::new(30000, 1001) < Framerate::FPS_30);
        assert!(Framerate::FPS_15 < Framerate::FPS_30);
        assert_ne!(Framerate::new(30, 2), Framerate::FPS_15);
    }

    #[test]
    fn test_video_caps_intersect() {
        let filter = Caps::video_raw(PixelFormat::I420, 360, 640, Framerate::FPS_15);
        let src = Caps::VideoRaw(
            VideoFormatCaps::any().with_formats(vec![PixelFormat::I420, PixelFormat::Nv12]),
        );
        let result = src.intersect(&filter);
        assert_eq!(result, Some(filter.clone()));

        let rgb_only = Caps::VideoRaw(VideoFormatCaps::any().with_formats(vec![PixelFormat::Rgb]));
        assert_eq!(rgb_only.intersect(&filter), None);
    }

    #[test]
    fn test_media_type_mismatch() {
        assert_eq!(Caps::any_video_raw().intersect(&Caps::any_audio_raw()), None);
        assert_eq!(
            Caps::VideoEncoded(VideoCodec::H264).intersect(&Caps::VideoEncoded(VideoCodec::Vp8)),
            None
        );
        assert!(Caps::Any.intersect(&Caps::Container(ContainerFormat::Mp4)).is_some());
    }

    #[test]
    fn test_intersect_filtered() {
        let filter = Caps::audio_raw(16000, 1);
        let src = Caps::any_audio_raw();
        let sink = Caps::AudioRaw(AudioFormatCaps::any().with_rate(48000));
        assert_eq!(src.intersect_filtered(Some(&filter), &sink), None);
        assert!(src.intersect_filtered(Some(&filter), &Caps::any_audio_raw()).is_some());
        assert!(src.intersect_filtered(None, &sink).is_some());
    }

    #[test]
    fn test_caps_display() {
        assert_eq!(Caps::audio_raw(48000, 2).to_string(), "audio/x-raw,rate=48000,channels=2");
        assert_eq!(Caps::any_video_raw().to_string(), "video/x-raw");
        let list = Caps::VideoRaw(
            VideoFormatCaps::any().with_formats(vec![PixelFormat::I420, PixelFormat::Nv12]),
        );
        assert_eq!(list.to_string(), "video/x-raw,format={ I420, NV12 }");
        assert_eq!(
            Caps::AudioEncoded(AudioCodec::Aac).to_string(),
            "audio/mpeg,mpegversion=4"
        );
    }

    #[test]
    fn test_media_class() {
        assert_eq!(Caps::any_video_raw().media_class(), Some(MediaClass::Video));
        assert_eq!(Caps::AudioEncoded(AudioCodec::Aac).media_class(), Some(MediaClass::Audio));
        assert_eq!(Caps::Container(ContainerFormat::Flv).media_class(), None);
        assert!(!Caps::VideoEncoded(VideoCodec::H264).is_raw());
    }
}
