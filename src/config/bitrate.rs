//! Bitrate configuration: named resolution and channel-layout buckets.
//!
//! A bucket carries maxima (dimensions/frame rate, or channel count) and a
//! codec → bitrate-string table. Autodetection classifies an input into the
//! *first* bucket that bounds its measured values, so bucket declaration
//! order is semantic and the maps here preserve YAML insertion order.

use std::collections::BTreeMap;
use std::fmt;

use serde::de::{MapAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{Error, Result};

/// A bitrate in the transcoder's own notation, e.g. `500k` or `7.5M`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BitrateString(String);

impl BitrateString {
    pub fn new(s: impl Into<String>) -> Result<Self> {
        let s = s.into();
        let mut chars = s.chars();
        let starts_with_digit = chars.next().is_some_and(|c| c.is_ascii_digit());
        let ends_with_unit = matches!(s.chars().last(), Some('k' | 'K' | 'm' | 'M'));
        if !starts_with_digit || !ends_with_unit {
            return Err(Error::malformed(
                "BitrateConfig",
                "bitrates",
                format!("\"{s}\" is not a bitrate string (e.g. 500k or 7.5M)"),
            ));
        }
        Ok(Self(s))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BitrateString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for BitrateString {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        BitrateString::new(s).map_err(serde::de::Error::custom)
    }
}

/// Audio codecs the pipeline can encode with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioCodec {
    Aac,
    Opus,
    Ac3,
    Eac3,
}

impl AudioCodec {
    /// Codec name as it appears in configuration and filenames.
    pub fn as_str(&self) -> &'static str {
        match self {
            AudioCodec::Aac => "aac",
            AudioCodec::Opus => "opus",
            AudioCodec::Ac3 => "ac3",
            AudioCodec::Eac3 => "eac3",
        }
    }

    /// Encoder name accepted by the transcoder.
    ///
    /// The bare `opus` encoder is experimental in FFmpeg; `libopus` is the
    /// supported one.
    pub fn ffmpeg_codec_string(&self) -> &'static str {
        match self {
            AudioCodec::Opus => "libopus",
            other => other.as_str(),
        }
    }

    /// Container format for this codec when written to a pipe.
    pub fn output_format(&self) -> &'static str {
        match self {
            AudioCodec::Opus => "webm",
            _ => "mp4",
        }
    }
}

impl fmt::Display for AudioCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Base video codec names, without any hardware-acceleration prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoCodecName {
    H264,
    Vp9,
    Av1,
    Hevc,
}

impl VideoCodecName {
    pub fn as_str(&self) -> &'static str {
        match self {
            VideoCodecName::H264 => "h264",
            VideoCodecName::Vp9 => "vp9",
            VideoCodecName::Av1 => "av1",
            VideoCodecName::Hevc => "hevc",
        }
    }
}

impl fmt::Display for VideoCodecName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A video codec selection from the pipeline config.
///
/// The `hw:` prefix in configuration selects a hardware encoder; the prefix
/// is stripped at parse time and remembered in `hw`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct VideoCodec {
    pub name: VideoCodecName,
    pub hw: bool,
}

impl VideoCodec {
    pub fn software(name: VideoCodecName) -> Self {
        Self { name, hw: false }
    }

    pub fn is_hardware_accelerated(&self) -> bool {
        self.hw
    }

    /// Encoder name accepted by the transcoder, e.g. `h264` or `h264_vaapi`.
    pub fn ffmpeg_codec_string(&self, hwaccel_api: &str) -> String {
        if self.hw {
            format!("{}_{}", self.name, hwaccel_api)
        } else {
            self.name.as_str().to_string()
        }
    }

    /// Container format for this codec when written to a pipe.
    pub fn output_format(&self) -> &'static str {
        match self.name {
            VideoCodecName::Vp9 => "webm",
            _ => "mp4",
        }
    }
}

impl<'de> Deserialize<'de> for VideoCodec {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        let (hw, base) = match s.strip_prefix("hw:") {
            Some(rest) => (true, rest),
            None => (false, s.as_str()),
        };
        let name = match base {
            "h264" => VideoCodecName::H264,
            "vp9" => VideoCodecName::Vp9,
            "av1" => VideoCodecName::Av1,
            "hevc" => VideoCodecName::Hevc,
            other => {
                return Err(serde::de::Error::custom(format!(
                    "unrecognized video codec \"{other}\""
                )))
            }
        };
        Ok(VideoCodec { name, hw })
    }
}

/// A named audio channel-layout bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AudioChannelLayout {
    /// The maximum number of channels in this layout.
    pub max_channels: u32,
    /// Target bitrate per audio codec for this layout.
    pub bitrates: BTreeMap<AudioCodec, BitrateString>,
}

impl AudioChannelLayout {
    /// True if this bucket's channel count fits within `other`'s.
    pub fn fits_within(&self, other: &AudioChannelLayout) -> bool {
        self.max_channels <= other.max_channels
    }
}

fn unlimited_frame_rate() -> f64 {
    f64::INFINITY
}

/// A named video resolution bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VideoResolution {
    /// The maximum width in pixels for this named resolution.
    pub max_width: u32,
    /// The maximum height in pixels for this named resolution.
    pub max_height: u32,
    /// The maximum frame rate in frames per second; unlimited if omitted.
    #[serde(default = "unlimited_frame_rate")]
    pub max_frame_rate: f64,
    /// Target bitrate per video codec for this resolution.
    pub bitrates: BTreeMap<VideoCodecName, BitrateString>,
}

impl VideoResolution {
    /// True if this bucket is equal to or smaller than `other` in every
    /// dimension, which is the "no upscaling" ladder-inclusion rule.
    pub fn fits_within(&self, other: &VideoResolution) -> bool {
        self.max_width <= other.max_width
            && self.max_height <= other.max_height
            && self.max_frame_rate <= other.max_frame_rate
    }

    /// True if the measured input values are bounded by this bucket.
    pub fn bounds(&self, width: u32, height: u32, frame_rate: f64) -> bool {
        width <= self.max_width && height <= self.max_height && frame_rate <= self.max_frame_rate
    }
}

/// A map that preserves declaration order, because bucket classification is
/// first-fit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrderedMap<V>(Vec<(String, V)>);

impl<V> OrderedMap<V> {
    pub fn new(entries: Vec<(String, V)>) -> Self {
        Self(entries)
    }

    pub fn get(&self, key: &str) -> Option<&V> {
        self.0.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &V)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|(k, _)| k.as_str())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<'de, V: Deserialize<'de>> Deserialize<'de> for OrderedMap<V> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct OrderedVisitor<V>(std::marker::PhantomData<V>);

        impl<'de, V: Deserialize<'de>> Visitor<'de> for OrderedVisitor<V> {
            type Value = OrderedMap<V>;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a map of named buckets")
            }

            fn visit_map<A: MapAccess<'de>>(
                self,
                mut access: A,
            ) -> std::result::Result<Self::Value, A::Error> {
                let mut entries = Vec::with_capacity(access.size_hint().unwrap_or(0));
                while let Some((key, value)) = access.next_entry::<String, V>()? {
                    entries.push((key, value));
                }
                Ok(OrderedMap(entries))
            }
        }

        deserializer.deserialize_map(OrderedVisitor(std::marker::PhantomData))
    }
}

/// The full bucket configuration: defaults overlaid by the user's bitrate
/// config file, if any.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BitrateConfig {
    /// Named channel layouts, e.g. "stereo".
    #[serde(default = "default_channel_layouts")]
    pub audio_channel_layouts: OrderedMap<AudioChannelLayout>,
    /// Named resolutions, e.g. "1080p".
    #[serde(default = "default_video_resolutions")]
    pub video_resolutions: OrderedMap<VideoResolution>,
}

impl Default for BitrateConfig {
    fn default() -> Self {
        Self {
            audio_channel_layouts: default_channel_layouts(),
            video_resolutions: default_video_resolutions(),
        }
    }
}

impl BitrateConfig {
    /// First resolution bucket that bounds the measured input values.
    pub fn classify_resolution(&self, width: u32, height: u32, frame_rate: f64) -> Option<&str> {
        self.video_resolutions
            .iter()
            .find(|(_, bucket)| bucket.bounds(width, height, frame_rate))
            .map(|(name, _)| name)
    }

    /// First channel-layout bucket that bounds the measured channel count.
    pub fn classify_channels(&self, channels: u32) -> Option<&str> {
        self.audio_channel_layouts
            .iter()
            .find(|(_, bucket)| channels <= bucket.max_channels)
            .map(|(name, _)| name)
    }

    pub fn resolution(&self, name: &str) -> Result<&VideoResolution> {
        self.video_resolutions.get(name).ok_or_else(|| {
            Error::malformed(
                "BitrateConfig",
                "video_resolutions",
                format!("no resolution named \"{name}\""),
            )
        })
    }

    pub fn channel_layout(&self, name: &str) -> Result<&AudioChannelLayout> {
        self.audio_channel_layouts.get(name).ok_or_else(|| {
            Error::malformed(
                "BitrateConfig",
                "audio_channel_layouts",
                format!("no channel layout named \"{name}\""),
            )
        })
    }
}

fn layout(max_channels: u32, bitrates: &[(AudioCodec, &str)]) -> AudioChannelLayout {
    AudioChannelLayout {
        max_channels,
        bitrates: bitrates
            .iter()
            .map(|(codec, rate)| (*codec, BitrateString::new(*rate).expect("builtin bitrate")))
            .collect(),
    }
}

fn resolution(
    max_width: u32,
    max_height: u32,
    max_frame_rate: f64,
    bitrates: &[(VideoCodecName, &str)],
) -> VideoResolution {
    VideoResolution {
        max_width,
        max_height,
        max_frame_rate,
        bitrates: bitrates
            .iter()
            .map(|(codec, rate)| (*codec, BitrateString::new(*rate).expect("builtin bitrate")))
            .collect(),
    }
}

fn default_channel_layouts() -> OrderedMap<AudioChannelLayout> {
    use AudioCodec::*;
    OrderedMap::new(vec![
        (
            "mono".into(),
            layout(1, &[(Aac, "64k"), (Opus, "32k"), (Ac3, "96k"), (Eac3, "48k")]),
        ),
        (
            "stereo".into(),
            layout(2, &[(Aac, "128k"), (Opus, "64k"), (Ac3, "192k"), (Eac3, "96k")]),
        ),
        (
            "surround".into(),
            layout(6, &[(Aac, "256k"), (Opus, "128k"), (Ac3, "384k"), (Eac3, "192k")]),
        ),
    ])
}

fn default_video_resolutions() -> OrderedMap<VideoResolution> {
    use VideoCodecName::*;
    const UNLIMITED: f64 = f64::INFINITY;
    OrderedMap::new(vec![
        (
            "144p".into(),
            resolution(256, 144, 30.0, &[(H264, "108k"), (Vp9, "96k"), (Hevc, "96k"), (Av1, "72k")]),
        ),
        (
            "240p".into(),
            resolution(426, 240, 30.0, &[(H264, "242k"), (Vp9, "151k"), (Hevc, "151k"), (Av1, "114k")]),
        ),
        (
            "360p".into(),
            resolution(640, 360, 30.0, &[(H264, "400k"), (Vp9, "277k"), (Hevc, "277k"), (Av1, "210k")]),
        ),
        (
            "480p".into(),
            resolution(854, 480, 30.0, &[(H264, "1M"), (Vp9, "512k"), (Hevc, "512k"), (Av1, "389k")]),
        ),
        // PAL analog broadcast TV resolution.
        (
            "576p".into(),
            resolution(1024, 576, 30.0, &[(H264, "1.5M"), (Vp9, "768k"), (Hevc, "768k"), (Av1, "450k")]),
        ),
        (
            "720p".into(),
            resolution(1280, 720, 30.0, &[(H264, "2M"), (Vp9, "1M"), (Hevc, "1M"), (Av1, "512k")]),
        ),
        (
            "720p-hfr".into(),
            resolution(1280, 720, UNLIMITED, &[(H264, "3M"), (Vp9, "2M"), (Hevc, "2M"), (Av1, "778k")]),
        ),
        (
            "1080p".into(),
            resolution(1920, 1080, 30.0, &[(H264, "4M"), (Vp9, "2M"), (Hevc, "2M"), (Av1, "850k")]),
        ),
        (
            "1080p-hfr".into(),
            resolution(1920, 1080, UNLIMITED, &[(H264, "5M"), (Vp9, "3M"), (Hevc, "3M"), (Av1, "1M")]),
        ),
        (
            "1440p".into(),
            resolution(2560, 1440, 30.0, &[(H264, "9M"), (Vp9, "6M"), (Hevc, "6M"), (Av1, "3.5M")]),
        ),
        (
            "1440p-hfr".into(),
            resolution(2560, 1440, UNLIMITED, &[(H264, "14M"), (Vp9, "9M"), (Hevc, "9M"), (Av1, "5M")]),
        ),
        (
            "4k".into(),
            resolution(4096, 2160, 30.0, &[(H264, "17M"), (Vp9, "12M"), (Hevc, "12M"), (Av1, "6M")]),
        ),
        (
            "4k-hfr".into(),
            resolution(4096, 2160, UNLIMITED, &[(H264, "25M"), (Vp9, "18M"), (Hevc, "18M"), (Av1, "9M")]),
        ),
        (
            "8k".into(),
            resolution(8192, 4320, 30.0, &[(H264, "40M"), (Vp9, "24M"), (Hevc, "24M"), (Av1, "12M")]),
        ),
        (
            "8k-hfr".into(),
            resolution(8192, 4320, UNLIMITED, &[(H264, "60M"), (Vp9, "36M"), (Hevc, "36M"), (Av1, "18M")]),
        ),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bitrate_string_accepts_common_forms() {
        assert!(BitrateString::new("500k").is_ok());
        assert!(BitrateString::new("7.5M").is_ok());
        assert!(BitrateString::new("64K").is_ok());
    }

    #[test]
    fn bitrate_string_rejects_garbage() {
        assert!(BitrateString::new("fast").is_err());
        assert!(BitrateString::new("500").is_err());
        assert!(BitrateString::new("k500").is_err());
    }

    #[test]
    fn video_codec_parses_hw_prefix() {
        let codec: VideoCodec = serde_yaml::from_str("\"hw:h264\"").unwrap();
        assert!(codec.hw);
        assert_eq!(codec.name, VideoCodecName::H264);
        assert_eq!(codec.ffmpeg_codec_string("vaapi"), "h264_vaapi");

        let soft: VideoCodec = serde_yaml::from_str("vp9").unwrap();
        assert!(!soft.hw);
        assert_eq!(soft.ffmpeg_codec_string("vaapi"), "vp9");
    }

    #[test]
    fn opus_maps_to_libopus_and_webm() {
        assert_eq!(AudioCodec::Opus.ffmpeg_codec_string(), "libopus");
        assert_eq!(AudioCodec::Opus.output_format(), "webm");
        assert_eq!(AudioCodec::Aac.ffmpeg_codec_string(), "aac");
        assert_eq!(AudioCodec::Aac.output_format(), "mp4");
    }

    #[test]
    fn classification_is_first_fit_in_declaration_order() {
        let config = BitrateConfig::default();
        assert_eq!(config.classify_resolution(1920, 1080, 24.0), Some("1080p"));
        // 60 fps exceeds the 1080p cap, so the high-frame-rate bucket wins.
        assert_eq!(
            config.classify_resolution(1920, 1080, 60.0),
            Some("1080p-hfr")
        );
        assert_eq!(config.classify_resolution(640, 360, 30.0), Some("360p"));
        assert_eq!(config.classify_resolution(100_000, 100_000, 30.0), None);
    }

    #[test]
    fn channel_classification() {
        let config = BitrateConfig::default();
        assert_eq!(config.classify_channels(1), Some("mono"));
        assert_eq!(config.classify_channels(2), Some("stereo"));
        assert_eq!(config.classify_channels(6), Some("surround"));
        assert_eq!(config.classify_channels(8), None);
    }

    #[test]
    fn fits_within_is_the_no_upscale_rule() {
        let config = BitrateConfig::default();
        let input = config.resolution("1080p").unwrap();
        let smaller = config.resolution("720p").unwrap();
        let hfr = config.resolution("720p-hfr").unwrap();
        assert!(smaller.fits_within(input));
        assert!(!input.fits_within(smaller));
        // Unlimited frame rate does not fit within a capped input bucket.
        assert!(!hfr.fits_within(input));
    }

    #[test]
    fn user_config_preserves_declaration_order() {
        let yaml = r#"
video_resolutions:
  tiny:
    max_width: 320
    max_height: 180
    bitrates:
      h264: 100k
  small:
    max_width: 640
    max_height: 360
    bitrates:
      h264: 400k
"#;
        let config: BitrateConfig = serde_yaml::from_str(yaml).unwrap();
        let keys: Vec<&str> = config.video_resolutions.keys().collect();
        assert_eq!(keys, vec!["tiny", "small"]);
        assert_eq!(config.classify_resolution(320, 180, 24.0), Some("tiny"));
        // Layouts keep the defaults when the file does not mention them.
        assert_eq!(config.audio_channel_layouts.len(), 3);
    }

    #[test]
    fn default_ladder_is_complete() {
        let config = BitrateConfig::default();
        assert_eq!(config.video_resolutions.len(), 15);
        let res = config.resolution("720p").unwrap();
        assert_eq!(res.max_width, 1280);
        assert_eq!(
            res.bitrates.get(&VideoCodecName::H264).unwrap().as_str(),
            "2M"
        );
        let surround = config.channel_layout("surround").unwrap();
        assert_eq!(surround.max_channels, 6);
        assert_eq!(
            surround.bitrates.get(&AudioCodec::Aac).unwrap().as_str(),
            "256k"
        );
    }
}
