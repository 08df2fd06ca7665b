//! Output stream plans: one per (input, codec, bucket) combination.
//!
//! A plan owns its pipe, knows its encoder settings, and materialises the
//! output filename templates from a closed table of feature variables.

use std::collections::BTreeMap;
use std::path::Path;

use crate::config::{
    AudioChannelLayout, AudioCodec, Input, MediaKind, VideoCodec, VideoResolution,
};
use crate::config::bitrate::BitrateString;
use crate::error::{Error, Result};
use crate::pipe::PipePair;

/// The closed set of variables that may appear in filename templates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Feature {
    Language,
    Channels,
    Bitrate,
    Codec,
    Format,
    ResolutionName,
}

impl Feature {
    fn placeholder(&self) -> &'static str {
        match self {
            Feature::Language => "language",
            Feature::Channels => "channels",
            Feature::Bitrate => "bitrate",
            Feature::Codec => "codec",
            Feature::Format => "format",
            Feature::ResolutionName => "resolution_name",
        }
    }
}

/// Kind-specific payload of a plan.
#[derive(Debug, Clone)]
pub enum StreamDetail {
    Audio {
        codec: AudioCodec,
        layout_name: String,
        layout: AudioChannelLayout,
    },
    Video {
        codec: VideoCodec,
        resolution_name: String,
        resolution: VideoResolution,
    },
    Text,
}

/// A fully-derived plan for one output stream.
///
/// Owns exactly one [`PipePair`]; plans are never cloned, so no pipe is ever
/// shared between plans.
#[derive(Debug)]
pub struct OutputStreamPlan {
    /// Index of the input within its period's input list.
    pub input_index: usize,
    /// The resolved input this plan reads from.
    pub input: Input,
    detail: StreamDetail,
    pipe: PipePair,
    features: BTreeMap<Feature, String>,
    skip_transcoding: bool,
}

impl OutputStreamPlan {
    pub fn audio(
        input_index: usize,
        input: &Input,
        codec: AudioCodec,
        layout_name: &str,
        layout: &AudioChannelLayout,
        pipe_dir: &Path,
    ) -> Result<Self> {
        let bitrate = layout_bitrate(layout, codec, layout_name)?;
        let mut features = BTreeMap::new();
        features.insert(
            Feature::Language,
            input.language.clone().unwrap_or_else(|| "und".into()),
        );
        features.insert(Feature::Channels, layout.max_channels.to_string());
        features.insert(Feature::Bitrate, bitrate.to_string());
        features.insert(Feature::Codec, codec.as_str().into());
        features.insert(Feature::Format, codec.output_format().into());

        Ok(Self {
            input_index,
            input: input.clone(),
            detail: StreamDetail::Audio {
                codec,
                layout_name: layout_name.into(),
                layout: layout.clone(),
            },
            pipe: PipePair::new_ipc(pipe_dir, "")?,
            features,
            skip_transcoding: false,
        })
    }

    pub fn video(
        input_index: usize,
        input: &Input,
        codec: VideoCodec,
        resolution_name: &str,
        resolution: &VideoResolution,
        pipe_dir: &Path,
    ) -> Result<Self> {
        let bitrate = resolution_bitrate(resolution, codec, resolution_name)?;
        let mut features = BTreeMap::new();
        features.insert(Feature::ResolutionName, resolution_name.into());
        features.insert(Feature::Bitrate, bitrate.to_string());
        features.insert(Feature::Codec, codec.name.as_str().into());
        features.insert(Feature::Format, codec.output_format().into());

        Ok(Self {
            input_index,
            input: input.clone(),
            detail: StreamDetail::Video {
                codec,
                resolution_name: resolution_name.into(),
                resolution: resolution.clone(),
            },
            pipe: PipePair::new_ipc(pipe_dir, "")?,
            features,
            skip_transcoding: false,
        })
    }

    /// Text streams bypass the transcoder: the packager reads the input file
    /// directly.
    pub fn text(input_index: usize, input: &Input) -> Self {
        let mut features = BTreeMap::new();
        features.insert(
            Feature::Language,
            input.language.clone().unwrap_or_else(|| "und".into()),
        );
        features.insert(Feature::Format, "mp4".into());

        Self {
            input_index,
            input: input.clone(),
            detail: StreamDetail::Text,
            pipe: PipePair::from_file_source(input.name.clone()),
            features,
            skip_transcoding: true,
        }
    }

    pub fn media_kind(&self) -> MediaKind {
        match self.detail {
            StreamDetail::Audio { .. } => MediaKind::Audio,
            StreamDetail::Video { .. } => MediaKind::Video,
            StreamDetail::Text => MediaKind::Text,
        }
    }

    pub fn detail(&self) -> &StreamDetail {
        &self.detail
    }

    pub fn pipe(&self) -> &PipePair {
        &self.pipe
    }

    pub fn skipped_transcoding(&self) -> bool {
        self.skip_transcoding
    }

    pub fn is_hardware_accelerated(&self) -> bool {
        matches!(self.detail, StreamDetail::Video { codec, .. } if codec.is_hardware_accelerated())
    }

    /// The container format written to the pipe.
    pub fn output_format(&self) -> &'static str {
        match &self.detail {
            StreamDetail::Audio { codec, .. } => codec.output_format(),
            StreamDetail::Video { codec, .. } => codec.output_format(),
            StreamDetail::Text => "mp4",
        }
    }

    /// WebM output cannot appear in HLS playlists.
    pub fn is_dash_only(&self) -> bool {
        self.output_format() == "webm"
    }

    /// The target bitrate string, if this plan encodes.
    pub fn bitrate(&self) -> Option<&BitrateString> {
        match &self.detail {
            StreamDetail::Audio { codec, layout, .. } => layout.bitrates.get(codec),
            StreamDetail::Video {
                codec, resolution, ..
            } => resolution.bitrates.get(&codec.name),
            StreamDetail::Text => None,
        }
    }

    /// The codec name used for cross-period variant matching, without any
    /// hardware prefix.
    pub fn codec_name(&self) -> Option<&'static str> {
        match &self.detail {
            StreamDetail::Audio { codec, .. } => Some(codec.as_str()),
            StreamDetail::Video { codec, .. } => Some(codec.name.as_str()),
            StreamDetail::Text => None,
        }
    }

    /// Init-segment filename (used with `segment_per_file`).
    pub fn init_seg_file(&self) -> String {
        let template = match self.media_kind() {
            MediaKind::Audio => "audio_{language}_{channels}c_{bitrate}_{codec}_init.{format}",
            MediaKind::Video => "video_{resolution_name}_{bitrate}_{codec}_init.{format}",
            MediaKind::Text => "text_{language}_init.{format}",
        };
        self.interpolate(template)
    }

    /// Numbered media-segment template (used with `segment_per_file`).
    pub fn media_seg_file(&self) -> String {
        let template = match self.media_kind() {
            MediaKind::Audio => "audio_{language}_{channels}c_{bitrate}_{codec}_$Number$.{format}",
            MediaKind::Video => "video_{resolution_name}_{bitrate}_{codec}_$Number$.{format}",
            MediaKind::Text => "text_{language}_$Number$.{format}",
        };
        self.interpolate(template)
    }

    /// Single-file output name (used without `segment_per_file`).
    pub fn single_seg_file(&self) -> String {
        let template = match self.media_kind() {
            MediaKind::Audio => "audio_{language}_{channels}c_{bitrate}_{codec}.{format}",
            MediaKind::Video => "video_{resolution_name}_{bitrate}_{codec}.{format}",
            MediaKind::Text => "text_{language}.{format}",
        };
        self.interpolate(template)
    }

    fn interpolate(&self, template: &str) -> String {
        let mut result = template.to_string();
        for (feature, value) in &self.features {
            result = result.replace(&format!("{{{}}}", feature.placeholder()), value);
        }
        result
    }
}

fn layout_bitrate<'a>(
    layout: &'a AudioChannelLayout,
    codec: AudioCodec,
    layout_name: &str,
) -> Result<&'a BitrateString> {
    layout.bitrates.get(&codec).ok_or_else(|| {
        Error::malformed(
            "BitrateConfig",
            "audio_channel_layouts",
            format!("layout \"{layout_name}\" has no bitrate for codec \"{codec}\""),
        )
    })
}

fn resolution_bitrate<'a>(
    resolution: &'a VideoResolution,
    codec: VideoCodec,
    resolution_name: &str,
) -> Result<&'a BitrateString> {
    resolution.bitrates.get(&codec.name).ok_or_else(|| {
        Error::malformed(
            "BitrateConfig",
            "video_resolutions",
            format!(
                "resolution \"{resolution_name}\" has no bitrate for codec \"{}\"",
                codec.name
            ),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{from_yaml_str, BitrateConfig, VideoCodecName};

    fn audio_input() -> Input {
        from_yaml_str(
            "Input",
            "name: in.mp4\nmedia_type: audio\nlanguage: eng\nchannel_layout: surround\n",
        )
        .unwrap()
    }

    fn video_input() -> Input {
        from_yaml_str(
            "Input",
            "name: in.mp4\nmedia_type: video\nframe_rate: 30\nresolution: 720p\n",
        )
        .unwrap()
    }

    #[test]
    fn audio_templates_interpolate_all_features() {
        let bitrate = BitrateConfig::default();
        let dir = tempfile::tempdir().unwrap();
        let plan = OutputStreamPlan::audio(
            0,
            &audio_input(),
            AudioCodec::Aac,
            "surround",
            bitrate.channel_layout("surround").unwrap(),
            dir.path(),
        )
        .unwrap();

        assert_eq!(plan.init_seg_file(), "audio_eng_6c_256k_aac_init.mp4");
        assert_eq!(plan.media_seg_file(), "audio_eng_6c_256k_aac_$Number$.mp4");
        assert_eq!(plan.single_seg_file(), "audio_eng_6c_256k_aac.mp4");
        assert!(!plan.is_dash_only());
        assert_eq!(plan.bitrate().unwrap().as_str(), "256k");
    }

    #[test]
    fn video_templates_interpolate_all_features() {
        let bitrate = BitrateConfig::default();
        let dir = tempfile::tempdir().unwrap();
        let plan = OutputStreamPlan::video(
            0,
            &video_input(),
            VideoCodec::software(VideoCodecName::H264),
            "720p",
            bitrate.resolution("720p").unwrap(),
            dir.path(),
        )
        .unwrap();

        assert_eq!(plan.init_seg_file(), "video_720p_2M_h264_init.mp4");
        assert_eq!(plan.media_seg_file(), "video_720p_2M_h264_$Number$.mp4");
        assert_eq!(plan.single_seg_file(), "video_720p_2M_h264.mp4");
        assert!(!plan.is_hardware_accelerated());
    }

    #[test]
    fn opus_and_vp9_are_dash_only() {
        let bitrate = BitrateConfig::default();
        let dir = tempfile::tempdir().unwrap();

        let opus = OutputStreamPlan::audio(
            0,
            &audio_input(),
            AudioCodec::Opus,
            "stereo",
            bitrate.channel_layout("stereo").unwrap(),
            dir.path(),
        )
        .unwrap();
        assert!(opus.is_dash_only());
        assert_eq!(opus.single_seg_file(), "audio_eng_2c_64k_opus.webm");

        let vp9 = OutputStreamPlan::video(
            0,
            &video_input(),
            VideoCodec::software(VideoCodecName::Vp9),
            "720p",
            bitrate.resolution("720p").unwrap(),
            dir.path(),
        )
        .unwrap();
        assert!(vp9.is_dash_only());
    }

    #[test]
    fn text_plan_skips_transcoding_and_reads_the_file() {
        let input: Input = from_yaml_str(
            "Input",
            "name: subs.vtt\nmedia_type: text\nlanguage: en\n",
        )
        .unwrap();
        let plan = OutputStreamPlan::text(0, &input);
        assert!(plan.skipped_transcoding());
        assert_eq!(plan.pipe().reader_end(), Path::new("subs.vtt"));
        assert!(plan.pipe().writer_end().is_none());
        assert_eq!(plan.init_seg_file(), "text_en_init.mp4");
        assert_eq!(plan.single_seg_file(), "text_en.mp4");
    }

    #[test]
    fn hardware_codec_is_flagged() {
        let bitrate = BitrateConfig::default();
        let dir = tempfile::tempdir().unwrap();
        let hw = VideoCodec {
            name: VideoCodecName::H264,
            hw: true,
        };
        let plan = OutputStreamPlan::video(
            0,
            &video_input(),
            hw,
            "720p",
            bitrate.resolution("720p").unwrap(),
            dir.path(),
        )
        .unwrap();
        assert!(plan.is_hardware_accelerated());
        // The bitrate table is keyed by the base codec name.
        assert_eq!(plan.bitrate().unwrap().as_str(), "2M");
        assert_eq!(plan.single_seg_file(), "video_720p_2M_h264.mp4");
    }

    #[test]
    fn missing_bitrate_for_codec_is_an_error() {
        let bitrate: BitrateConfig = from_yaml_str(
            "BitrateConfig",
            "audio_channel_layouts:\n  stereo:\n    max_channels: 2\n    bitrates:\n      aac: 128k\n",
        )
        .unwrap();
        let dir = tempfile::tempdir().unwrap();
        let err = OutputStreamPlan::audio(
            0,
            &audio_input(),
            AudioCodec::Opus,
            "stereo",
            bitrate.channel_layout("stereo").unwrap(),
            dir.path(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("no bitrate for codec"));
    }
}
