//! Input configuration: the declarative description of media tracks.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// How an input's bytes are obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputType {
    /// A track from a file. Usable only with VOD.
    #[default]
    File,
    /// A track from a file, looped forever by the transcoder. Live only.
    LoopedFile,
    /// A webcam device; `name` is the device path (e.g. `/dev/video0`).
    Webcam,
    /// A microphone device; `name` is the device path or name.
    Microphone,
    /// An external command that generates a stream of audio or video. The
    /// command must write to the path in the environment variable
    /// `SHAKA_STREAMER_EXTERNAL_COMMAND_OUTPUT`.
    ExternalCommand,
}

impl InputType {
    pub fn as_str(&self) -> &'static str {
        match self {
            InputType::File => "file",
            InputType::LoopedFile => "looped_file",
            InputType::Webcam => "webcam",
            InputType::Microphone => "microphone",
            InputType::ExternalCommand => "external_command",
        }
    }
}

/// The kind of media a track carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Audio,
    Video,
    Text,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
            MediaKind::Text => "text",
        }
    }
}

/// A single input stream.
///
/// Built from configuration; the resolver fills the autodetectable fields,
/// after which the record is read-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Input {
    /// The type of the input.
    #[serde(default)]
    pub input_type: InputType,

    /// Path, device, or command, depending on `input_type`.
    pub name: String,

    /// Extra input arguments needed by the transcoder to understand the
    /// input, split on whitespace.
    #[serde(default)]
    pub extra_input_args: String,

    /// The media kind of the input stream.
    pub media_type: MediaKind,

    /// Frame rate in frames per second. Video only. Autodetected for
    /// probeable input types; required for the rest.
    #[serde(default)]
    pub frame_rate: Option<f64>,

    /// Name of the input resolution bucket (e.g. "1080p"). Video only.
    #[serde(default)]
    pub resolution: Option<String>,

    /// Name of the input channel-layout bucket (e.g. "stereo"). Audio only.
    #[serde(default)]
    pub channel_layout: Option<String>,

    /// Track number, local to the media kind, starting at 0.
    #[serde(default)]
    pub track_num: u32,

    /// True if the input video is interlaced; it will be deinterlaced during
    /// transcoding.
    #[serde(default)]
    pub is_interlaced: bool,

    /// Language of an audio or text stream.
    #[serde(default)]
    pub language: Option<String>,

    /// Start of the slice of the input to use. VOD files only.
    #[serde(default)]
    pub start_time: Option<String>,

    /// End of the slice of the input to use. VOD files only.
    #[serde(default)]
    pub end_time: Option<String>,

    /// Custom DRM label for the encryption key applied to this stream.
    /// Raw encryption mode only.
    #[serde(default)]
    pub drm_label: Option<String>,

    /// If set, the first N seconds of the stream are left unencrypted.
    #[serde(default)]
    pub skip_encryption: Option<u32>,

    /// Transcoding filter strings to apply to this input.
    #[serde(default)]
    pub filters: Vec<String>,
}

impl Input {
    /// The transcoder stream specifier for this input, e.g. `v:0` for the
    /// first video track or `s:2` for the third text track. Track numbers
    /// are per media kind, not overall.
    pub fn stream_specifier(&self) -> String {
        let kind = match self.media_type {
            MediaKind::Video => 'v',
            MediaKind::Audio => 'a',
            MediaKind::Text => 's',
        };
        format!("{}:{}", kind, self.track_num)
    }

    /// Hard-coded input arguments for device input types, so users don't
    /// need to know the underlying capture options. These must be understood
    /// by the probe binary as well as the transcoder.
    pub fn input_args(&self) -> Result<Vec<&'static str>> {
        let args = match self.input_type {
            InputType::Webcam => match std::env::consts::OS {
                "linux" => vec!["-f", "video4linux2"],
                "macos" => vec!["-f", "avfoundation", "-framerate", "30"],
                "windows" => vec!["-f", "dshow"],
                other => {
                    return Err(Error::malformed(
                        "Input",
                        "input_type",
                        format!("webcam input is not supported on {other}"),
                    ))
                }
            },
            InputType::Microphone => match std::env::consts::OS {
                "linux" => vec!["-f", "pulse"],
                "macos" => vec!["-f", "avfoundation"],
                "windows" => vec!["-f", "dshow"],
                other => {
                    return Err(Error::malformed(
                        "Input",
                        "input_type",
                        format!("microphone input is not supported on {other}"),
                    ))
                }
            },
            _ => vec![],
        };
        Ok(args)
    }

    /// Extra user-provided input args, split for the command line.
    pub fn extra_input_args_split(&self) -> Vec<String> {
        self.extra_input_args
            .split_whitespace()
            .map(str::to_string)
            .collect()
    }

    /// Point this input at a pipe that now carries its contents, used for
    /// external-command inputs once their feeder pipe exists.
    pub fn reset_name(&mut self, pipe_path: String) {
        self.name = pipe_path;
    }
}

/// One period in a multi-period input list.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SinglePeriod {
    pub inputs: Vec<Input>,
}

/// The entire input config: exactly one of `inputs` (single period) or
/// `multiperiod_inputs_list`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InputConfig {
    #[serde(default)]
    pub inputs: Option<Vec<Input>>,

    #[serde(default)]
    pub multiperiod_inputs_list: Option<Vec<SinglePeriod>>,
}

impl InputConfig {
    /// Enforce the exclusive-or between the two input list forms and return
    /// the periods in order.
    pub fn into_periods(self) -> Result<Vec<Vec<Input>>> {
        match (self.inputs, self.multiperiod_inputs_list) {
            (Some(_), Some(_)) => Err(Error::ConflictingFields {
                record: "InputConfig".into(),
                field1: "inputs".into(),
                field2: "multiperiod_inputs_list".into(),
            }),
            (None, None) => Err(Error::MissingRequiredExclusiveFields {
                record: "InputConfig".into(),
                field1: "inputs".into(),
                field2: "multiperiod_inputs_list".into(),
            }),
            (Some(inputs), None) => {
                if inputs.is_empty() {
                    return Err(Error::malformed("InputConfig", "inputs", "list is empty"));
                }
                Ok(vec![inputs])
            }
            (None, Some(periods)) => {
                if periods.is_empty() {
                    return Err(Error::malformed(
                        "InputConfig",
                        "multiperiod_inputs_list",
                        "list is empty",
                    ));
                }
                Ok(periods.into_iter().map(|p| p.inputs).collect())
            }
        }
    }

    /// True when the config describes more than one period.
    pub fn is_multiperiod(&self) -> bool {
        self.multiperiod_inputs_list.is_some()
    }
}
