//! Pipeline configuration: streaming mode, codec ladders, segment and
//! live-window parameters, manifest formats, and encryption.

use serde::{Deserialize, Serialize};

use crate::config::bitrate::{AudioCodec, BitrateConfig, VideoCodec, VideoCodecName};
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamingMode {
    /// A live stream, which has no end.
    Live,
    /// A video-on-demand stream, which is finite.
    Vod,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ManifestFormat {
    Dash,
    Hls,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtectionScheme {
    /// AES-128-CTR mode.
    Cenc,
    /// AES-128-CBC mode with pattern encryption.
    Cbcs,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProtectionSystem {
    Widevine,
    FairPlay,
    PlayReady,
    Marlin,
    CommonSystem,
}

/// One UTCTiming element for the DASH MPD.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UtcTimingPair {
    pub scheme_id_uri: String,
    pub value: String,
}

/// One raw encryption key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawKeyConfig {
    /// An arbitrary string or a predefined DRM label like AUDIO, SD, HD.
    /// If not specified, indicates the default key and key_id.
    #[serde(default)]
    pub label: Option<String>,
    /// A key identifier as a 32-digit hex string.
    pub key_id: String,
    /// The encryption key as a 32-digit hex string.
    pub key: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EncryptionMode {
    #[default]
    Widevine,
    Raw,
}

// Credentials for the Widevine test account.
const WIDEVINE_UAT_URL: &str =
    "https://license.uat.widevine.com/cenc/getcontentkey/widevine_test";
const WIDEVINE_TEST_SIGNER: &str = "widevine_test";
const WIDEVINE_TEST_SIGNING_KEY: &str =
    "1ae8ccd0e7985cc0b6203a55855a1034afc252980e970ca90e5202689f947ab9";
const WIDEVINE_TEST_SIGNING_IV: &str = "d58ce954203b7c9a9a9d467f59839249";

fn default_clear_lead() -> u32 {
    10
}

/// The raw encryption section as written in YAML. [`EncryptionConfig::validated`]
/// turns it into the tagged [`Encryption`] union.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EncryptionConfig {
    /// If false, all other encryption settings are ignored.
    #[serde(default)]
    pub enable: bool,

    #[serde(default)]
    pub encryption_mode: EncryptionMode,

    /// Protection systems to generate signalling for.
    #[serde(default)]
    pub protection_systems: Vec<ProtectionSystem>,

    /// Concatenated PSSH boxes in hex. Raw mode only.
    #[serde(default)]
    pub pssh: Option<String>,

    /// IV in hex. Raw mode only; random if not specified.
    #[serde(default)]
    pub iv: Option<String>,

    /// Encryption keys. Raw mode only.
    #[serde(default)]
    pub keys: Vec<RawKeyConfig>,

    /// Content ID in hex; random if omitted. Widevine mode only.
    #[serde(default)]
    pub content_id: Option<String>,

    /// Key server URL. Widevine mode only; defaults to the UAT server.
    #[serde(default)]
    pub key_server_url: Option<String>,

    /// Signer name for key-server authentication. Widevine mode only.
    #[serde(default)]
    pub signer: Option<String>,

    /// Signing key in hex. Widevine mode only.
    #[serde(default)]
    pub signing_key: Option<String>,

    /// Signing IV in hex. Widevine mode only.
    #[serde(default)]
    pub signing_iv: Option<String>,

    #[serde(default = "default_protection_scheme")]
    pub protection_scheme: ProtectionScheme,

    /// Seconds of unencrypted media at the beginning of the stream.
    #[serde(default = "default_clear_lead")]
    pub clear_lead: u32,
}

fn default_protection_scheme() -> ProtectionScheme {
    ProtectionScheme::Cenc
}

impl Default for EncryptionConfig {
    fn default() -> Self {
        Self {
            enable: false,
            encryption_mode: EncryptionMode::default(),
            protection_systems: Vec::new(),
            pssh: None,
            iv: None,
            keys: Vec::new(),
            content_id: None,
            key_server_url: None,
            signer: None,
            signing_key: None,
            signing_iv: None,
            protection_scheme: default_protection_scheme(),
            clear_lead: default_clear_lead(),
        }
    }
}

/// Validated encryption settings.
#[derive(Debug, Clone, PartialEq)]
pub enum Encryption {
    Off,
    Widevine {
        key_server_url: String,
        content_id: String,
        signer: String,
        signing_key: String,
        signing_iv: String,
    },
    Raw {
        keys: Vec<RawKeyConfig>,
        iv: Option<String>,
        pssh: Option<String>,
    },
}

impl Encryption {
    pub fn is_enabled(&self) -> bool {
        !matches!(self, Encryption::Off)
    }
}

impl EncryptionConfig {
    /// Check mode-specific field combinations and produce the tagged union.
    pub fn validated(&self) -> Result<Encryption> {
        if !self.enable {
            return Ok(Encryption::Off);
        }

        match self.encryption_mode {
            EncryptionMode::Widevine => {
                let raw_only = [
                    ("keys", !self.keys.is_empty()),
                    ("pssh", self.pssh.is_some()),
                    ("iv", self.iv.is_some()),
                ];
                for (field, present) in raw_only {
                    if present {
                        return Err(Error::malformed(
                            "EncryptionConfig",
                            field,
                            "cannot be set when encryption_mode is \"widevine\"",
                        ));
                    }
                }
                Ok(Encryption::Widevine {
                    key_server_url: self
                        .key_server_url
                        .clone()
                        .unwrap_or_else(|| WIDEVINE_UAT_URL.into()),
                    content_id: self
                        .content_id
                        .clone()
                        .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string()),
                    signer: self
                        .signer
                        .clone()
                        .unwrap_or_else(|| WIDEVINE_TEST_SIGNER.into()),
                    signing_key: self
                        .signing_key
                        .clone()
                        .unwrap_or_else(|| WIDEVINE_TEST_SIGNING_KEY.into()),
                    signing_iv: self
                        .signing_iv
                        .clone()
                        .unwrap_or_else(|| WIDEVINE_TEST_SIGNING_IV.into()),
                })
            }
            EncryptionMode::Raw => {
                if self.keys.is_empty() {
                    return Err(Error::malformed(
                        "EncryptionConfig",
                        "keys",
                        "at least one key must be specified",
                    ));
                }
                Ok(Encryption::Raw {
                    keys: self.keys.clone(),
                    iv: self.iv.clone(),
                    pssh: self.pssh.clone(),
                })
            }
        }
    }
}

fn default_dash_output() -> String {
    "dash.mpd".into()
}

fn default_hls_output() -> String {
    "hls.m3u8".into()
}

fn default_segment_size() -> f64 {
    4.0
}

fn default_availability_window() -> u32 {
    300
}

fn default_presentation_delay() -> u32 {
    30
}

fn default_update_period() -> u32 {
    8
}

fn default_audio_codecs() -> Vec<AudioCodec> {
    vec![AudioCodec::Aac]
}

fn default_video_codecs() -> Vec<VideoCodec> {
    vec![VideoCodec::software(VideoCodecName::H264)]
}

fn default_manifest_format() -> Vec<ManifestFormat> {
    vec![ManifestFormat::Dash, ManifestFormat::Hls]
}

/// The entire pipeline config. Deeply immutable after [`PipelineConfig::finalize`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineConfig {
    pub streaming_mode: StreamingMode,

    /// Only errors are shown in quiet mode.
    #[serde(default)]
    pub quiet: bool,

    /// Write simple per-node log files to the current working directory.
    #[serde(default)]
    pub debug_logs: bool,

    /// The hardware acceleration API to use with `hw:` codecs. A
    /// per-platform default is chosen if omitted.
    #[serde(default)]
    pub hwaccel_api: Option<String>,

    /// Resolution bucket names to encode. Entries larger than the input are
    /// skipped, so one pipeline config can serve many inputs. Defaults to
    /// every bucket in the bitrate config.
    #[serde(default)]
    pub resolutions: Option<Vec<String>>,

    /// Channel-layout bucket names to encode. Defaults to every bucket in
    /// the bitrate config.
    #[serde(default)]
    pub channel_layouts: Option<Vec<String>>,

    #[serde(default = "default_audio_codecs")]
    pub audio_codecs: Vec<AudioCodec>,

    #[serde(default = "default_video_codecs")]
    pub video_codecs: Vec<VideoCodec>,

    /// Manifest formats to create; both by default.
    #[serde(default = "default_manifest_format")]
    pub manifest_format: Vec<ManifestFormat>,

    /// Output filename for the DASH manifest, if created.
    #[serde(default = "default_dash_output")]
    pub dash_output: String,

    /// Output filename for the HLS master playlist, if created.
    #[serde(default = "default_hls_output")]
    pub hls_output: String,

    /// Sub-folder for segment output, or blank for none.
    #[serde(default)]
    pub segment_folder: String,

    /// The length of each segment in seconds.
    #[serde(default = "default_segment_size")]
    pub segment_size: f64,

    /// Force each segment into a separate file. Must be true for live.
    #[serde(default)]
    pub segment_per_file: bool,

    /// Seconds a segment remains available.
    #[serde(default = "default_availability_window")]
    pub availability_window: u32,

    /// How far back from the live edge the player should be, in seconds.
    #[serde(default = "default_presentation_delay")]
    pub presentation_delay: u32,

    /// How often the player should fetch a new manifest, in seconds.
    #[serde(default = "default_update_period")]
    pub update_period: u32,

    #[serde(default)]
    pub encryption: EncryptionConfig,

    /// Low-latency chunked DASH delivery. Requires DASH output and at least
    /// one UTC timing source.
    #[serde(default)]
    pub low_latency_dash_mode: bool,

    /// UTCTiming pairs for the DASH MPD, in order of preference.
    #[serde(default)]
    pub utc_timings: Vec<UtcTimingPair>,
}

impl PipelineConfig {
    pub fn is_live(&self) -> bool {
        self.streaming_mode == StreamingMode::Live
    }

    pub fn has_format(&self, format: ManifestFormat) -> bool {
        self.manifest_format.contains(&format)
    }

    /// The microsecond fragment duration handed to the transcoder.
    pub fn segment_size_us(&self) -> i64 {
        (self.segment_size * 1e6) as i64
    }

    /// Fill platform defaults, default ladders, and check cross-field
    /// invariants. Called once, right after loading.
    pub fn finalize(&mut self, bitrate: &BitrateConfig) -> Result<()> {
        if self.hwaccel_api.is_none() {
            self.hwaccel_api = Some(
                match std::env::consts::OS {
                    "linux" => "vaapi",
                    "macos" => "videotoolbox",
                    _ => "",
                }
                .to_string(),
            );
        }

        if self.resolutions.is_none() {
            self.resolutions = Some(bitrate.video_resolutions.keys().map(String::from).collect());
        }
        if self.channel_layouts.is_none() {
            self.channel_layouts = Some(
                bitrate
                    .audio_channel_layouts
                    .keys()
                    .map(String::from)
                    .collect(),
            );
        }

        for name in self.resolutions.as_deref().unwrap_or_default() {
            if !bitrate.video_resolutions.contains_key(name) {
                return Err(Error::malformed(
                    "PipelineConfig",
                    "resolutions",
                    format!("no resolution named \"{name}\" in the bitrate config"),
                ));
            }
        }
        for name in self.channel_layouts.as_deref().unwrap_or_default() {
            if !bitrate.audio_channel_layouts.contains_key(name) {
                return Err(Error::malformed(
                    "PipelineConfig",
                    "channel_layouts",
                    format!("no channel layout named \"{name}\" in the bitrate config"),
                ));
            }
        }

        if self.is_live() && !self.segment_per_file {
            return Err(Error::malformed(
                "PipelineConfig",
                "segment_per_file",
                "must be true when streaming_mode is \"live\"",
            ));
        }

        if self.low_latency_dash_mode {
            if !self.has_format(ManifestFormat::Dash) {
                return Err(Error::malformed(
                    "PipelineConfig",
                    "low_latency_dash_mode",
                    "manifest_format must include dash",
                ));
            }
            if self.utc_timings.is_empty() {
                return Err(Error::malformed(
                    "PipelineConfig",
                    "utc_timings",
                    "must be set for low_latency_dash_mode",
                ));
            }
        }

        // Surface encryption-mode field conflicts now, before any node
        // derives arguments from them.
        self.encryption.validated()?;

        Ok(())
    }

    pub fn hwaccel_api(&self) -> &str {
        self.hwaccel_api.as_deref().unwrap_or("")
    }
}
