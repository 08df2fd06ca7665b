//! Autodetection of input stream properties, based on the probe binary.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::{BitrateConfig, Input, InputType};
use crate::error::Result;

/// Field orders that indicate interlaced video. Anything else (including an
/// absent value) is progressive.
const INTERLACED_FIELD_ORDERS: &[&str] = &["tt", "bb", "tb", "bt"];

/// A source of probe answers. The production implementation shells out to
/// ffprobe; tests substitute canned values.
#[async_trait]
pub trait Probe: Send + Sync {
    /// The textual value of one metadata entity for this input, or `None`
    /// when the input type cannot be probed, the probe failed, or it printed
    /// nothing. `entity` is a `-show_entries` expression.
    async fn probe(&self, input: &Input, entity: &str) -> Result<Option<String>>;
}

/// Probes inputs by invoking the ffprobe CLI.
pub struct FfprobeProber {
    ffprobe: PathBuf,
}

impl FfprobeProber {
    pub fn new(ffprobe: PathBuf) -> Self {
        Self { ffprobe }
    }
}

#[async_trait]
impl Probe for FfprobeProber {
    async fn probe(&self, input: &Input, entity: &str) -> Result<Option<String>> {
        if input.input_type == InputType::ExternalCommand {
            // Not supported for this type.
            return Ok(None);
        }

        let mut args: Vec<String> = vec![input.name.clone()];
        args.extend(input.input_args()?.iter().map(|s| s.to_string()));
        // Select this stream specifically, show only the needed metadata,
        // and print it in a compact form, which is easier to parse.
        args.push("-select_streams".into());
        args.push(input.stream_specifier());
        args.push("-show_entries".into());
        args.push(entity.into());
        args.push("-of".into());
        args.push("compact=p=0:nk=1".into());

        tracing::debug!("+ {} {}", self.ffprobe.display(), args.join(" "));

        let output = tokio::process::Command::new(&self.ffprobe)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .output()
            .await?;

        // Webcams on Linux seem to behave badly if the device is rapidly
        // opened and closed, so sleep for a second after a webcam probe.
        if input.input_type == InputType::Webcam {
            tokio::time::sleep(Duration::from_secs(1)).await;
        }

        if !output.status.success() {
            return Ok(None);
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(first_nonempty_line(&stdout).map(str::to_string))
    }
}

/// With certain container formats, the probe returns duplicate output with
/// blank lines in between; the first non-empty line is the value.
pub fn first_nonempty_line(s: &str) -> Option<&str> {
    s.lines().map(str::trim).find(|line| !line.is_empty())
}

/// Parse a frame-rate value like `24/1`, `30000/1001`, or `30000/1001|`.
/// The detected rate for interlaced content is the field rate, twice the
/// frame rate, so it is halved when `interlaced` is set.
pub fn parse_frame_rate(s: &str, interlaced: bool) -> Option<f64> {
    let s = s.trim().trim_end_matches('|');
    let mut pieces = s.split('/');
    let first: f64 = pieces.next()?.parse().ok()?;
    match pieces.next() {
        None => Some(first),
        Some(den) => {
            let den: f64 = den.parse().ok()?;
            if den == 0.0 {
                return None;
            }
            let rate = first / den;
            Some(if interlaced { rate / 2.0 } else { rate })
        }
    }
}

/// Parse a resolution value like `1920|1080` or `1920|1080|`.
pub fn parse_resolution(s: &str) -> Option<(u32, u32)> {
    let mut pieces = s.trim().trim_end_matches('|').split('|');
    let width = pieces.next()?.parse().ok()?;
    let height = pieces.next()?.parse().ok()?;
    Some((width, height))
}

/// Derived queries built on a [`Probe`].
pub struct Autodetect<'a> {
    probe: &'a dyn Probe,
    bitrate: &'a BitrateConfig,
}

impl<'a> Autodetect<'a> {
    pub fn new(probe: &'a dyn Probe, bitrate: &'a BitrateConfig) -> Self {
        Self { probe, bitrate }
    }

    /// Whether the requested track exists in the input. Unprobeable input
    /// types are assumed present.
    pub async fn is_present(&self, input: &Input) -> Result<bool> {
        if input.input_type == InputType::ExternalCommand {
            return Ok(true);
        }
        Ok(self.probe.probe(input, "stream=index").await?.is_some())
    }

    /// The language tag of an audio or text stream, if any.
    pub async fn language(&self, input: &Input) -> Result<Option<String>> {
        Ok(self
            .probe
            .probe(input, "stream_tags=language")
            .await?
            .filter(|lang| !lang.is_empty()))
    }

    /// Whether the input is interlaced, judging by its field order.
    pub async fn is_interlaced(&self, input: &Input) -> Result<bool> {
        let order = self.probe.probe(input, "stream=field_order").await?;
        Ok(order
            .as_deref()
            .is_some_and(|o| INTERLACED_FIELD_ORDERS.contains(&o)))
    }

    /// The input frame rate in frames per second. `is_interlaced` must be
    /// settled on the input before this is called.
    pub async fn frame_rate(&self, input: &Input) -> Result<Option<f64>> {
        let value = self.probe.probe(input, "stream=avg_frame_rate").await?;
        Ok(value.and_then(|v| parse_frame_rate(&v, input.is_interlaced)))
    }

    /// The first resolution bucket that bounds the input's measured width,
    /// height, and frame rate. `frame_rate` must be settled on the input.
    pub async fn resolution_bucket(&self, input: &Input) -> Result<Option<String>> {
        let value = self.probe.probe(input, "stream=width,height").await?;
        let Some((width, height)) = value.as_deref().and_then(parse_resolution) else {
            return Ok(None);
        };
        let frame_rate = input.frame_rate.unwrap_or(0.0);
        Ok(self
            .bitrate
            .classify_resolution(width, height, frame_rate)
            .map(str::to_string))
    }

    /// The first channel-layout bucket that bounds the input's measured
    /// channel count.
    pub async fn channel_layout_bucket(&self, input: &Input) -> Result<Option<String>> {
        let value = self.probe.probe(input, "stream=channels").await?;
        let Some(channels) = value.and_then(|v| v.trim().parse::<u32>().ok()) else {
            return Ok(None);
        };
        Ok(self.bitrate.classify_channels(channels).map(str::to_string))
    }
}


#[cfg(test)]
mod tests {
    use super::testing::FakeProbe;
    use super::*;
    use crate::config::MediaKind;

    fn video_input() -> Input {
        crate::config::from_yaml_str("Input", "name: in.mp4\nmedia_type: video\n").unwrap()
    }

    #[test]
    fn first_nonempty_line_skips_duplicates() {
        assert_eq!(first_nonempty_line("30000/1001\n\n30000/1001\n"), Some("30000/1001"));
        assert_eq!(first_nonempty_line("\n\nvalue\n"), Some("value"));
        assert_eq!(first_nonempty_line("\n \n"), None);
    }

    #[test]
    fn frame_rate_parsing() {
        assert_eq!(parse_frame_rate("24/1", false), Some(24.0));
        let ntsc = parse_frame_rate("30000/1001|", false).unwrap();
        assert!((ntsc - 29.97).abs() < 0.01);
        assert_eq!(parse_frame_rate("25", false), Some(25.0));
        assert_eq!(parse_frame_rate("30/0", false), None);
        assert_eq!(parse_frame_rate("garbage", false), None);
    }

    #[test]
    fn interlaced_frame_rate_is_halved() {
        assert_eq!(parse_frame_rate("60000/1001", true), Some(60000.0 / 1001.0 / 2.0));
    }

    #[test]
    fn resolution_parsing() {
        assert_eq!(parse_resolution("1920|1080"), Some((1920, 1080)));
        assert_eq!(parse_resolution("1920|1080|"), Some((1920, 1080)));
        assert_eq!(parse_resolution("1920"), None);
    }

    #[tokio::test]
    async fn interlace_detection_by_field_order() {
        let bitrate = BitrateConfig::default();
        for (order, expected) in [("tt", true), ("bb", true), ("tb", true), ("bt", true), ("progressive", false)] {
            let probe = FakeProbe::new(&[("stream=field_order", order)]);
            let detect = Autodetect::new(&probe, &bitrate);
            assert_eq!(detect.is_interlaced(&video_input()).await.unwrap(), expected, "order {order}");
        }
    }

    #[tokio::test]
    async fn resolution_bucket_classification() {
        let bitrate = BitrateConfig::default();
        let probe = FakeProbe::new(&[("stream=width,height", "1920|1080|")]);
        let detect = Autodetect::new(&probe, &bitrate);
        let mut input = video_input();
        input.frame_rate = Some(24.0);
        assert_eq!(
            detect.resolution_bucket(&input).await.unwrap().as_deref(),
            Some("1080p")
        );
        input.frame_rate = Some(60.0);
        assert_eq!(
            detect.resolution_bucket(&input).await.unwrap().as_deref(),
            Some("1080p-hfr")
        );
    }

    #[tokio::test]
    async fn channel_bucket_classification() {
        let bitrate = BitrateConfig::default();
        let probe = FakeProbe::new(&[("stream=channels", "6")]);
        let detect = Autodetect::new(&probe, &bitrate);
        let mut input = video_input();
        input.media_type = MediaKind::Audio;
        assert_eq!(
            detect.channel_layout_bucket(&input).await.unwrap().as_deref(),
            Some("surround")
        );
    }

    #[tokio::test]
    async fn external_command_is_assumed_present() {
        let bitrate = BitrateConfig::default();
        let probe = FakeProbe::new(&[]);
        let detect = Autodetect::new(&probe, &bitrate);
        let input: Input = crate::config::from_yaml_str(
            "Input",
            "name: \"gen video\"\nmedia_type: video\ninput_type: external_command\n",
        )
        .unwrap();
        assert!(detect.is_present(&input).await.unwrap());
    }

    #[tokio::test]
    async fn missing_track_is_absent() {
        let bitrate = BitrateConfig::default();
        let probe = FakeProbe::new(&[]);
        let detect = Autodetect::new(&probe, &bitrate);
        assert!(!detect.is_present(&video_input()).await.unwrap());
    }

    #[tokio::test]
    async fn empty_language_is_treated_as_absent() {
        let bitrate = BitrateConfig::default();
        let probe = FakeProbe::new(&[("stream_tags=language", "\n")]);
        let detect = Autodetect::new(&probe, &bitrate);
        assert_eq!(detect.language(&video_input()).await.unwrap(), None);
    }
}
