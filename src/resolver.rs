//! Input resolution: validates one input record, rejects illegal field
//! combinations, and fills the autodetectable fields.

use crate::autodetect::{Autodetect, Probe};
use crate::config::{BitrateConfig, Input, InputType, MediaKind};
use crate::error::{Error, Result};

pub struct InputResolver<'a> {
    detect: Autodetect<'a>,
    bitrate: &'a BitrateConfig,
}

impl<'a> InputResolver<'a> {
    pub fn new(probe: &'a dyn Probe, bitrate: &'a BitrateConfig) -> Self {
        Self {
            detect: Autodetect::new(probe, bitrate),
            bitrate,
        }
    }

    /// Fully populate `input` or fail with a typed error. After this returns
    /// `Ok`, the record is read-only.
    pub async fn resolve(&self, input: &mut Input) -> Result<()> {
        if !self.detect.is_present(input).await? {
            return Err(input_not_found(input));
        }

        if input.input_type != InputType::File {
            // Slice windows are only valid for plain file inputs.
            let reason = "only valid when input_type is \"file\"";
            if input.start_time.is_some() {
                return Err(Error::malformed("Input", "start_time", reason));
            }
            if input.end_time.is_some() {
                return Err(Error::malformed("Input", "end_time", reason));
            }
        }

        match input.media_type {
            MediaKind::Video => self.resolve_video(input).await,
            MediaKind::Audio => self.resolve_audio(input).await,
            MediaKind::Text => self.resolve_text(input).await,
        }
    }

    async fn resolve_video(&self, input: &mut Input) -> Result<()> {
        if !input.is_interlaced {
            input.is_interlaced = self.detect.is_interlaced(input).await?;
        }

        match input.frame_rate {
            Some(rate) if rate <= 0.0 => {
                return Err(Error::malformed(
                    "Input",
                    "frame_rate",
                    "must be positive",
                ));
            }
            Some(_) => {}
            None => {
                input.frame_rate = self.detect.frame_rate(input).await?;
                if input.frame_rate.is_none() {
                    return Err(autofill_failure(input, "frame_rate"));
                }
            }
        }

        match &input.resolution {
            Some(name) => {
                self.bitrate.resolution(name)?;
            }
            None => {
                input.resolution = self.detect.resolution_bucket(input).await?;
                if input.resolution.is_none() {
                    return Err(autofill_failure(input, "resolution"));
                }
            }
        }

        Ok(())
    }

    async fn resolve_audio(&self, input: &mut Input) -> Result<()> {
        if input.language.is_none() {
            input.language = Some(
                self.detect
                    .language(input)
                    .await?
                    .unwrap_or_else(|| "und".into()),
            );
        }

        match &input.channel_layout {
            Some(name) => {
                self.bitrate.channel_layout(name)?;
            }
            None => {
                input.channel_layout = self.detect.channel_layout_bucket(input).await?;
                if input.channel_layout.is_none() {
                    return Err(autofill_failure(input, "channel_layout"));
                }
            }
        }

        Ok(())
    }

    async fn resolve_text(&self, input: &mut Input) -> Result<()> {
        if input.input_type != InputType::File {
            return Err(Error::malformed(
                "Input",
                "input_type",
                format!(
                    "text streams are not supported in input_type \"{}\"",
                    input.input_type.as_str()
                ),
            ));
        }

        // Text is handed to the packager without processing, so none of the
        // transcoding fields apply.
        let reason = "not supported with media_type \"text\"";
        if input.start_time.is_some() {
            return Err(Error::malformed("Input", "start_time", reason));
        }
        if input.end_time.is_some() {
            return Err(Error::malformed("Input", "end_time", reason));
        }
        if !input.filters.is_empty() {
            return Err(Error::malformed("Input", "filters", reason));
        }

        if input.language.is_none() {
            input.language = Some(
                self.detect
                    .language(input)
                    .await?
                    .unwrap_or_else(|| "und".into()),
            );
        }

        Ok(())
    }
}

fn input_not_found(input: &Input) -> Error {
    Error::InputNotFound {
        record: "Input".into(),
        media_kind: input.media_type.as_str().into(),
        track_num: input.track_num,
        name: input.name.clone(),
    }
}

/// An autofill that came up empty: for probeable inputs this means the probe
/// output was unusable, surfaced the same way as a missing track; for
/// unprobeable inputs the field was simply required.
fn autofill_failure(input: &Input, field: &str) -> Error {
    if input.input_type == InputType::ExternalCommand {
        Error::missing("Input", field)
    } else {
        input_not_found(input)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autodetect::testing::FakeProbe;
    use crate::config::from_yaml_str;

    fn input(yaml: &str) -> Input {
        from_yaml_str("Input", yaml).unwrap()
    }

    #[tokio::test]
    async fn video_fields_are_autofilled() {
        let bitrate = BitrateConfig::default();
        let probe = FakeProbe::new(&[
            ("stream=index", "0"),
            ("stream=field_order", "progressive"),
            ("stream=avg_frame_rate", "30000/1001"),
            ("stream=width,height", "1280|720"),
        ]);
        let resolver = InputResolver::new(&probe, &bitrate);

        let mut video = input("name: in.mp4\nmedia_type: video\n");
        resolver.resolve(&mut video).await.unwrap();
        assert!(!video.is_interlaced);
        assert!((video.frame_rate.unwrap() - 29.97).abs() < 0.01);
        assert_eq!(video.resolution.as_deref(), Some("720p"));
    }

    #[tokio::test]
    async fn interlaced_video_halves_the_detected_rate() {
        let bitrate = BitrateConfig::default();
        let probe = FakeProbe::new(&[
            ("stream=index", "0"),
            ("stream=field_order", "tt"),
            ("stream=avg_frame_rate", "50/1"),
            ("stream=width,height", "1024|576"),
        ]);
        let resolver = InputResolver::new(&probe, &bitrate);

        let mut video = input("name: in.mp4\nmedia_type: video\n");
        resolver.resolve(&mut video).await.unwrap();
        assert!(video.is_interlaced);
        assert_eq!(video.frame_rate, Some(25.0));
        assert_eq!(video.resolution.as_deref(), Some("576p"));
    }

    #[tokio::test]
    async fn missing_track_is_input_not_found() {
        let bitrate = BitrateConfig::default();
        let probe = FakeProbe::new(&[]);
        let resolver = InputResolver::new(&probe, &bitrate);

        let mut video = input("name: in.mp4\nmedia_type: video\ntrack_num: 2\n");
        let err = resolver.resolve(&mut video).await.unwrap_err();
        assert!(matches!(err, Error::InputNotFound { track_num: 2, .. }), "got {err}");
    }

    #[tokio::test]
    async fn audio_language_defaults_to_und() {
        let bitrate = BitrateConfig::default();
        let probe = FakeProbe::new(&[("stream=index", "0"), ("stream=channels", "2")]);
        let resolver = InputResolver::new(&probe, &bitrate);

        let mut audio = input("name: in.mp4\nmedia_type: audio\n");
        resolver.resolve(&mut audio).await.unwrap();
        assert_eq!(audio.language.as_deref(), Some("und"));
        assert_eq!(audio.channel_layout.as_deref(), Some("stereo"));
    }

    #[tokio::test]
    async fn detected_audio_language_is_kept() {
        let bitrate = BitrateConfig::default();
        let probe = FakeProbe::new(&[
            ("stream=index", "0"),
            ("stream_tags=language", "eng"),
            ("stream=channels", "6"),
        ]);
        let resolver = InputResolver::new(&probe, &bitrate);

        let mut audio = input("name: in.mp4\nmedia_type: audio\n");
        resolver.resolve(&mut audio).await.unwrap();
        assert_eq!(audio.language.as_deref(), Some("eng"));
        assert_eq!(audio.channel_layout.as_deref(), Some("surround"));
    }

    #[tokio::test]
    async fn text_rejects_filters_and_slices() {
        let bitrate = BitrateConfig::default();
        let probe = FakeProbe::new(&[("stream=index", "0")]);
        let resolver = InputResolver::new(&probe, &bitrate);

        let mut with_filters =
            input("name: subs.vtt\nmedia_type: text\nfilters: [yadif]\n");
        let err = resolver.resolve(&mut with_filters).await.unwrap_err();
        assert!(err.to_string().contains("filters"));

        let mut with_slice =
            input("name: subs.vtt\nmedia_type: text\nstart_time: \"0:30\"\n");
        let err = resolver.resolve(&mut with_slice).await.unwrap_err();
        assert!(err.to_string().contains("start_time"));
    }

    #[tokio::test]
    async fn text_rejects_non_file_inputs() {
        let bitrate = BitrateConfig::default();
        let probe = FakeProbe::new(&[("stream=index", "0")]);
        let resolver = InputResolver::new(&probe, &bitrate);

        let mut text = input("name: subs.vtt\nmedia_type: text\ninput_type: looped_file\n");
        let err = resolver.resolve(&mut text).await.unwrap_err();
        assert!(err.to_string().contains("looped_file"));
    }

    #[tokio::test]
    async fn slice_window_rejected_for_non_file_inputs() {
        let bitrate = BitrateConfig::default();
        let probe = FakeProbe::new(&[("stream=index", "0")]);
        let resolver = InputResolver::new(&probe, &bitrate);

        let mut looped = input(
            "name: in.mp4\nmedia_type: video\ninput_type: looped_file\nstart_time: \"0:10\"\n",
        );
        let err = resolver.resolve(&mut looped).await.unwrap_err();
        assert!(err.to_string().contains("only valid when input_type is \"file\""));
    }

    #[tokio::test]
    async fn external_command_requires_explicit_video_fields() {
        let bitrate = BitrateConfig::default();
        let probe = FakeProbe::new(&[]);
        let resolver = InputResolver::new(&probe, &bitrate);

        let mut external = input(
            "name: \"generate frames\"\nmedia_type: video\ninput_type: external_command\n",
        );
        let err = resolver.resolve(&mut external).await.unwrap_err();
        assert!(matches!(err, Error::MissingRequiredField { ref field, .. } if field == "frame_rate"));

        let mut with_fields = input(
            "name: \"generate frames\"\nmedia_type: video\ninput_type: external_command\nframe_rate: 30\nresolution: 720p\n",
        );
        resolver.resolve(&mut with_fields).await.unwrap();
        assert_eq!(with_fields.resolution.as_deref(), Some("720p"));
    }

    #[tokio::test]
    async fn unknown_explicit_resolution_is_rejected() {
        let bitrate = BitrateConfig::default();
        let probe = FakeProbe::new(&[
            ("stream=index", "0"),
            ("stream=field_order", "progressive"),
            ("stream=avg_frame_rate", "30/1"),
        ]);
        let resolver = InputResolver::new(&probe, &bitrate);

        let mut video = input("name: in.mp4\nmedia_type: video\nresolution: 9000p\n");
        let err = resolver.resolve(&mut video).await.unwrap_err();
        assert!(err.to_string().contains("9000p"));
    }
}
