//! Derives and supervises the transcoder subprocess for one period.
//!
//! One command reads every input of the period and writes one fragmented
//! MP4 (or WebM) per non-skipped output plan to that plan's pipe writer end.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::{InputType, MediaKind, PipelineConfig, StreamingMode};
use crate::error::{Error, Result};
use crate::nodes::{PipelineNode, ProcessHandle, ProcessStatus};
use crate::stream::{OutputStreamPlan, StreamDetail};
use crate::config::VideoCodecName;

pub struct TranscoderNode {
    label: String,
    pipeline: Arc<PipelineConfig>,
    plans: Arc<Vec<OutputStreamPlan>>,
    inputs: Vec<crate::config::Input>,
    index: usize,
    ffmpeg: PathBuf,
    handle: Option<ProcessHandle>,
}

impl TranscoderNode {
    pub fn new(
        inputs: Vec<crate::config::Input>,
        pipeline: Arc<PipelineConfig>,
        plans: Arc<Vec<OutputStreamPlan>>,
        index: usize,
        ffmpeg: PathBuf,
    ) -> Self {
        Self {
            label: format!("TranscoderNode-{index}"),
            pipeline,
            plans,
            inputs,
            index,
            ffmpeg,
            handle: None,
        }
    }

    /// Derive the full command line. Exposed for tests.
    pub fn build_command(&self) -> Result<Vec<String>> {
        let mut args: Vec<String> = vec![
            self.ffmpeg.to_string_lossy().into_owned(),
            // Do not prompt for output files that already exist. The named
            // pipes were created in advance, so they definitely exist, and a
            // prompt would block the transcoder waiting for input.
            "-y".into(),
        ];

        if self.pipeline.quiet {
            // Suppresses all messages except errors. Without this, a status
            // line is printed showing progress and transcoding speed.
            args.extend(["-loglevel".into(), "error".into()]);
        }

        let any_vaapi_output = self.plans.iter().any(OutputStreamPlan::is_hardware_accelerated)
            && self.pipeline.hwaccel_api() == "vaapi";
        if any_vaapi_output {
            args.extend(["-vaapi_device".into(), "/dev/dri/renderD128".into()]);
        }

        for input in &self.inputs {
            // Hard-coded input args for this input type, then any extra args
            // the config supplies for it.
            args.extend(input.input_args()?.iter().map(|s| s.to_string()));
            args.extend(input.extra_input_args_split());

            if input.input_type == InputType::LoopedFile {
                args.extend([
                    // Loop the input forever.
                    "-stream_loop".into(),
                    "-1".into(),
                    // Read input in real time; don't go above 1x speed.
                    "-re".into(),
                ]);
            }

            if self.pipeline.streaming_mode == StreamingMode::Live {
                // A larger input queue than the default of 8 packets, so a
                // slow encoder doesn't drop frames from a real-time source.
                args.extend(["-thread_queue_size".into(), "200".into()]);
            }

            if let Some(start) = &input.start_time {
                args.extend(["-ss".into(), start.clone()]);
            }
            if let Some(end) = &input.end_time {
                args.extend(["-to".into(), end.clone()]);
            }

            // The input name always comes after the applicable input args.
            args.extend(["-i".into(), input.name.clone()]);
        }

        for (index, input) in self.inputs.iter().enumerate() {
            for plan in self.plans.iter() {
                if plan.input_index != index || plan.skipped_transcoding() {
                    continue;
                }

                // Map args must be repeated for each output file.
                args.extend([
                    "-map".into(),
                    format!("{}:{}", index, input.stream_specifier()),
                ]);

                match plan.media_kind() {
                    MediaKind::Audio => args.extend(self.encode_audio(plan)?),
                    MediaKind::Video => args.extend(self.encode_video(plan)?),
                    MediaKind::Text => args.extend(["-f".into(), "webvtt".into()]),
                }

                let writer = plan.pipe().writer_end().ok_or_else(|| {
                    Error::Internal(format!("{}: plan has no pipe writer end", self.label))
                })?;
                args.push(writer.to_string_lossy().into_owned());
            }
        }

        Ok(args)
    }

    fn encode_audio(&self, plan: &OutputStreamPlan) -> Result<Vec<String>> {
        let StreamDetail::Audio { codec, layout, .. } = plan.detail() else {
            return Err(Error::Internal("audio encode on non-audio plan".into()));
        };

        let mut filters: Vec<String> = Vec::new();
        let mut args: Vec<String> = vec![
            // No video encoding for audio.
            "-vn".into(),
            "-ac".into(),
            layout.max_channels.to_string(),
        ];

        if layout.max_channels == 6 {
            // The packager cannot handle the default 5.1(side) layout in
            // fragmented MP4; force the plain 5.1 channel map.
            filters.push("channelmap=channel_layout=5.1".into());
        }

        filters.extend(plan.input.filters.iter().cloned());

        let bitrate = plan
            .bitrate()
            .ok_or_else(|| Error::Internal("audio plan without bitrate".into()))?;

        args.extend([
            "-c:a".into(),
            codec.ffmpeg_codec_string().into(),
            "-b:a".into(),
            bitrate.to_string(),
            // MP4 into the pipe, for all codecs.
            "-f".into(),
            "mp4".into(),
            // An explicit fragment duration keeps any single MP4 box small
            // enough for the packager to consume from a pipe. Microseconds.
            "-frag_duration".into(),
            self.pipeline.segment_size_us().to_string(),
            // Opus in MP4 is considered experimental.
            "-strict".into(),
            "experimental".into(),
        ]);

        if !filters.is_empty() {
            args.extend(["-af".into(), filters.join(",")]);
        }

        Ok(args)
    }

    fn encode_video(&self, plan: &OutputStreamPlan) -> Result<Vec<String>> {
        let StreamDetail::Video {
            codec, resolution, ..
        } = plan.detail()
        else {
            return Err(Error::Internal("video encode on non-video plan".into()));
        };

        let mut filters: Vec<String> = Vec::new();
        let mut args: Vec<String> = Vec::new();

        let input_rate = plan.input.frame_rate.unwrap_or(0.0);

        if plan.input.is_interlaced {
            filters.push("pp=fd".into());
        }

        // One -r only: the minimum of the input rate and the bucket cap,
        // emitted when deinterlacing forces a rate or the cap is below the
        // input rate.
        let capped = resolution.max_frame_rate < input_rate;
        if plan.input.is_interlaced || capped {
            let rate = if capped {
                resolution.max_frame_rate
            } else {
                input_rate
            };
            args.extend(["-r".into(), format_rate(rate)]);
        }

        filters.extend(plan.input.filters.iter().cloned());

        let hwaccel_api = self.pipeline.hwaccel_api();

        // -2 in the scale filters picks a width that keeps the aspect ratio.
        if plan.is_hardware_accelerated() && hwaccel_api == "vaapi" {
            filters.push("format=nv12".into());
            filters.push("hwupload".into());
            filters.push(format!("scale_vaapi=-2:{}", resolution.max_height));
        } else {
            filters.push(format!("scale=-2:{}", resolution.max_height));
        }

        // Pin the sample aspect ratio to 1:1; rounding-derived SAR values
        // produce off-by-one widths in HLS playlists and break some players.
        filters.push("setsar=1:1".into());

        let name = codec.name;
        let software = !plan.is_hardware_accelerated();

        // These presets are specifically recognized by the software encoder.
        if matches!(name, VideoCodecName::H264 | VideoCodecName::Hevc) && software {
            if self.pipeline.streaming_mode == StreamingMode::Live {
                args.extend(["-preset".into(), "ultrafast".into()]);
            } else {
                args.extend(["-preset".into(), "slow".into()]);
                args.extend(["-flags".into(), "+loop".into()]);
            }
        }

        if name == VideoCodecName::H264 {
            // "high" for HD and up, "main" for everything else.
            let profile = if resolution.max_height >= 720 {
                "high"
            } else {
                "main"
            };
            args.extend(["-profile:v".into(), profile.into()]);
        }

        match name {
            VideoCodecName::H264 | VideoCodecName::Hevc => {
                args.extend([
                    // The only pixel format supported by Apple players.
                    "-pix_fmt".into(),
                    "yuv420p".into(),
                    // Some decoders don't support open GOPs.
                    "-flags".into(),
                    "+cgop".into(),
                ]);
            }
            VideoCodecName::Vp9 => {
                args.extend([
                    "-row-mt".into(),
                    "1".into(),
                    "-speed".into(),
                    "2".into(),
                ]);
            }
            VideoCodecName::Av1 => {
                args.extend([
                    "-cpu-used".into(),
                    "8".into(),
                    "-row-mt".into(),
                    "1".into(),
                    "-tiles".into(),
                    "2x2".into(),
                    "-strict".into(),
                    "experimental".into(),
                ]);
            }
        }

        let keyframe_interval = (self.pipeline.segment_size * input_rate) as i64;

        let bitrate = plan
            .bitrate()
            .ok_or_else(|| Error::Internal("video plan without bitrate".into()))?;

        args.extend([
            // No audio encoding for video.
            "-an".into(),
            "-c:v".into(),
            codec.ffmpeg_codec_string(hwaccel_api),
            "-b:v".into(),
            bitrate.to_string(),
            // MP4 into the pipe, for all codecs.
            "-f".into(),
            "mp4".into(),
            // Force a fragment at each keyframe.
            "-movflags".into(),
            "+frag_keyframe".into(),
            "-frag_duration".into(),
            self.pipeline.segment_size_us().to_string(),
            // Fixed GOP length, aligned with the segment size.
            "-keyint_min".into(),
            keyframe_interval.to_string(),
            "-g".into(),
            keyframe_interval.to_string(),
            "-vf".into(),
            filters.join(","),
        ]);

        Ok(args)
    }
}

fn format_rate(rate: f64) -> String {
    if rate.fract() == 0.0 {
        format!("{}", rate as i64)
    } else {
        format!("{rate}")
    }
}

#[async_trait]
impl PipelineNode for TranscoderNode {
    fn label(&self) -> &str {
        &self.label
    }

    fn start(&mut self) -> Result<()> {
        let args = self.build_command()?;

        let mut env: Vec<(String, String)> = Vec::new();
        if self.pipeline.debug_logs {
            // Turns on the transcoder's own logging, independent of the
            // -loglevel switch above.
            env.push((
                "FFREPORT".into(),
                format!("file=TranscoderNode-{}.log:level=32", self.index),
            ));
        }

        self.handle = Some(ProcessHandle::spawn(
            &self.label,
            &args,
            &env,
            Stdio::inherit(),
        )?);
        Ok(())
    }

    fn check_status(&mut self) -> ProcessStatus {
        match &mut self.handle {
            Some(handle) => handle.check_status(),
            None => ProcessStatus::Errored,
        }
    }

    async fn stop(&mut self) {
        if let Some(handle) = &mut self.handle {
            handle.stop().await;
        }
    }

    fn exit_code(&self) -> Option<i32> {
        self.handle.as_ref().and_then(ProcessHandle::exit_code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{from_yaml_str, AudioCodec, BitrateConfig, Input, VideoCodec};

    fn pipeline(yaml: &str) -> Arc<PipelineConfig> {
        let mut config: PipelineConfig = from_yaml_str("PipelineConfig", yaml).unwrap();
        config.finalize(&BitrateConfig::default()).unwrap();
        config.hwaccel_api = Some("vaapi".into());
        Arc::new(config)
    }

    fn video_input(yaml_extra: &str) -> Input {
        from_yaml_str(
            "Input",
            &format!(
                "name: in.mp4\nmedia_type: video\nframe_rate: 30\nresolution: 1080p\n{yaml_extra}"
            ),
        )
        .unwrap()
    }

    fn audio_input() -> Input {
        from_yaml_str(
            "Input",
            "name: in.mp4\nmedia_type: audio\nlanguage: eng\nchannel_layout: surround\n",
        )
        .unwrap()
    }

    fn video_plan(
        input: &Input,
        codec: VideoCodec,
        bucket: &str,
        dir: &std::path::Path,
    ) -> OutputStreamPlan {
        let bitrate = BitrateConfig::default();
        OutputStreamPlan::video(0, input, codec, bucket, bitrate.resolution(bucket).unwrap(), dir)
            .unwrap()
    }

    fn node(
        inputs: Vec<Input>,
        pipeline: Arc<PipelineConfig>,
        plans: Vec<OutputStreamPlan>,
    ) -> TranscoderNode {
        TranscoderNode::new(inputs, pipeline, Arc::new(plans), 0, PathBuf::from("ffmpeg"))
    }

    fn count(args: &[String], token: &str) -> usize {
        args.iter().filter(|a| a.as_str() == token).count()
    }

    fn joined(args: &[String]) -> String {
        args.join(" ")
    }

    #[test]
    fn vod_h264_command_shape() {
        let dir = tempfile::tempdir().unwrap();
        let input = video_input("");
        let plan = video_plan(
            &input,
            VideoCodec::software(VideoCodecName::H264),
            "720p",
            dir.path(),
        );
        let writer = plan.pipe().writer_end().unwrap().to_string_lossy().into_owned();
        let node = node(vec![input], pipeline("streaming_mode: vod\n"), vec![plan]);
        let args = node.build_command().unwrap();

        assert_eq!(args[0], "ffmpeg");
        assert_eq!(args[1], "-y");
        assert_eq!(count(&args, "-i"), 1);
        let line = joined(&args);
        assert!(line.contains("-map 0:v:0"));
        assert!(line.contains("-preset slow"));
        assert!(line.contains("-flags +loop"));
        assert!(line.contains("-profile:v high"));
        assert!(line.contains("-pix_fmt yuv420p"));
        assert!(line.contains("-flags +cgop"));
        assert!(line.contains("-c:v h264"));
        assert!(line.contains("-b:v 2M"));
        assert!(line.contains("-movflags +frag_keyframe"));
        assert!(line.contains("-frag_duration 4000000"));
        // 4 s segments at 30 fps.
        assert!(line.contains("-keyint_min 120"));
        assert!(line.contains("-g 120"));
        assert!(line.contains("-vf scale=-2:720,setsar=1:1"));
        // The 720p cap (30 fps) does not force -r for a 30 fps input.
        assert_eq!(count(&args, "-r"), 0);
        assert_eq!(args.last().unwrap(), &writer);
        // No live-only flags on VOD.
        assert_eq!(count(&args, "-thread_queue_size"), 0);
    }

    #[test]
    fn sub_hd_h264_uses_main_profile() {
        let dir = tempfile::tempdir().unwrap();
        let input = video_input("");
        let plan = video_plan(
            &input,
            VideoCodec::software(VideoCodecName::H264),
            "480p",
            dir.path(),
        );
        let node = node(vec![input], pipeline("streaming_mode: vod\n"), vec![plan]);
        let line = joined(&node.build_command().unwrap());
        assert!(line.contains("-profile:v main"));
    }

    #[test]
    fn live_uses_fast_presets_and_input_queues() {
        let dir = tempfile::tempdir().unwrap();
        let input = video_input("");
        let plan = video_plan(
            &input,
            VideoCodec::software(VideoCodecName::H264),
            "720p",
            dir.path(),
        );
        let node = node(
            vec![input],
            pipeline("streaming_mode: live\nsegment_per_file: true\n"),
            vec![plan],
        );
        let args = node.build_command().unwrap();
        let line = joined(&args);
        assert!(line.contains("-preset ultrafast"));
        assert!(!line.contains("-preset slow"));
        assert!(line.contains("-thread_queue_size 200"));
    }

    #[test]
    fn one_rate_flag_even_when_interlaced_and_capped() {
        let dir = tempfile::tempdir().unwrap();
        // 60 fps interlaced input, capped to 30 by the 720p bucket.
        let mut input = video_input("is_interlaced: true\n");
        input.frame_rate = Some(60.0);
        let plan = video_plan(
            &input,
            VideoCodec::software(VideoCodecName::H264),
            "720p",
            dir.path(),
        );
        let node = node(vec![input], pipeline("streaming_mode: vod\n"), vec![plan]);
        let args = node.build_command().unwrap();
        assert_eq!(count(&args, "-r"), 1);
        let position = args.iter().position(|a| a == "-r").unwrap();
        assert_eq!(args[position + 1], "30");
        assert!(joined(&args).contains("pp=fd"));
    }

    #[test]
    fn interlaced_without_cap_keeps_input_rate() {
        let dir = tempfile::tempdir().unwrap();
        let mut input = video_input("is_interlaced: true\n");
        input.frame_rate = Some(25.0);
        let plan = video_plan(
            &input,
            VideoCodec::software(VideoCodecName::H264),
            "576p",
            dir.path(),
        );
        let node = node(vec![input], pipeline("streaming_mode: vod\n"), vec![plan]);
        let args = node.build_command().unwrap();
        let position = args.iter().position(|a| a == "-r").unwrap();
        assert_eq!(args[position + 1], "25");
        assert!(joined(&args).contains("pp=fd,scale=-2:576,setsar=1:1"));
    }

    #[test]
    fn audio_surround_gets_channel_map() {
        let dir = tempfile::tempdir().unwrap();
        let input = audio_input();
        let bitrate = BitrateConfig::default();
        let plan = OutputStreamPlan::audio(
            0,
            &input,
            AudioCodec::Aac,
            "surround",
            bitrate.channel_layout("surround").unwrap(),
            dir.path(),
        )
        .unwrap();
        let node = node(vec![input], pipeline("streaming_mode: vod\n"), vec![plan]);
        let line = joined(&node.build_command().unwrap());
        assert!(line.contains("-map 0:a:0"));
        assert!(line.contains("-vn -ac 6"));
        assert!(line.contains("-c:a aac"));
        assert!(line.contains("-b:a 256k"));
        assert!(line.contains("-strict experimental"));
        assert!(line.contains("-af channelmap=channel_layout=5.1"));
    }

    #[test]
    fn opus_uses_libopus() {
        let dir = tempfile::tempdir().unwrap();
        let input = audio_input();
        let bitrate = BitrateConfig::default();
        let plan = OutputStreamPlan::audio(
            0,
            &input,
            AudioCodec::Opus,
            "stereo",
            bitrate.channel_layout("stereo").unwrap(),
            dir.path(),
        )
        .unwrap();
        let node = node(vec![input], pipeline("streaming_mode: vod\n"), vec![plan]);
        let line = joined(&node.build_command().unwrap());
        assert!(line.contains("-c:a libopus"));
        // Stereo needs no channel-map workaround and has no user filters.
        assert!(!line.contains("-af"));
    }

    #[test]
    fn vp9_and_av1_flags() {
        let dir = tempfile::tempdir().unwrap();
        let input = video_input("");
        let vp9 = video_plan(
            &input,
            VideoCodec::software(VideoCodecName::Vp9),
            "720p",
            dir.path(),
        );
        let node_vp9 = node(
            vec![input.clone()],
            pipeline("streaming_mode: vod\n"),
            vec![vp9],
        );
        let line = joined(&node_vp9.build_command().unwrap());
        assert!(line.contains("-row-mt 1"));
        assert!(line.contains("-speed 2"));
        assert!(!line.contains("-preset"));

        let av1 = video_plan(
            &input,
            VideoCodec::software(VideoCodecName::Av1),
            "720p",
            dir.path(),
        );
        let node_av1 = node(vec![input], pipeline("streaming_mode: vod\n"), vec![av1]);
        let line = joined(&node_av1.build_command().unwrap());
        assert!(line.contains("-cpu-used 8"));
        assert!(line.contains("-tiles 2x2"));
        assert!(line.contains("-strict experimental"));
    }

    #[test]
    fn vaapi_hardware_plan_configures_the_device_once() {
        let dir = tempfile::tempdir().unwrap();
        let input = video_input("");
        let hw = VideoCodec {
            name: VideoCodecName::H264,
            hw: true,
        };
        let plan_a = video_plan(&input, hw, "720p", dir.path());
        let plan_b = video_plan(&input, hw, "480p", dir.path());
        let node = node(
            vec![input],
            pipeline("streaming_mode: vod\n"),
            vec![plan_a, plan_b],
        );
        let args = node.build_command().unwrap();
        assert_eq!(count(&args, "-vaapi_device"), 1);
        let line = joined(&args);
        assert!(line.contains("format=nv12,hwupload,scale_vaapi=-2:720"));
        assert!(line.contains("-c:v h264_vaapi"));
        // Software presets don't apply to hardware encoders.
        assert!(!line.contains("-preset"));
    }

    #[test]
    fn looped_file_and_slice_windows() {
        let dir = tempfile::tempdir().unwrap();
        let mut looped = video_input("");
        looped.input_type = InputType::LoopedFile;
        let plan = video_plan(
            &looped,
            VideoCodec::software(VideoCodecName::H264),
            "720p",
            dir.path(),
        );
        let looped_node = node(
            vec![looped],
            pipeline("streaming_mode: live\nsegment_per_file: true\n"),
            vec![plan],
        );
        let line = joined(&looped_node.build_command().unwrap());
        assert!(line.contains("-stream_loop -1 -re"));

        let mut sliced = video_input("start_time: \"0:10\"\nend_time: \"0:30\"\n");
        sliced.input_type = InputType::File;
        let plan = video_plan(
            &sliced,
            VideoCodec::software(VideoCodecName::H264),
            "720p",
            dir.path(),
        );
        let node = node(vec![sliced], pipeline("streaming_mode: vod\n"), vec![plan]);
        let line = joined(&node.build_command().unwrap());
        assert!(line.contains("-ss 0:10 -to 0:30 -i in.mp4"));
    }

    #[test]
    fn skipped_plans_get_no_output_token() {
        let dir = tempfile::tempdir().unwrap();
        let video = video_input("");
        let text: Input = from_yaml_str(
            "Input",
            "name: subs.vtt\nmedia_type: text\nlanguage: en\n",
        )
        .unwrap();
        let video_plan = video_plan(
            &video,
            VideoCodec::software(VideoCodecName::H264),
            "720p",
            dir.path(),
        );
        let text_plan = OutputStreamPlan::text(1, &text);
        let node = node(
            vec![video, text],
            pipeline("streaming_mode: vod\n"),
            vec![video_plan, text_plan],
        );
        let args = node.build_command().unwrap();
        // Two inputs, but only one mapped output.
        assert_eq!(count(&args, "-i"), 2);
        assert_eq!(count(&args, "-map"), 1);
        assert!(!joined(&args).contains("webvtt"));
    }

    #[test]
    fn quiet_mode_lowers_log_level() {
        let dir = tempfile::tempdir().unwrap();
        let input = video_input("");
        let plan = video_plan(
            &input,
            VideoCodec::software(VideoCodecName::H264),
            "720p",
            dir.path(),
        );
        let node = node(
            vec![input],
            pipeline("streaming_mode: vod\nquiet: true\n"),
            vec![plan],
        );
        let args = node.build_command().unwrap();
        assert_eq!(args[2], "-loglevel");
        assert_eq!(args[3], "error");
    }
}
