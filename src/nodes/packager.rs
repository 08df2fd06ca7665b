//! Derives and supervises the packager subprocess for one period.
//!
//! The packager reads one stream descriptor per plan (each pointing at a
//! pipe reader end or, for skipped text, a plain file), emits init/media
//! segments, and writes the DASH and/or HLS manifests.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::{Encryption, ManifestFormat, PipelineConfig, StreamingMode};
use crate::error::Result;
use crate::nodes::{PipelineNode, ProcessHandle, ProcessStatus};
use crate::stream::OutputStreamPlan;

/// True for output locations that are URLs rather than local paths.
pub fn is_url(s: &str) -> bool {
    ["http://", "https://", "gs://", "s3://"]
        .iter()
        .any(|scheme| s.starts_with(scheme))
}

/// Join an output location and a sub-path. URLs always use forward slashes,
/// regardless of the host platform; filesystem paths use the host separator.
pub fn build_path(output_location: &str, sub_path: &str) -> String {
    // Sometimes the segment dir is empty. This handles that special case.
    if sub_path.is_empty() {
        return output_location.to_string();
    }
    if is_url(output_location) {
        format!("{}/{}", output_location.trim_end_matches('/'), sub_path)
    } else {
        PathBuf::from(output_location)
            .join(sub_path)
            .to_string_lossy()
            .into_owned()
    }
}

pub struct PackagerNode {
    label: String,
    pipeline: Arc<PipelineConfig>,
    output_location: String,
    segment_dir: String,
    plans: Arc<Vec<OutputStreamPlan>>,
    index: usize,
    packager: PathBuf,
    handle: Option<ProcessHandle>,
}

impl PackagerNode {
    pub fn new(
        pipeline: Arc<PipelineConfig>,
        output_location: String,
        plans: Arc<Vec<OutputStreamPlan>>,
        index: usize,
        packager: PathBuf,
    ) -> Self {
        let segment_dir = build_path(&output_location, &pipeline.segment_folder);
        Self {
            label: format!("PackagerNode-{index}"),
            pipeline,
            output_location,
            segment_dir,
            plans,
            index,
            packager,
            handle: None,
        }
    }

    /// The plans this packager consumes.
    pub fn plans(&self) -> &Arc<Vec<OutputStreamPlan>> {
        &self.plans
    }

    /// Where this packager writes its manifests and segments.
    pub fn output_location(&self) -> &str {
        &self.output_location
    }

    /// Derive the full command line. Exposed for tests.
    pub fn build_command(&self) -> Result<Vec<String>> {
        let mut args: Vec<String> = vec![self.packager.to_string_lossy().into_owned()];

        for plan in self.plans.iter() {
            args.push(self.stream_descriptor(plan));
        }

        if self.pipeline.quiet {
            // Only output error logs.
            args.push("--quiet".into());
        }

        if self.pipeline.segment_size > 0.0 {
            args.extend([
                "--segment_duration".into(),
                format!("{:.2}", self.pipeline.segment_size),
            ]);
        }

        if self.pipeline.streaming_mode == StreamingMode::Live {
            args.extend([
                // Number of seconds the user can rewind through.
                "--time_shift_buffer_depth".into(),
                self.pipeline.availability_window.to_string(),
                // This must not go below 3, or the first segment in an HLS
                // playlist may expire before the playlist is refreshed.
                "--preserved_segments_outside_live_window".into(),
                "3".into(),
                // Seconds of content packaged ahead of the live edge.
                "--suggested_presentation_delay".into(),
                self.pipeline.presentation_delay.to_string(),
                // Seconds between manifest updates.
                "--minimum_update_period".into(),
                self.pipeline.update_period.to_string(),
            ]);
        }

        args.extend(self.manifest_format_args());

        let encryption = self.pipeline.encryption.validated()?;
        if encryption.is_enabled() {
            args.extend(encryption_args(&encryption));
        }

        Ok(args)
    }

    /// One comma-joined `key=value` descriptor token per plan.
    fn stream_descriptor(&self, plan: &OutputStreamPlan) -> String {
        let mut pairs: Vec<String> = vec![
            format!("in={}", plan.pipe().reader_end().to_string_lossy()),
            format!("stream={}", plan.media_kind().as_str()),
        ];

        if let Some(seconds) = plan.input.skip_encryption {
            if seconds > 0 {
                pairs.push(format!("skip_encryption={seconds}"));
            }
        }

        if let Some(label) = plan.input.drm_label.as_deref().filter(|l| !l.is_empty()) {
            pairs.push(format!("drm_label={label}"));
        }

        // The packager will not accept "und" as a language, but players fill
        // that in when language metadata is missing from the manifest.
        if let Some(language) = plan.input.language.as_deref() {
            if !language.is_empty() && language != "und" {
                pairs.push(format!("language={language}"));
            }
        }

        if self.pipeline.segment_per_file {
            pairs.push(format!(
                "init_segment={}",
                build_path(&self.segment_dir, &plan.init_seg_file())
            ));
            pairs.push(format!(
                "segment_template={}",
                build_path(&self.segment_dir, &plan.media_seg_file())
            ));
        } else {
            pairs.push(format!(
                "output={}",
                build_path(&self.segment_dir, &plan.single_seg_file())
            ));
        }

        if plan.is_dash_only() {
            pairs.push("dash_only=1".into());
        }

        pairs.join(",")
    }

    fn manifest_format_args(&self) -> Vec<String> {
        let mut args: Vec<String> = Vec::new();

        if self.pipeline.has_format(ManifestFormat::Dash) {
            if !self.pipeline.utc_timings.is_empty() {
                let timings: Vec<String> = self
                    .pipeline
                    .utc_timings
                    .iter()
                    .map(|pair| format!("{}={}", pair.scheme_id_uri, pair.value))
                    .collect();
                args.extend(["--utc_timings".into(), timings.join(",")]);
            }

            if self.pipeline.low_latency_dash_mode {
                args.push("--low_latency_dash_mode=true".into());
            }

            if self.pipeline.streaming_mode == StreamingMode::Vod {
                args.push("--generate_static_live_mpd".into());
            }

            args.extend([
                "--mpd_output".into(),
                build_path(&self.output_location, &self.pipeline.dash_output),
            ]);
        }

        if self.pipeline.has_format(ManifestFormat::Hls) {
            let playlist_type = if self.pipeline.is_live() { "LIVE" } else { "VOD" };
            args.extend([
                "--hls_playlist_type".into(),
                playlist_type.into(),
                "--hls_master_playlist_output".into(),
                build_path(&self.output_location, &self.pipeline.hls_output),
            ]);
        }

        args
    }
}

fn encryption_args(encryption: &Encryption) -> Vec<String> {
    match encryption {
        Encryption::Off => vec![],
        Encryption::Widevine {
            key_server_url,
            content_id,
            signer,
            signing_key,
            signing_iv,
        } => vec![
            "--enable_widevine_encryption".into(),
            "--key_server_url".into(),
            key_server_url.clone(),
            "--content_id".into(),
            content_id.clone(),
            "--signer".into(),
            signer.clone(),
            "--aes_signing_key".into(),
            signing_key.clone(),
            "--aes_signing_iv".into(),
            signing_iv.clone(),
        ],
        Encryption::Raw { keys, iv, pssh } => {
            let key_tokens: Vec<String> = keys
                .iter()
                .map(|key| {
                    let label = key
                        .label
                        .as_deref()
                        .map(|l| format!("label={l}:"))
                        .unwrap_or_default();
                    format!("{label}key_id={}:key={}", key.key_id, key.key)
                })
                .collect();

            let mut args = vec![
                "--enable_raw_key_encryption".into(),
                "--keys".into(),
                key_tokens.join(","),
            ];
            if let Some(iv) = iv {
                args.extend(["--iv".into(), iv.clone()]);
            }
            if let Some(pssh) = pssh {
                args.extend(["--pssh".into(), pssh.clone()]);
            }
            args
        }
    }
}

#[async_trait]
impl PipelineNode for PackagerNode {
    fn label(&self) -> &str {
        &self.label
    }

    fn start(&mut self) -> Result<()> {
        let args = self.build_command()?;

        let stdout = if self.pipeline.debug_logs {
            let log_file = std::fs::File::create(format!("PackagerNode-{}.log", self.index))?;
            Stdio::from(log_file)
        } else {
            Stdio::inherit()
        };

        self.handle = Some(ProcessHandle::spawn(&self.label, &args, &[], stdout)?);
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
