//! Controls all other nodes and manages shared resources.
//!
//! The controller owns the run's temp workspace, performs dependency and
//! destination checks, constructs the node graph from configuration, and
//! supervises it with a cooperative 100 ms tick.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use crate::autodetect::FfprobeProber;
use crate::config::{
    BitrateConfig, Input, InputConfig, InputType, MediaKind, PipelineConfig, StreamingMode,
};
use crate::error::{Error, Result};
use crate::nodes::cloud::{self, CloudSyncNode};
use crate::nodes::concat::{PeriodConcatNode, PeriodOutputs};
use crate::nodes::external::ExternalCommandNode;
use crate::nodes::packager::{build_path, is_url, PackagerNode};
use crate::nodes::transcoder::TranscoderNode;
use crate::nodes::{PipelineNode, ProcessStatus};
use crate::pipe::PipePair;
use crate::resolver::InputResolver;
use crate::stream::OutputStreamPlan;
use crate::tools::{self, Binaries};

/// Options from the command line.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Output directory, or an HTTP/HTTPS URL for PUT output.
    pub output_location: String,
    /// Cloud storage URL (gs:// or s3://) to mirror the output to.
    pub cloud_url: Option<String>,
    pub check_deps: bool,
    pub use_system_binaries: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            output_location: "output_files".into(),
            cloud_url: None,
            check_deps: true,
            use_system_binaries: false,
        }
    }
}

/// Compute every output stream plan for one period's resolved inputs.
///
/// Audio: input × audio codec × every channel layout the input covers.
/// Video: input × video codec × every resolution that fits the input after
/// the no-upscaling rule. Text: one skip-transcoding plan per input.
pub fn build_plans_for_period(
    inputs: &[Input],
    pipeline: &PipelineConfig,
    bitrate: &BitrateConfig,
    pipe_dir: &Path,
) -> Result<Vec<OutputStreamPlan>> {
    let mut plans = Vec::new();

    for (index, input) in inputs.iter().enumerate() {
        match input.media_type {
            MediaKind::Audio => {
                let input_layout_name = input.channel_layout.as_deref().ok_or_else(|| {
                    Error::missing("Input", "channel_layout")
                })?;
                let input_layout = bitrate.channel_layout(input_layout_name)?;
                for codec in &pipeline.audio_codecs {
                    for layout_name in pipeline.channel_layouts.as_deref().unwrap_or_default() {
                        let layout = bitrate.channel_layout(layout_name)?;
                        if !layout.fits_within(input_layout) {
                            continue;
                        }
                        plans.push(OutputStreamPlan::audio(
                            index,
                            input,
                            *codec,
                            layout_name,
                            layout,
                            pipe_dir,
                        )?);
                    }
                }
            }
            MediaKind::Video => {
                let input_resolution_name = input.resolution.as_deref().ok_or_else(|| {
                    Error::missing("Input", "resolution")
                })?;
                let input_resolution = bitrate.resolution(input_resolution_name)?;
                for codec in &pipeline.video_codecs {
                    for resolution_name in pipeline.resolutions.as_deref().unwrap_or_default() {
                        let resolution = bitrate.resolution(resolution_name)?;
                        if !resolution.fits_within(input_resolution) {
                            continue;
                        }
                        plans.push(OutputStreamPlan::video(
                            index,
                            input,
                            *codec,
                            resolution_name,
                            resolution,
                            pipe_dir,
                        )?);
                    }
                }
            }
            MediaKind::Text => {
                plans.push(OutputStreamPlan::text(index, input));
            }
        }
    }

    Ok(plans)
}

pub struct Controller {
    /// Workspace for named pipes and manifest staging; removed on drop.
    _temp_dir: TempDir,
    nodes: Vec<Box<dyn PipelineNode>>,
    concat: Option<PeriodConcatNode>,
    concat_started: bool,
    cloud: Option<CloudSyncNode>,
    started: bool,
}

impl Controller {
    /// Run every pre-launch gate and construct the node graph.
    pub async fn build(
        input_config: InputConfig,
        mut pipeline_config: PipelineConfig,
        bitrate_config: BitrateConfig,
        options: RunOptions,
    ) -> Result<Controller> {
        pipeline_config.finalize(&bitrate_config)?;

        let binaries = Binaries::resolve(options.use_system_binaries)?;
        if options.check_deps {
            tools::check_dependencies(&binaries, options.cloud_url.is_some()).await?;
        }

        if let Some(url) = &options.cloud_url {
            // Independent of the version gate: make sure we can write to the
            // destination before spending any transcoding time.
            cloud::check_access(url).await?;
        }

        // No trailing slash; it would otherwise create a remote
        // subdirectory whose name is "".
        let output_location = options.output_location.trim_end_matches('/').to_string();
        let is_multiperiod = input_config.is_multiperiod();

        if is_url(&output_location) {
            if !pipeline_config.segment_per_file {
                return Err(Error::malformed(
                    "PipelineConfig",
                    "segment_per_file",
                    "must be true for HTTP PUT output",
                ));
            }
            if options.cloud_url.is_some() {
                return Err(Error::ConflictingFields {
                    record: "RunOptions".into(),
                    field1: "output".into(),
                    field2: "cloud_url".into(),
                });
            }
            if is_multiperiod {
                return Err(Error::malformed(
                    "InputConfig",
                    "multiperiod_inputs_list",
                    "not supported with HTTP PUT output",
                ));
            }
        } else {
            // Recreate the output directory from scratch.
            if Path::new(&output_location).exists() {
                std::fs::remove_dir_all(&output_location)?;
            }
            std::fs::create_dir_all(&output_location)?;
        }

        let temp_dir = tempfile::Builder::new().prefix("streamforge-").tempdir()?;
        let pipe_dir = temp_dir.path().join("pipes");
        let staging_dir = temp_dir.path().join("manifests");
        std::fs::create_dir_all(&pipe_dir)?;
        std::fs::create_dir_all(&staging_dir)?;

        let pipeline = Arc::new(pipeline_config.clone());
        let prober = FfprobeProber::new(binaries.ffprobe.clone());
        let resolver = InputResolver::new(&prober, &bitrate_config);

        let mut nodes: Vec<Box<dyn PipelineNode>> = Vec::new();
        let mut period_outputs: Vec<PeriodOutputs> = Vec::new();
        let mut external_count = 0usize;

        let periods = input_config.into_periods()?;
        for (period_index, mut inputs) in periods.into_iter().enumerate() {
            for input in &mut inputs {
                resolver.resolve(input).await?;
            }

            // External commands feed a dedicated pipe; the transcoder then
            // reads the pipe instead of the command string.
            for input in &mut inputs {
                if input.input_type == InputType::ExternalCommand {
                    let pipe = PipePair::new_ipc(&pipe_dir, "")?;
                    let writer = pipe.writer_end().ok_or_else(|| {
                        Error::Internal("external-command pipe has no writer end".into())
                    })?;
                    nodes.push(Box::new(ExternalCommandNode::new(
                        input.name.clone(),
                        writer.to_path_buf(),
                        external_count,
                    )));
                    external_count += 1;
                    input.reset_name(pipe.reader_end().to_string_lossy().into_owned());
                }
            }

            let plans = Arc::new(build_plans_for_period(
                &inputs,
                &pipeline,
                &bitrate_config,
                &pipe_dir,
            )?);

            let period_location = if is_multiperiod {
                let location =
                    build_path(&output_location, &format!("period_{}", period_index + 1));
                if !is_url(&location) {
                    std::fs::create_dir_all(&location)?;
                }
                location
            } else {
                output_location.clone()
            };

            nodes.push(Box::new(TranscoderNode::new(
                inputs,
                pipeline.clone(),
                plans.clone(),
                period_index,
                binaries.ffmpeg.clone(),
            )));
            nodes.push(Box::new(PackagerNode::new(
                pipeline.clone(),
                period_location.clone(),
                plans.clone(),
                period_index,
                binaries.packager.clone(),
            )));

            period_outputs.push(PeriodOutputs {
                dir: PathBuf::from(period_location),
                plans,
            });
        }

        let concat = (is_multiperiod && pipeline.streaming_mode == StreamingMode::Vod).then(|| {
            PeriodConcatNode::new(
                pipeline.clone(),
                PathBuf::from(&output_location),
                period_outputs,
            )
        });

        let cloud = options.cloud_url.as_deref().map(|url| {
            CloudSyncNode::new(PathBuf::from(&output_location), url, staging_dir.clone())
        });

        Ok(Controller {
            _temp_dir: temp_dir,
            nodes,
            concat,
            concat_started: false,
            cloud,
            started: false,
        })
    }

    /// Start the graph and supervise it until the run completes, a node
    /// fails, or [`Controller::stop`] is called.
    pub async fn run(&mut self) -> Result<()> {
        if self.started {
            return Err(Error::Internal("controller already started".into()));
        }
        self.started = true;

        let mut start_error: Option<Error> = None;
        for node in &mut self.nodes {
            tracing::info!("Starting {}", node.label());
            if let Err(e) = node.start() {
                start_error = Some(e);
                break;
            }
        }
        if start_error.is_none() {
            if let Some(cloud) = &mut self.cloud {
                tracing::info!("Starting {}", cloud.label());
                if let Err(e) = cloud.start() {
                    start_error = Some(e);
                }
            }
        }
        if let Some(e) = start_error {
            self.stop().await;
            return Err(e);
        }

        loop {
            if let Some(failed) = self.poll_for_failure() {
                self.stop().await;
                return Err(failed);
            }

            if self.main_nodes_finished() {
                let started = self.concat_started;
                let concat_status = match &mut self.concat {
                    None => break,
                    Some(concat) if !started => {
                        tracing::info!("Starting {}", concat.label());
                        concat.start()?;
                        self.concat_started = true;
                        ProcessStatus::Running
                    }
                    Some(concat) => concat.check_status(),
                };
                match concat_status {
                    ProcessStatus::Running => {}
                    ProcessStatus::Finished => break,
                    ProcessStatus::Errored => {
                        let error = Error::runtime("PeriodConcatNode", None);
                        self.stop().await;
                        return Err(error);
                    }
                }
            }

            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        // Terminal flush: the cloud node uploads the final manifests after
        // every segment is in place.
        if let Some(cloud) = &mut self.cloud {
            cloud.stop().await;
            if cloud.check_status() == ProcessStatus::Errored {
                return Err(Error::runtime(cloud.label(), None));
            }
        }

        tracing::info!("Done");
        Ok(())
    }

    fn poll_for_failure(&mut self) -> Option<Error> {
        for node in &mut self.nodes {
            if node.check_status() == ProcessStatus::Errored {
                let error = Error::runtime(node.label(), node.exit_code());
                tracing::error!("{} errored", node.label());
                return Some(error);
            }
        }
        if let Some(cloud) = &mut self.cloud {
            if cloud.check_status() == ProcessStatus::Errored {
                return Some(Error::runtime(cloud.label(), None));
            }
        }
        None
    }

    fn main_nodes_finished(&mut self) -> bool {
        self.nodes
            .iter_mut()
            .all(|node| node.check_status() == ProcessStatus::Finished)
    }

    /// Tear down every node: graceful terminate, one-second grace, then
    /// force kill, propagated through process groups.
    pub async fn stop(&mut self) {
        for node in &mut self.nodes {
            node.stop().await;
        }
        if self.concat_started {
            if let Some(concat) = &mut self.concat {
                concat.stop().await;
            }
        }
        if let Some(cloud) = &mut self.cloud {
            cloud.stop().await;
        }
    }
}
