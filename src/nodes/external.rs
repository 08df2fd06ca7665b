//! Feeds external-command inputs into the pipeline.
//!
//! The user's command runs through the shell and writes its output to the
//! path in `SHAKA_STREAMER_EXTERNAL_COMMAND_OUTPUT`, which is set to the
//! writer end of a pipe the transcoder reads from.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;

use crate::error::Result;
use crate::nodes::{PipelineNode, ProcessHandle, ProcessStatus};

/// Environment variable pointing the user command at its output pipe.
pub const EXTERNAL_COMMAND_OUTPUT_VAR: &str = "SHAKA_STREAMER_EXTERNAL_COMMAND_OUTPUT";

pub struct ExternalCommandNode {
    label: String,
    command: String,
    output_pipe: PathBuf,
    handle: Option<ProcessHandle>,
}

impl ExternalCommandNode {
    pub fn new(command: String, output_pipe: PathBuf, index: usize) -> Self {
        Self {
            label: format!("ExternalCommandNode-{index}"),
            command,
            output_pipe,
            handle: None,
        }
    }

    fn shell_args(&self) -> Vec<String> {
        if cfg!(windows) {
            vec!["cmd".into(), "/C".into(), self.command.clone()]
        } else {
            vec!["sh".into(), "-c".into(), self.command.clone()]
        }
    }
}

#[async_trait]
impl PipelineNode for ExternalCommandNode {
    fn label(&self) -> &str {
        &self.label
    }

    fn start(&mut self) -> Result<()> {
        let env = vec![(
            EXTERNAL_COMMAND_OUTPUT_VAR.to_string(),
            self.output_pipe.to_string_lossy().into_owned(),
        )];
        self.handle = Some(ProcessHandle::spawn(
            &self.label,
            &self.shell_args(),
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
