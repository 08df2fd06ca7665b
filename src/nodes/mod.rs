//! Pipeline nodes and their shared process/task plumbing.
//!
//! Every node exposes the same small capability set (start, status, stop) so
//! the controller can supervise the graph uniformly. Subprocess-backed nodes
//! wrap a [`ProcessHandle`]; task-backed nodes (cloud sync, concatenation)
//! wrap a [`TaskHandle`].

pub mod cloud;
pub mod concat;
pub mod external;
pub mod packager;
pub mod transcoder;

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// Status of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    /// The node has completed its task and shut down.
    Finished,
    /// The node is still running.
    Running,
    /// The node has failed.
    Errored,
}

/// A uniform handle over every node in the graph.
#[async_trait]
pub trait PipelineNode: Send {
    /// Node label used in logs and errors, e.g. "TranscoderNode-0".
    fn label(&self) -> &str;

    /// Construct the command line (or task) and launch it.
    fn start(&mut self) -> Result<()>;

    /// Current status; cheap enough to poll every tick.
    fn check_status(&mut self) -> ProcessStatus;

    /// Stop the node if it is still running.
    async fn stop(&mut self);

    /// Exit code of the underlying subprocess, if it failed with one.
    fn exit_code(&self) -> Option<i32> {
        None
    }
}

/// An external subprocess in its own process group.
#[derive(Debug)]
pub struct ProcessHandle {
    label: String,
    child: tokio::process::Child,
    pgid: Option<i32>,
    exit_code: Option<i32>,
}

impl ProcessHandle {
    /// Spawn `args` with the given environment additions. The command line
    /// is echoed at debug level, formatted the way `bash -x` would print it,
    /// so it is easy to copy and re-run in a shell.
    pub fn spawn(
        label: &str,
        args: &[String],
        env: &[(String, String)],
        stdout: Stdio,
    ) -> Result<Self> {
        let (program, rest) = args
            .split_first()
            .ok_or_else(|| Error::Internal(format!("{label}: empty command line")))?;

        tracing::debug!("+ {}", args.join(" "));

        let mut command = tokio::process::Command::new(program);
        command
            .args(rest)
            .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(stdout);

        // A fresh process group, so that tool-spawned helpers die with their
        // parent when the group is signalled.
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.as_std_mut().process_group(0);
        }

        let child = command.spawn().map_err(|e| {
            Error::Internal(format!("{label}: failed to spawn {program}: {e}"))
        })?;
        let pgid = child.id().map(|id| id as i32);

        Ok(Self {
            label: label.to_string(),
            child,
            pgid,
            exit_code: None,
        })
    }

    pub fn check_status(&mut self) -> ProcessStatus {
        match self.child.try_wait() {
            Ok(None) => ProcessStatus::Running,
            Ok(Some(status)) => {
                self.exit_code = status.code();
                if status.success() {
                    ProcessStatus::Finished
                } else {
                    ProcessStatus::Errored
                }
            }
            Err(e) => {
                tracing::warn!("{}: could not poll subprocess: {e}", self.label);
                ProcessStatus::Errored
            }
        }
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    /// Graceful stop: TERM the process group, wait one second, then KILL and
    /// reap so no zombie is left behind.
    pub async fn stop(&mut self) {
        if self.check_status() != ProcessStatus::Running {
            return;
        }

        // Slightly more polite than kill. Try this first.
        self.signal_group(false);
        tokio::time::sleep(Duration::from_secs(1)).await;

        if self.check_status() == ProcessStatus::Running {
            self.signal_group(true);
            if let Err(e) = self.child.wait().await {
                tracing::warn!("{}: failed to reap subprocess: {e}", self.label);
            }
            self.check_status();
        }
    }

    #[cfg(unix)]
    fn signal_group(&mut self, force: bool) {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        let signal = if force { Signal::SIGKILL } else { Signal::SIGTERM };
        if let Some(pgid) = self.pgid {
            if let Err(e) = killpg(Pid::from_raw(pgid), signal) {
                tracing::debug!("{}: killpg({pgid}, {signal:?}) failed: {e}", self.label);
            }
        }
    }

    #[cfg(not(unix))]
    fn signal_group(&mut self, _force: bool) {
        if let Err(e) = self.child.start_kill() {
            tracing::debug!("{}: kill failed: {e}", self.label);
        }
    }
}

/// A background task with the same status/stop shape as a subprocess.
#[derive(Debug)]
pub struct TaskHandle {
    status: tokio::sync::watch::Receiver<ProcessStatus>,
    cancel: CancellationToken,
    join: Option<tokio::task::JoinHandle<()>>,
}

impl TaskHandle {
    /// Spawn a task. The task receives a cancellation token and a status
    /// sender; it must publish `Finished` or `Errored` before returning.
    pub fn spawn<F, Fut>(make: F) -> Self
    where
        F: FnOnce(CancellationToken, tokio::sync::watch::Sender<ProcessStatus>) -> Fut,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let (tx, rx) = tokio::sync::watch::channel(ProcessStatus::Running);
        let cancel = CancellationToken::new();
        let join = tokio::spawn(make(cancel.clone(), tx));
        Self {
            status: rx,
            cancel,
            join: Some(join),
        }
    }

    pub fn check_status(&self) -> ProcessStatus {
        *self.status.borrow()
    }

    pub async fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(join) = self.join.take() {
            if let Err(e) = join.await {
                tracing::warn!("task join failed: {e}");
            }
        }
    }
}
