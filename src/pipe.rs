//! OS-level byte conduits between the transcoder and the packager.
//!
//! On POSIX hosts both ends resolve to one named FIFO and the kernel
//! serialises bytes with built-in backpressure; the data never traverses
//! user space. On Windows the same contract is preserved by two named pipes
//! bridged by a background copy task. Either way, callers get two path-like
//! endpoints to hand to external processes.

use std::path::{Path, PathBuf};

use crate::error::Result;

/// A logical byte channel with a reader path and a writer path.
///
/// Not `Clone`: each output stream plan owns exactly one `PipePair`. FIFO
/// files live in the run's private temp directory and are unlinked with it.
#[derive(Debug)]
pub struct PipePair {
    reader: PathBuf,
    writer: Option<PathBuf>,
}

impl PipePair {
    /// Create an inter-process pipe in `pipe_dir` with a unique name.
    pub fn new_ipc(pipe_dir: &Path, suffix: &str) -> Result<Self> {
        let unique_name = format!("{}{}", uuid::Uuid::new_v4(), suffix);
        Self::create_ipc(pipe_dir, &unique_name)
    }

    /// Bind the reader path to a plain file; used for text streams which are
    /// handed directly from file to packager. There is no writer end.
    pub fn from_file_source(path: impl Into<PathBuf>) -> Self {
        Self {
            reader: path.into(),
            writer: None,
        }
    }

    /// The path a reader process consumes from.
    pub fn reader_end(&self) -> &Path {
        &self.reader
    }

    /// The path a writer process produces into, if this pair has one.
    pub fn writer_end(&self) -> Option<&Path> {
        self.writer.as_deref()
    }

    #[cfg(unix)]
    fn create_ipc(pipe_dir: &Path, unique_name: &str) -> Result<Self> {
        use nix::sys::stat::Mode;

        let path = pipe_dir.join(unique_name);
        let readable_by_owner_only = Mode::from_bits_truncate(0o600);
        nix::unistd::mkfifo(&path, readable_by_owner_only)
            .map_err(|e| std::io::Error::from_raw_os_error(e as i32))?;
        Ok(Self {
            reader: path.clone(),
            writer: Some(path),
        })
    }

    #[cfg(windows)]
    fn create_ipc(_pipe_dir: &Path, unique_name: &str) -> Result<Self> {
        use tokio::net::windows::named_pipe::ServerOptions;

        // The write pipe is connected to the producing process, the read
        // pipe to the consuming one; a background task carries bytes across.
        let writer_name = format!(r"\\.\pipe\W-streamforge-{unique_name}");
        let reader_name = format!(r"\\.\pipe\R-streamforge-{unique_name}");

        let mut inbound = ServerOptions::new().create(&writer_name)?;
        let mut outbound = ServerOptions::new().create(&reader_name)?;

        tokio::spawn(async move {
            if let Err(e) = inbound.connect().await {
                tracing::warn!("pipe bridge: writer side never connected: {e}");
                return;
            }
            if let Err(e) = outbound.connect().await {
                tracing::warn!("pipe bridge: reader side never connected: {e}");
                return;
            }
            if let Err(e) = tokio::io::copy(&mut inbound, &mut outbound).await {
                tracing::warn!("pipe bridge ended with error: {e}");
            }
        });

        Ok(Self {
            reader: PathBuf::from(reader_name),
            writer: Some(PathBuf::from(writer_name)),
        })
    }

    #[cfg(not(any(unix, windows)))]
    fn create_ipc(_pipe_dir: &Path, _unique_name: &str) -> Result<Self> {
        Err(crate::error::Error::Internal(
            "inter-process pipes are not supported on this platform".into(),
        ))
    }
}
