//! Mirrors packager output to cloud object storage.
//!
//! A published manifest must never reference segments that are not yet
//! uploaded, so each cycle snapshots manifest contents first, pushes
//! everything except manifests, then pushes the snapshots.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

use crate::error::{Error, Result};
use crate::nodes::{PipelineNode, ProcessStatus, TaskHandle};

/// Marker object written to verify the destination is writable.
pub const ACCESS_CHECK_OBJECT: &str = ".shaka-streamer-access-check";

const CACHE_CONTROL_HEADER: &str = "Cache-Control: no-store, no-transform";
const SYNC_TOOL: &str = "gsutil";

fn common_sync_args() -> Vec<String> {
    [
        SYNC_TOOL,
        "-q",
        "-h",
        CACHE_CONTROL_HEADER,
        "-m",
        "rsync",
        "-C",
        "-r",
    ]
    .map(String::from)
    .to_vec()
}

/// First sync pass: everything except manifests, deleting remote files that
/// are no longer needed. The exclusions are honoured for both copy and
/// delete, so manifests are never deleted remotely either.
pub fn segment_sync_args(input_dir: &Path, bucket_url: &str) -> Vec<String> {
    let mut args = common_sync_args();
    args.extend(["-d", "-x", ".*m3u8", "-x", ".*mpd"].map(String::from));
    args.push(input_dir.to_string_lossy().into_owned());
    args.push(bucket_url.to_string());
    args
}

/// Second sync pass: the manifest snapshots. Wire compression works on
/// gs:// destinations but fails on s3://.
pub fn manifest_sync_args(temp_dir: &Path, bucket_url: &str) -> Vec<String> {
    let mut args = common_sync_args();
    if bucket_url.starts_with("gs:") {
        args.push("-J".into());
    }
    args.extend([temp_dir.to_string_lossy().into_owned(), bucket_url.into()]);
    args
}

pub fn access_check_args(bucket_url: &str) -> Vec<String> {
    let destination = format!("{}/{ACCESS_CHECK_OBJECT}", bucket_url.trim_end_matches('/'));
    [SYNC_TOOL.into(), "cp".into(), "-".into(), destination].to_vec()
}

/// Verify early that the destination bucket is writable.
///
/// Listing is not enough: some buckets grant read-only access to anonymous
/// users, so writing is the only real check.
pub async fn check_access(bucket_url: &str) -> Result<()> {
    let args = access_check_args(bucket_url);
    tracing::debug!("+ {}", args.join(" "));
    let status = tokio::process::Command::new(&args[0])
        .args(&args[1..])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::inherit())
        .status()
        .await
        .map_err(|_| Error::dependency(SYNC_TOOL, "not found; is the cloud SDK installed?", None))?;

    if !status.success() {
        return Err(Error::Destination {
            url: bucket_url.to_string(),
        });
    }
    Ok(())
}

/// Enumerate the manifests under the output directory.
pub fn find_manifests(input_dir: &Path) -> Vec<PathBuf> {
    WalkDir::new(input_dir)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| {
            matches!(
                entry.path().extension().and_then(|e| e.to_str()),
                Some("mpd" | "m3u8")
            )
        })
        .map(|entry| entry.into_path())
        .collect()
}

/// Snapshot manifest bytes into the staging directory, mirroring the
/// relative layout. Empty manifests (live, not yet written) are retried
/// every 100 ms until the node is told to stop.
async fn stage_manifests(
    input_dir: &Path,
    temp_dir: &Path,
    cancel: &CancellationToken,
) -> Result<()> {
    for manifest in find_manifests(input_dir) {
        let relative = manifest
            .strip_prefix(input_dir)
            .map_err(|_| Error::Internal("manifest outside the output directory".into()))?;

        let mut contents = std::fs::read(&manifest)?;
        while contents.is_empty() && !cancel.is_cancelled() {
            tokio::time::sleep(Duration::from_millis(100)).await;
            contents = std::fs::read(&manifest)?;
        }

        let staged = temp_dir.join(relative);
        if let Some(parent) = staged.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(staged, contents)?;
    }
    Ok(())
}

async fn run_sync(label: &str, args: Vec<String>) -> Result<()> {
    tracing::debug!("+ {}", args.join(" "));
    let status = tokio::process::Command::new(&args[0])
        .args(&args[1..])
        .stdin(Stdio::null())
        .status()
        .await?;
    if !status.success() {
        return Err(Error::runtime(label, status.code()));
    }
    Ok(())
}

async fn upload_once(
    label: &str,
    input_dir: &Path,
    bucket_url: &str,
    temp_dir: &Path,
    cancel: &CancellationToken,
) -> Result<()> {
    // Capture manifest contents before segments are pushed, so the uploaded
    // manifests only ever reference segments that already exist remotely.
    stage_manifests(input_dir, temp_dir, cancel).await?;
    run_sync(label, segment_sync_args(input_dir, bucket_url)).await?;
    run_sync(label, manifest_sync_args(temp_dir, bucket_url)).await?;
    Ok(())
}

pub struct CloudSyncNode {
    label: String,
    input_dir: PathBuf,
    bucket_url: String,
    temp_dir: PathBuf,
    task: Option<TaskHandle>,
}

impl CloudSyncNode {
    /// `temp_dir` is a private staging directory for manifest snapshots,
    /// parallel to (never inside) `input_dir`.
    pub fn new(input_dir: PathBuf, bucket_url: &str, temp_dir: PathBuf) -> Self {
        Self {
            label: "CloudSyncNode".into(),
            input_dir,
            // No trailing slash, which would create a remote subdirectory
            // whose name is "".
            bucket_url: bucket_url.trim_end_matches('/').to_string(),
            temp_dir,
            task: None,
        }
    }
}

#[async_trait]
impl PipelineNode for CloudSyncNode {
    fn label(&self) -> &str {
        &self.label
    }

    fn start(&mut self) -> Result<()> {
        let label = self.label.clone();
        let input_dir = self.input_dir.clone();
        let bucket_url = self.bucket_url.clone();
        let temp_dir = self.temp_dir.clone();

        self.task = Some(TaskHandle::spawn(|cancel, status| async move {
            loop {
                let terminal = cancel.is_cancelled();
                if let Err(e) =
                    upload_once(&label, &input_dir, &bucket_url, &temp_dir, &cancel).await
                {
                    tracing::error!("{label}: {e}");
                    let _ = status.send(ProcessStatus::Errored);
                    return;
                }
                if terminal {
                    break;
                }
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = tokio::time::sleep(Duration::from_millis(100)) => {}
                }
            }
            let _ = status.send(ProcessStatus::Finished);
        }));
        Ok(())
    }

    fn check_status(&mut self) -> ProcessStatus {
        match &self.task {
            Some(task) => task.check_status(),
            None => ProcessStatus::Errored,
        }
    }

    /// Stopping performs one terminal flush so the final manifests land
    /// after their segments.
    async fn stop(&mut self) {
        if let Some(task) = &mut self.task {
            task.stop().await;
        }
    }
}
