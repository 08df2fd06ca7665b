use clap::Parser;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "streamforge")]
#[command(author, version, about = "Declarative FFmpeg + Shaka Packager orchestration")]
pub struct Cli {
    /// The path to the input config file (required).
    #[arg(long, value_name = "PATH")]
    pub input_config: Option<PathBuf>,

    /// The path to the pipeline config file (required).
    #[arg(long, value_name = "PATH")]
    pub pipeline_config: Option<PathBuf>,

    /// The path to a config file which defines custom bitrates and
    /// resolutions for transcoding.
    #[arg(long, value_name = "PATH")]
    pub bitrate_config: Option<PathBuf>,

    /// The Google Cloud Storage or Amazon S3 URL to upload to.
    /// (Starts with gs:// or s3://)
    #[arg(long, value_name = "URL")]
    pub cloud_url: Option<String>,

    /// The output folder to write files to, or an HTTP or HTTPS URL where
    /// files will be PUT. Used even if uploading to cloud storage.
    #[arg(long, default_value = "output_files")]
    pub output: String,

    /// Skip checks for dependencies and their versions. This can be useful
    /// for testing pre-release versions of FFmpeg or Shaka Packager.
    #[arg(long)]
    pub skip_deps_check: bool,

    /// Use FFmpeg, FFprobe and Shaka Packager binaries found in PATH
    /// instead of the bundled ones.
    #[arg(long)]
    pub use_system_binaries: bool,

    /// Check the directory for bundled FFmpeg, FFprobe, and Shaka Packager
    /// static builds and exit.
    #[arg(long)]
    pub setup: bool,

    /// Report the fixture-media directory for tests and exit.
    #[arg(long)]
    pub test_assets: bool,
}
