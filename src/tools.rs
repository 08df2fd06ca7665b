//! External tool discovery and dependency/version gates.
//!
//! The transcoder, probe, and packager binaries come either from a bundled
//! directory next to the executable or from `PATH`. Version gates run before
//! any pipeline subprocess is launched.

use std::path::PathBuf;
use std::process::Stdio;

use crate::error::{Error, Result};

/// The binaries the orchestrator drives.
#[derive(Debug, Clone)]
pub struct Binaries {
    pub ffmpeg: PathBuf,
    pub ffprobe: PathBuf,
    pub packager: PathBuf,
}

const BUNDLED_NAMES: &[&str] = &["ffmpeg", "ffprobe", "packager"];

impl Binaries {
    /// The directory searched for bundled static builds.
    pub fn bundled_dir() -> PathBuf {
        std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(|p| p.to_path_buf()))
            .unwrap_or_else(|| PathBuf::from("."))
            .join("streamforge-binaries")
    }

    /// Resolve the bundled binaries, failing with a remediation hint if any
    /// are missing.
    pub fn bundled() -> Result<Self> {
        let dir = Self::bundled_dir();
        let resolve = |name: &str| -> Result<PathBuf> {
            let path = dir.join(format!("{name}{}", std::env::consts::EXE_SUFFIX));
            if !path.exists() {
                return Err(Error::dependency(
                    name,
                    format!("bundled binary not found at {}", path.display()),
                    Some(
                        "Run with --setup to prepare the bundled directory, or pass \
                         --use-system-binaries to use the tools on PATH."
                            .into(),
                    ),
                ));
            }
            Ok(path)
        };
        Ok(Self {
            ffmpeg: resolve("ffmpeg")?,
            ffprobe: resolve("ffprobe")?,
            packager: resolve("packager")?,
        })
    }

    /// Resolve the binaries from `PATH`.
    pub fn from_path() -> Result<Self> {
        let find = |name: &str| {
            which::which(name).map_err(|_| {
                Error::dependency(
                    name,
                    "not found; is it installed and in PATH?",
                    Some("Install it, or drop --use-system-binaries to use bundled builds.".into()),
                )
            })
        };
        Ok(Self {
            ffmpeg: find("ffmpeg")?,
            ffprobe: find("ffprobe")?,
            packager: find("packager")?,
        })
    }

    pub fn resolve(use_system: bool) -> Result<Self> {
        if use_system {
            Self::from_path()
        } else {
            Self::bundled()
        }
    }

    /// Presence report for the bundled directory, for `--setup`.
    pub fn bundled_status() -> (PathBuf, Vec<(String, bool)>) {
        let dir = Self::bundled_dir();
        let entries = BUNDLED_NAMES
            .iter()
            .map(|name| {
                let file = format!("{name}{}", std::env::consts::EXE_SUFFIX);
                let present = dir.join(&file).exists();
                (file, present)
            })
            .collect();
        (dir, entries)
    }
}

/// Extract a dotted version tuple from a tool's version banner, e.g.
/// `ffmpeg version n4.4.2-0ubuntu1` → `[4, 4, 2]`.
pub fn parse_version(text: &str) -> Option<Vec<u64>> {
    let first_line = text.lines().next()?;
    let re = regex::Regex::new(r"(\d+(?:\.\d+)*)").unwrap();
    let m = re.find(first_line)?;
    m.as_str()
        .split('.')
        .map(|part| part.parse().ok())
        .collect()
}

/// Tuple-wise version comparison; a shorter actual version loses to a longer
/// requirement with the same prefix.
pub fn version_at_least(actual: &[u64], required: &[u64]) -> bool {
    actual >= required
}

fn fmt_version(version: &[u64]) -> String {
    version
        .iter()
        .map(u64::to_string)
        .collect::<Vec<_>>()
        .join(".")
}

/// Run a version command and gate on the minimum required version.
pub async fn check_command_version(
    name: &str,
    command: &[&str],
    required: &[u64],
) -> Result<()> {
    let output = tokio::process::Command::new(command[0])
        .args(&command[1..])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|_| {
            Error::dependency(
                name,
                format!("not found; \"{}\" could not be run", command.join(" ")),
                None,
            )
        })?;

    let text = if output.stdout.is_empty() {
        String::from_utf8_lossy(&output.stderr).to_string()
    } else {
        String::from_utf8_lossy(&output.stdout).to_string()
    };

    let Some(actual) = parse_version(&text) else {
        return Err(Error::dependency(
            name,
            format!(
                "unable to parse version from \"{}\"",
                text.lines().next().unwrap_or_default()
            ),
            None,
        ));
    };

    if !version_at_least(&actual, required) {
        return Err(Error::dependency(
            name,
            format!(
                "version {} is too old; {} or later is required",
                fmt_version(&actual),
                fmt_version(required)
            ),
            Some("Pass --skip-deps-check to test pre-release builds.".into()),
        ));
    }

    Ok(())
}

/// The dependency gates run before any pipeline subprocess is launched.
pub async fn check_dependencies(binaries: &Binaries, cloud_destination: bool) -> Result<()> {
    let ffmpeg = binaries.ffmpeg.to_string_lossy().to_string();
    let ffprobe = binaries.ffprobe.to_string_lossy().to_string();
    let packager = binaries.packager.to_string_lossy().to_string();

    check_command_version("FFmpeg", &[&ffmpeg, "-version"], &[4, 1]).await?;
    check_command_version("ffprobe", &[&ffprobe, "-version"], &[4, 1]).await?;
    check_command_version("Shaka Packager", &[&packager, "-version"], &[2, 6, 1]).await?;

    if cloud_destination {
        // v212 introduced the rsync fix the cloud node relies on. Only
        // required if the user asked for upload to cloud storage.
        check_command_version("Google Cloud SDK", &["gcloud", "--version"], &[212, 0, 0]).await?;
    }

    Ok(())
}
