//! Configuration loading.
//!
//! Three YAML documents configure a run: input, pipeline, and bitrate.
//! Unrecognised fields are rejected everywhere, and serde's messages are
//! mapped onto the typed configuration errors so the user always sees the
//! record and field that failed.

pub mod bitrate;
pub mod input;
pub mod pipeline;

pub use bitrate::{
    AudioChannelLayout, AudioCodec, BitrateConfig, BitrateString, VideoCodec, VideoCodecName,
    VideoResolution,
};
pub use input::{Input, InputConfig, InputType, MediaKind, SinglePeriod};
pub use pipeline::{
    Encryption, EncryptionConfig, ManifestFormat, PipelineConfig, RawKeyConfig, StreamingMode,
    UtcTimingPair,
};

use std::path::Path;

use serde::de::DeserializeOwned;

use crate::error::{Error, Result};

/// Parse a YAML document into `T`, mapping serde failures onto the typed
/// config errors. `record` names the document kind (e.g. "PipelineConfig").
pub fn from_yaml_str<T: DeserializeOwned>(record: &str, text: &str) -> Result<T> {
    serde_yaml::from_str(text).map_err(|err| classify_yaml_error(record, &err))
}

/// Read and parse one YAML config file.
pub fn load_yaml_file<T: DeserializeOwned>(record: &str, path: &Path) -> Result<T> {
    let text = std::fs::read_to_string(path)?;
    from_yaml_str(record, &text)
}

fn classify_yaml_error(record: &str, err: &serde_yaml::Error) -> Error {
    let message = err.to_string();

    let unknown = regex::Regex::new(r"unknown field `([^`]+)`").unwrap();
    if let Some(caps) = unknown.captures(&message) {
        return Error::UnrecognizedField {
            record: record.into(),
            field: caps[1].to_string(),
        };
    }

    let missing = regex::Regex::new(r"missing field `([^`]+)`").unwrap();
    if let Some(caps) = missing.captures(&message) {
        return Error::missing(record, &caps[1]);
    }

    let wrong_type = regex::Regex::new(r"invalid type: .*?, expected (.+?)(?: at line.*)?$").unwrap();
    if let Some(caps) = wrong_type.captures(&message) {
        let location = err
            .location()
            .map(|loc| format!("line {} column {}", loc.line(), loc.column()))
            .unwrap_or_else(|| "document".into());
        return Error::WrongType {
            record: record.into(),
            location,
            expected: caps[1].to_string(),
        };
    }

    Error::malformed(record, "document", message)
}

/// Load the input config file.
pub fn load_input_config(path: &Path) -> Result<InputConfig> {
    load_yaml_file("InputConfig", path)
}

/// Load the pipeline config file. [`PipelineConfig::finalize`] must still be
/// called once the bitrate config is known.
pub fn load_pipeline_config(path: &Path) -> Result<PipelineConfig> {
    load_yaml_file("PipelineConfig", path)
}

/// Load the optional bitrate config file, or the built-in defaults.
pub fn load_bitrate_config(path: Option<&Path>) -> Result<BitrateConfig> {
    match path {
        Some(p) => load_yaml_file("BitrateConfig", p),
        None => Ok(BitrateConfig::default()),
    }
}
