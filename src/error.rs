//! Unified error type for streamforge.
//!
//! All modules funnel their failures into [`Error`]. Configuration and
//! dependency errors abort before any subprocess is launched; destination
//! errors abort before the transcoder/packager launch; a runtime error in any
//! node tears down the whole graph.

use std::fmt;

/// Unified error type covering all failure modes in streamforge.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A config record contained a field we do not recognize.
    #[error("{record} contains unrecognized field: {field}")]
    UnrecognizedField {
        /// The config record (e.g. "PipelineConfig").
        record: String,
        /// The offending field name.
        field: String,
    },

    /// A config field had the wrong type.
    #[error("In {record}, wrong type at {location}: expected {expected}")]
    WrongType {
        record: String,
        /// Where in the document the wrong type was found, e.g. a field name
        /// or "line 4 column 3".
        location: String,
        /// Human-readable description of the expected type.
        expected: String,
    },

    /// A required config field was absent.
    #[error("{record} is missing a required field: {field}")]
    MissingRequiredField { record: String, field: String },

    /// A config field was present but malformed or not allowed here.
    #[error("In {record}, {field} field is malformed: {reason}")]
    MalformedField {
        record: String,
        field: String,
        reason: String,
    },

    /// Two mutually-exclusive config fields were both given.
    #[error("In {record}, these fields are conflicting: {field1} and {field2}; consider using only one of them")]
    ConflictingFields {
        record: String,
        field1: String,
        field2: String,
    },

    /// Neither of two mutually-exclusive required fields was given.
    #[error("{record} is missing a required field; use exactly one of these fields: {field1} or {field2}")]
    MissingRequiredExclusiveFields {
        record: String,
        field1: String,
        field2: String,
    },

    /// The requested track does not exist in the input.
    #[error("In {record}, {media_kind} track {track_num} was not found in \"{name}\"")]
    InputNotFound {
        record: String,
        media_kind: String,
        track_num: u32,
        name: String,
    },

    /// An external dependency is missing, too old, or unidentifiable.
    #[error("{name}: {problem}{}", fmt_hint(.hint))]
    Dependency {
        /// Tool name (e.g. "FFmpeg").
        name: String,
        /// What is wrong with it.
        problem: String,
        /// One-line remediation hint, if we have one.
        hint: Option<String>,
    },

    /// The upload destination cannot be written to.
    #[error("Unable to write to cloud storage URL: {url}\nPlease double-check that the URL is correct, that you are signed into the cloud CLI, and that you have access to the destination bucket.")]
    Destination { url: String },

    /// A node's subprocess or task failed at runtime.
    #[error("{node} failed{}", fmt_exit(.exit_code))]
    Runtime {
        /// Node label (e.g. "TranscoderNode-0").
        node: String,
        /// Subprocess exit code, if the failure was a non-zero exit.
        exit_code: Option<i32>,
    },

    /// An I/O operation failed.
    #[error("IO error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    /// Catch-all for unexpected internal errors.
    #[error("Internal error: {0}")]
    Internal(String),
}

fn fmt_hint(hint: &Option<String>) -> String {
    match hint {
        Some(h) => format!("\n  {h}"),
        None => String::new(),
    }
}

fn fmt_exit(code: &Option<i32>) -> String {
    match code {
        Some(c) => format!(" with exit code {c}"),
        None => String::new(),
    }
}

impl Error {
    /// Convenience constructor for [`Error::MalformedField`].
    pub fn malformed(
        record: impl Into<String>,
        field: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Error::MalformedField {
            record: record.into(),
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Convenience constructor for [`Error::MissingRequiredField`].
    pub fn missing(record: impl Into<String>, field: impl Into<String>) -> Self {
        Error::MissingRequiredField {
            record: record.into(),
            field: field.into(),
        }
    }

    /// Convenience constructor for [`Error::Dependency`].
    pub fn dependency(
        name: impl Into<String>,
        problem: impl fmt::Display,
        hint: Option<String>,
    ) -> Self {
        Error::Dependency {
            name: name.into(),
            problem: problem.to_string(),
            hint,
        }
    }

    /// Convenience constructor for [`Error::Runtime`].
    pub fn runtime(node: impl Into<String>, exit_code: Option<i32>) -> Self {
        Error::Runtime {
            node: node.into(),
            exit_code,
        }
    }

    /// True for errors that must abort before any subprocess is launched.
    pub fn is_startup_error(&self) -> bool {
        !matches!(self, Error::Runtime { .. })
    }

    /// The process exit code this error should map to.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Runtime {
                exit_code: Some(c), ..
            } => *c,
            _ => 1,
        }
    }
}

/// Result alias using the crate-level [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
