use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("missing required configuration value: {0}")]
    MissingConfig(&'static str),

    #[error("required directory does not exist: {0}")]
    MissingDirectory(PathBuf),

    #[error("failed to parse config file {path}: {message}")]
    ConfigParse { path: PathBuf, message: String },

    #[error("unexpected archive name format: {name} (expected category_stage_minAge_maxAge)")]
    MalformedArchiveName { name: String },

    #[error("archive {path} is corrupted and cannot be opened: {reason}")]
    CorruptArchive { path: PathBuf, reason: String },

    #[error("archive entry escapes extraction directory: {0}")]
    UnsafeArchiveEntry(String),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("directory walk failed: {0}")]
    Walk(#[from] walkdir::Error),

    #[error("failed to read DICOM file {path}: {message}")]
    Dicom { path: PathBuf, message: String },

    #[error("series {path} cannot be converted: {reason}")]
    UnsupportedSeries { path: PathBuf, reason: String },

    #[error("conversion failed: {0}")]
    Conversion(String),

    #[error("job panicked: {0}")]
    JobPanicked(String),

    #[error("failed to serialize output: {0}")]
    Serialization(String),

    #[error("label value {value:?} is not part of the configured vocabulary")]
    UnknownLabel { value: String },
}

impl PipelineError {
    /// Wraps an I/O error with the operation and path it came from.
    pub fn io(action: &str, path: &Path, source: io::Error) -> Self {
        PipelineError::Io {
            context: format!("{action} {}", path.display()),
            source,
        }
    }

    pub fn dicom(path: &Path, err: impl std::fmt::Display) -> Self {
        PipelineError::Dicom {
            path: path.to_path_buf(),
            message: err.to_string(),
        }
    }

    pub fn unsupported(path: &Path, reason: impl Into<String>) -> Self {
        PipelineError::UnsupportedSeries {
            path: path.to_path_buf(),
            reason: reason.into(),
        }
    }

    /// Structural violations abort the run before any processing starts.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            PipelineError::MissingConfig(_)
                | PipelineError::MissingDirectory(_)
                | PipelineError::ConfigParse { .. }
        )
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(err: serde_json::Error) -> Self {
        PipelineError::Serialization(err.to_string())
    }
}

impl From<csv::Error> for PipelineError {
    fn from(err: csv::Error) -> Self {
        PipelineError::Serialization(err.to_string())
    }
}

pub type Result<T, E = PipelineError> = std::result::Result<T, E>;
