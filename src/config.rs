//! Pipeline configuration.
//!
//! Built once at startup from (lowest to highest precedence) defaults, an
//! optional TOML file, and environment variables, then shared read-only.

use std::fs;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::PipelineError;

pub const ENV_DOWNLOADED_DATA_PATH: &str = "DOWNLOADED_DATA_PATH";
pub const ENV_ROOT_DATA_PATH: &str = "ROOT_DATA_PATH";
pub const ENV_GENRES: &str = "GENRES";
pub const ENV_STAGES: &str = "STAGES";
pub const ENV_AGES: &str = "AGES";

pub const DEFAULT_SLICE_EXTENSION: &str = "dcm";
pub const DEFAULT_VOLUME_EXTENSION: &str = "nii";
pub const DEFAULT_MIN_SLICES: usize = 3;

/// Known label values per column. Empty lists mean "derive from the data".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelVocabulary {
    #[serde(default)]
    pub categories: Vec<String>,
    #[serde(default)]
    pub stages: Vec<String>,
    #[serde(default)]
    pub age_ranges: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Directory holding the input ZIP archives.
    pub archive_dir: PathBuf,
    /// Root under which the canonical trees and processed outputs live.
    pub root_dir: PathBuf,
    pub slice_extension: String,
    pub volume_extension: String,
    pub min_slices: usize,
    pub workers: usize,
    pub vocabulary: LabelVocabulary,
}

#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    #[serde(default)]
    paths: FilePaths,
    #[serde(default)]
    data: FileData,
}

#[derive(Debug, Default, Deserialize)]
struct FilePaths {
    downloaded_data_path: Option<PathBuf>,
    root_data_path: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
struct FileData {
    #[serde(default)]
    genres: Vec<String>,
    #[serde(default)]
    stages: Vec<String>,
    #[serde(default)]
    ages: Vec<String>,
    slice_extension: Option<String>,
    volume_extension: Option<String>,
    min_slices: Option<usize>,
    workers: Option<usize>,
}

/// Partially resolved configuration, merged layer by layer.
#[derive(Debug, Default, Clone)]
pub struct ConfigBuilder {
    archive_dir: Option<PathBuf>,
    root_dir: Option<PathBuf>,
    slice_extension: Option<String>,
    volume_extension: Option<String>,
    min_slices: Option<usize>,
    workers: Option<usize>,
    vocabulary: LabelVocabulary,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Layers values from a TOML file with `[paths]` and `[data]` tables.
    pub fn with_file(mut self, path: &Path) -> Result<Self, PipelineError> {
        let content =
            fs::read_to_string(path).map_err(|err| PipelineError::io("read config", path, err))?;
        let parsed: FileConfig =
            toml::from_str(&content).map_err(|err| PipelineError::ConfigParse {
                path: path.to_path_buf(),
                message: err.to_string(),
            })?;
        debug!(config = %path.display(), "loaded config file");

        if let Some(dir) = parsed.paths.downloaded_data_path {
            self.archive_dir = Some(dir);
        }
        if let Some(dir) = parsed.paths.root_data_path {
            self.root_dir = Some(dir);
        }
        let data = parsed.data;
        if !data.genres.is_empty() {
            self.vocabulary.categories = data.genres;
        }
        if !data.stages.is_empty() {
            self.vocabulary.stages = data.stages;
        }
        if !data.ages.is_empty() {
            self.vocabulary.age_ranges = data.ages;
        }
        self.slice_extension = data.slice_extension.or(self.slice_extension);
        self.volume_extension = data.volume_extension.or(self.volume_extension);
        self.min_slices = data.min_slices.or(self.min_slices);
        self.workers = data.workers.or(self.workers);
        Ok(self)
    }

    /// Layers values from a variable lookup, normally `std::env::var`.
    pub fn with_lookup<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup(ENV_DOWNLOADED_DATA_PATH).and_then(clean_value) {
            self.archive_dir = Some(PathBuf::from(dir));
        }
        if let Some(dir) = lookup(ENV_ROOT_DATA_PATH).and_then(clean_value) {
            self.root_dir = Some(PathBuf::from(dir));
        }
        if let Some(list) = lookup(ENV_GENRES).map(|v| split_list(&v)) {
            self.vocabulary.categories = list;
        }
        if let Some(list) = lookup(ENV_STAGES).map(|v| split_list(&v)) {
            self.vocabulary.stages = list;
        }
        if let Some(list) = lookup(ENV_AGES).map(|v| split_list(&v)) {
            self.vocabulary.age_ranges = list;
        }
        self
    }

    pub fn with_env(self) -> Self {
        self.with_lookup(|key| std::env::var(key).ok())
    }

    pub fn archive_dir(mut self, dir: Option<PathBuf>) -> Self {
        if dir.is_some() {
            self.archive_dir = dir;
        }
        self
    }

    pub fn root_dir(mut self, dir: Option<PathBuf>) -> Self {
        if dir.is_some() {
            self.root_dir = dir;
        }
        self
    }

    pub fn workers(mut self, workers: Option<usize>) -> Self {
        if workers.is_some() {
            self.workers = workers;
        }
        self
    }

    pub fn build(self) -> Result<PipelineConfig, PipelineError> {
        let archive_dir = self
            .archive_dir
            .ok_or(PipelineError::MissingConfig(ENV_DOWNLOADED_DATA_PATH))?;
        let root_dir = self
            .root_dir
            .ok_or(PipelineError::MissingConfig(ENV_ROOT_DATA_PATH))?;

        Ok(PipelineConfig {
            archive_dir,
            root_dir,
            slice_extension: self
                .slice_extension
                .unwrap_or_else(|| DEFAULT_SLICE_EXTENSION.to_string()),
            volume_extension: self
                .volume_extension
                .unwrap_or_else(|| DEFAULT_VOLUME_EXTENSION.to_string()),
            min_slices: self.min_slices.unwrap_or(DEFAULT_MIN_SLICES),
            workers: self
                .workers
                .filter(|&n| n > 0)
                .unwrap_or_else(default_workers),
            vocabulary: self.vocabulary,
        })
    }
}

impl PipelineConfig {
    /// Configuration with default extensions and thresholds for the given directories.
    pub fn new(archive_dir: impl Into<PathBuf>, root_dir: impl Into<PathBuf>) -> Self {
        PipelineConfig {
            archive_dir: archive_dir.into(),
            root_dir: root_dir.into(),
            slice_extension: DEFAULT_SLICE_EXTENSION.to_string(),
            volume_extension: DEFAULT_VOLUME_EXTENSION.to_string(),
            min_slices: DEFAULT_MIN_SLICES,
            workers: default_workers(),
            vocabulary: LabelVocabulary::default(),
        }
    }

    pub fn raw_data_dir(&self) -> PathBuf {
        self.root_dir.join("raw_data")
    }

    /// Canonical DICOM tree.
    pub fn dicom_root(&self) -> PathBuf {
        self.raw_data_dir().join("dicom")
    }

    /// Canonical volumetric tree.
    pub fn nifti_root(&self) -> PathBuf {
        self.raw_data_dir().join("nifti")
    }

    /// Transient extraction area, kept outside both canonical trees.
    pub fn scratch_root(&self) -> PathBuf {
        self.raw_data_dir().join(".scratch")
    }

    pub fn processed_dir(&self) -> PathBuf {
        self.root_dir.join("processed_data")
    }

    /// Checks required inputs and creates the output layout. Any error here is fatal.
    pub fn validate(&self) -> Result<(), PipelineError> {
        if !self.archive_dir.is_dir() {
            return Err(PipelineError::MissingDirectory(self.archive_dir.clone()));
        }
        for dir in [
            self.dicom_root(),
            self.nifti_root(),
            self.scratch_root(),
            self.processed_dir(),
        ] {
            fs::create_dir_all(&dir).map_err(|err| PipelineError::io("create", &dir, err))?;
        }
        Ok(())
    }
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(1)
}

fn clean_value(raw: String) -> Option<String> {
    let value = raw.trim().trim_matches('"').trim().to_string();
    if value.is_empty() { None } else { Some(value) }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|item| item.trim().trim_matches('"').trim())
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}
