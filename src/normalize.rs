//! Directory Normalizer: archive -> canonical `category/stage/ageRange/series_<n>` tree.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::archive::ArchiveLabel;
use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::fs_util::{self, ScratchDir};

const SERIES_PREFIX: &str = "series_";
const SCRATCH_SUFFIX: &str = "_extracted";

/// Result of normalizing one archive.
#[derive(Debug, Clone, Serialize)]
pub struct ArchiveOutcome {
    pub archive: PathBuf,
    pub label: ArchiveLabel,
    pub bucket: PathBuf,
    pub series: Vec<PathBuf>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SkippedArchive {
    pub archive: PathBuf,
    pub reason: String,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct OrganizeSummary {
    pub organized: Vec<ArchiveOutcome>,
    pub skipped: Vec<SkippedArchive>,
}

impl OrganizeSummary {
    pub fn series_count(&self) -> usize {
        self.organized.iter().map(|a| a.series.len()).sum()
    }
}

pub struct DirectoryNormalizer<'a> {
    config: &'a PipelineConfig,
}

impl<'a> DirectoryNormalizer<'a> {
    pub fn new(config: &'a PipelineConfig) -> Self {
        Self { config }
    }

    /// Normalizes every `.zip` archive in the input directory, one at a time.
    ///
    /// Each run is a fresh derivation: the buckets the archives map to are
    /// cleared first, together with their volumes, so a re-run reproduces the
    /// same trees. Per-archive failures are logged and recorded; they never
    /// stop the loop.
    pub fn organize_all(&self) -> Result<OrganizeSummary, PipelineError> {
        let archives = self.list_archives()?;
        info!(count = archives.len(), dir = %self.config.archive_dir.display(), "organizing archives");
        self.reset_buckets(&archives)?;

        let mut summary = OrganizeSummary::default();
        for archive in archives {
            match self.organize_archive(&archive) {
                Ok(outcome) => {
                    info!(
                        archive = %archive.display(),
                        series = outcome.series.len(),
                        "extraction and organization completed"
                    );
                    summary.organized.push(outcome);
                }
                Err(err) => {
                    warn!(archive = %archive.display(), error = %err, "skipping archive");
                    summary.skipped.push(SkippedArchive {
                        archive,
                        reason: err.to_string(),
                    });
                }
            }
        }
        Ok(summary)
    }

    /// Input archives in file-name order.
    pub fn list_archives(&self) -> Result<Vec<PathBuf>, PipelineError> {
        let dir = &self.config.archive_dir;
        let mut archives = Vec::new();
        for name in fs_util::list_names(dir)? {
            let path = dir.join(&name);
            if path.is_file() && fs_util::has_extension(&path, "zip") {
                archives.push(path);
            } else {
                debug!(entry = %path.display(), "ignoring non-archive entry");
            }
        }
        Ok(archives)
    }

    /// Extracts one archive and copies each slice-bearing directory into a new
    /// series directory under the archive's bucket.
    ///
    /// The scratch extraction directory is removed on every exit path. Series
    /// copied before a failure stay in place.
    pub fn organize_archive(&self, archive: &Path) -> Result<ArchiveOutcome, PipelineError> {
        let label = ArchiveLabel::from_archive_path(archive)?;

        let scratch = ScratchDir::create(self.scratch_path(archive))?;
        let extracted = fs_util::extract_zip(archive, scratch.path())?;
        debug!(archive = %archive.display(), files = extracted, "archive extracted");

        let bucket = label.bucket_path(&self.config.dicom_root());
        fs::create_dir_all(&bucket).map_err(|err| PipelineError::io("create", &bucket, err))?;

        let mut next_index = next_series_index(&bucket)?;
        let mut series = Vec::new();
        for source in fs_util::dirs_with_extension(scratch.path(), &self.config.slice_extension)? {
            let dest = bucket.join(format!("{SERIES_PREFIX}{next_index}"));
            fs_util::copy_dir_recursive(&source, &dest)?;
            debug!(source = %source.display(), dest = %dest.display(), "series copied");
            series.push(dest);
            next_index += 1;
        }

        if series.is_empty() {
            warn!(archive = %archive.display(), "archive contains no slice files");
        }

        Ok(ArchiveOutcome {
            archive: archive.to_path_buf(),
            label,
            bucket,
            series,
        })
    }

    /// Removes the DICOM bucket and the mirrored volume bucket of every
    /// archive whose name parses.
    fn reset_buckets(&self, archives: &[PathBuf]) -> Result<(), PipelineError> {
        let buckets: BTreeSet<ArchiveLabel> = archives
            .iter()
            .filter_map(|archive| ArchiveLabel::from_archive_path(archive).ok())
            .collect();
        for label in buckets {
            for bucket in [
                label.bucket_path(&self.config.dicom_root()),
                label.bucket_path(&self.config.nifti_root()),
            ] {
                if bucket.exists() {
                    fs::remove_dir_all(&bucket)
                        .map_err(|err| PipelineError::io("clear", &bucket, err))?;
                    debug!(bucket = %bucket.display(), "cleared previous derivation");
                }
            }
        }
        Ok(())
    }

    fn scratch_path(&self, archive: &Path) -> PathBuf {
        let base = archive
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.config
            .scratch_root()
            .join(format!("{base}{SCRATCH_SUFFIX}"))
    }
}

/// Index for the next `series_<n>` directory in `bucket`, one past the highest present.
pub fn next_series_index(bucket: &Path) -> Result<usize, PipelineError> {
    let highest = fs_util::list_names(bucket)?
        .iter()
        .filter_map(|name| name.strip_prefix(SERIES_PREFIX)?.parse::<usize>().ok())
        .max()
        .unwrap_or(0);
    Ok(highest + 1)
}
