//! Batch Converter: canonical DICOM tree -> canonical volumetric tree.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::PipelineConfig;
use crate::dicom_volume::VolumeConverter;
use crate::error::PipelineError;
use crate::fs_util::{self, ScratchDir};
use crate::parallel::{BatchSummary, Coordinator, JobOutcome};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SeriesOutcome {
    Converted { volume: PathBuf },
    /// Fewer slice files than the configured minimum, typically a localizer.
    Skipped { slices: usize },
    /// The converter returned without producing a new file.
    NoOutput,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct ConversionSummary {
    pub discovered: usize,
    pub converted: Vec<PathBuf>,
    pub skipped: usize,
    pub no_output: usize,
    pub failed: Vec<(PathBuf, String)>,
}

impl ConversionSummary {
    fn from_outcomes(outcomes: Vec<JobOutcome<PathBuf, SeriesOutcome>>) -> Self {
        let mut summary = ConversionSummary {
            discovered: outcomes.len(),
            ..Default::default()
        };
        for outcome in outcomes {
            match outcome.result {
                Ok(SeriesOutcome::Converted { volume }) => summary.converted.push(volume),
                Ok(SeriesOutcome::Skipped { .. }) => summary.skipped += 1,
                Ok(SeriesOutcome::NoOutput) => summary.no_output += 1,
                Err(err) => summary.failed.push((outcome.item, err.to_string())),
            }
        }
        summary
    }
}

pub struct BatchConverter {
    config: Arc<PipelineConfig>,
    converter: Arc<dyn VolumeConverter>,
}

impl BatchConverter {
    pub fn new(config: Arc<PipelineConfig>, converter: Arc<dyn VolumeConverter>) -> Self {
        Self { config, converter }
    }

    /// Every directory under the canonical DICOM root that holds slice files.
    pub fn discover_series(&self) -> Result<Vec<PathBuf>, PipelineError> {
        fs_util::dirs_with_extension(&self.config.dicom_root(), &self.config.slice_extension)
    }

    /// Where the volume for `series_dir` belongs: its parent mirrored under the volumetric root.
    pub fn output_dir_for(&self, series_dir: &Path) -> Result<PathBuf, PipelineError> {
        let dicom_root = self.config.dicom_root();
        let parent = series_dir.parent().unwrap_or(series_dir);
        let relative = parent.strip_prefix(&dicom_root).map_err(|_| {
            PipelineError::unsupported(series_dir, format!("not below {}", dicom_root.display()))
        })?;
        Ok(self.config.nifti_root().join(relative))
    }

    /// Converts one series directory, or skips it when it has too few slices.
    pub fn convert_series(&self, series_dir: &Path) -> Result<SeriesOutcome, PipelineError> {
        let slices = fs_util::count_files_with_extension(series_dir, &self.config.slice_extension)?;
        if slices < self.config.min_slices {
            warn!(
                series = %series_dir.display(),
                slices,
                reason = "TOO_FEW_SLICES/LOCALIZER",
                "skipped series"
            );
            return Ok(SeriesOutcome::Skipped { slices });
        }

        let output_dir = self.output_dir_for(series_dir)?;
        fs::create_dir_all(&output_dir)
            .map_err(|err| PipelineError::io("create", &output_dir, err))?;

        let series_name = series_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| PipelineError::unsupported(series_dir, "series directory has no name"))?;
        let final_path = output_dir.join(format!("{series_name}.{}", self.config.volume_extension));

        // Each job converts into its own staging directory so concurrent jobs
        // sharing a bucket never see each other's files in the listing diff.
        let staging = ScratchDir::create(output_dir.join(format!(".{series_name}.staging")))?;
        let before = fs_util::list_names(staging.path())?;
        self.converter.convert_directory(series_dir, staging.path())?;
        let after = fs_util::list_names(staging.path())?;

        let mut created = after.difference(&before);
        let Some(new_file) = created.next() else {
            warn!(series = %series_dir.display(), "conversion produced no new file");
            return Ok(SeriesOutcome::NoOutput);
        };
        if let Some(extra) = created.next() {
            warn!(series = %series_dir.display(), extra = %extra, "conversion produced more than one file, keeping the first");
        }

        let produced = staging.path().join(new_file);
        fs::rename(&produced, &final_path)
            .map_err(|err| PipelineError::io("rename", &produced, err))?;
        debug!(series = %series_dir.display(), volume = %final_path.display(), "series converted");
        Ok(SeriesOutcome::Converted { volume: final_path })
    }

    /// Discovers and converts every series through `coordinator`.
    pub fn convert_all(&self, coordinator: &Coordinator) -> Result<ConversionSummary, PipelineError> {
        let series = self.discover_series()?;
        info!(count = series.len(), root = %self.config.dicom_root().display(), "converting series");

        let outcomes = coordinator.run("Converting series", series, |dir| self.convert_series(dir));
        let batch = BatchSummary::of(&outcomes);
        let summary = ConversionSummary::from_outcomes(outcomes);
        info!(
            succeeded = batch.succeeded,
            failed = batch.failed,
            converted = summary.converted.len(),
            skipped = summary.skipped,
            no_output = summary.no_output,
            "conversion finished"
        );
        Ok(summary)
    }
}
