use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use crate::config::PipelineConfig;
use crate::convert::{BatchConverter, ConversionSummary};
use crate::dicom_volume::VolumeConverter;
use crate::error::PipelineError;
use crate::labels::{self, LabelColumn, LabelRecord, OneHotLabels};
use crate::normalize::{DirectoryNormalizer, OrganizeSummary};
use crate::parallel::Coordinator;

pub const LABELS_CSV: &str = "labels.csv";
pub const LABELS_JSON: &str = "labels.json";
pub const ONE_HOT_JSON: &str = "labels_one_hot.json";
pub const RUN_REPORT_JSON: &str = "run_report.json";

#[derive(Debug, Default, Clone, Serialize)]
pub struct ArchiveCounts {
    pub seen: usize,
    pub organized: usize,
    pub skipped: usize,
    pub series: usize,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct SeriesCounts {
    pub discovered: usize,
    pub converted: usize,
    pub skipped: usize,
    pub no_output: usize,
    pub failed: usize,
}

/// What one invocation did, stage by stage.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub version: String,
    pub archives: Option<ArchiveCounts>,
    pub series: Option<SeriesCounts>,
    pub label_records: Option<usize>,
    pub failures: Vec<String>,
}

impl RunReport {
    pub fn start() -> Self {
        RunReport {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            finished_at: None,
            version: env!("CARGO_PKG_VERSION").to_string(),
            archives: None,
            series: None,
            label_records: None,
            failures: Vec::new(),
        }
    }

    pub fn record_organize(&mut self, summary: &OrganizeSummary) {
        self.archives = Some(ArchiveCounts {
            seen: summary.organized.len() + summary.skipped.len(),
            organized: summary.organized.len(),
            skipped: summary.skipped.len(),
            series: summary.series_count(),
        });
        self.failures.extend(
            summary
                .skipped
                .iter()
                .map(|s| format!("{}: {}", s.archive.display(), s.reason)),
        );
    }

    pub fn record_conversion(&mut self, summary: &ConversionSummary) {
        self.series = Some(SeriesCounts {
            discovered: summary.discovered,
            converted: summary.converted.len(),
            skipped: summary.skipped,
            no_output: summary.no_output,
            failed: summary.failed.len(),
        });
        self.failures.extend(
            summary
                .failed
                .iter()
                .map(|(path, reason)| format!("{}: {reason}", path.display())),
        );
    }
}

#[derive(Debug, Clone)]
pub struct LabelOutput {
    pub records: Vec<LabelRecord>,
    pub one_hot: OneHotLabels,
}

/// Runs the stages against one configuration; each stage can also run alone.
pub struct Pipeline {
    config: Arc<PipelineConfig>,
    converter: Arc<dyn VolumeConverter>,
    coordinator: Coordinator,
    pretty: bool,
}

impl Pipeline {
    pub fn new(
        config: Arc<PipelineConfig>,
        converter: Arc<dyn VolumeConverter>,
        coordinator: Coordinator,
    ) -> Self {
        Self {
            config,
            converter,
            coordinator,
            pretty: false,
        }
    }

    pub fn with_pretty_output(mut self, pretty: bool) -> Self {
        self.pretty = pretty;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn organize(&self) -> Result<OrganizeSummary, PipelineError> {
        DirectoryNormalizer::new(&self.config).organize_all()
    }

    pub fn convert(&self) -> Result<ConversionSummary, PipelineError> {
        BatchConverter::new(Arc::clone(&self.config), Arc::clone(&self.converter))
            .convert_all(&self.coordinator)
    }

    /// Rebuilds the label table from the volumetric tree and writes the exports.
    pub fn labels(&self, column: LabelColumn) -> Result<LabelOutput, PipelineError> {
        let records =
            labels::collect_label_records(&self.config.nifti_root(), &self.config.volume_extension)?;
        let one_hot = labels::encode_one_hot(&records, column, &self.config.vocabulary);

        let out = self.config.processed_dir();
        labels::write_records_csv(&records, &out.join(LABELS_CSV))?;
        labels::write_json(&records, &out.join(LABELS_JSON), self.pretty)?;
        labels::write_json(&one_hot, &out.join(ONE_HOT_JSON), self.pretty)?;
        info!(records = records.len(), classes = one_hot.classes.len(), "label table written");

        Ok(LabelOutput { records, one_hot })
    }

    /// organize -> convert -> labels, then the run report.
    pub fn run(&self, column: LabelColumn) -> Result<RunReport, PipelineError> {
        let mut report = RunReport::start();
        report.record_organize(&self.organize()?);
        report.record_conversion(&self.convert()?);
        report.label_records = Some(self.labels(column)?.records.len());
        self.finish(report)
    }

    /// Stamps the finish time and writes the report to the processed directory.
    pub fn finish(&self, mut report: RunReport) -> Result<RunReport, PipelineError> {
        report.finished_at = Some(Utc::now());
        let path: PathBuf = self.config.processed_dir().join(RUN_REPORT_JSON);
        labels::write_json(&report, &path, self.pretty)?;
        info!(
            run_id = %report.run_id,
            failures = report.failures.len(),
            report = %path.display(),
            "run report written"
        );
        Ok(report)
    }
}
