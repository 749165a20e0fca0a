//! Turns zipped DICOM archives named `<category>_<stage>_<minAge>_<maxAge>.zip`
//! into a labeled NIfTI cohort.
//!
//! The canonical trees double as the label store: a volume at
//! `nifti/<category>/<stage>/<minAge>_<maxAge>/series_<n>.nii` carries its
//! labels in its path, and [`labels::collect_label_records`] reads them back.

pub mod archive;
pub mod config;
pub mod convert;
pub mod dicom_volume;
pub mod error;
pub mod features;
pub mod fs_util;
pub mod labels;
pub mod nifti;
pub mod normalize;
pub mod parallel;
pub mod pipeline;

pub use archive::ArchiveLabel;
pub use config::{ConfigBuilder, LabelVocabulary, PipelineConfig};
pub use convert::{BatchConverter, ConversionSummary, SeriesOutcome};
pub use dicom_volume::{DicomNiftiConverter, VolumeConverter};
pub use error::PipelineError;
pub use labels::{LabelColumn, LabelRecord, OneHotLabels};
pub use normalize::{DirectoryNormalizer, OrganizeSummary};
pub use parallel::{Coordinator, ExecutionMode, JobOutcome};
pub use pipeline::{Pipeline, RunReport};
