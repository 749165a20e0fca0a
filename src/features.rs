//! Seam for the tissue-volume feature extractor that runs outside this crate.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::PipelineError;
use crate::labels::LabelRecord;
use crate::parallel::{Coordinator, JobOutcome};

/// Grey matter, white matter and CSF segmentations of one subject.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentationSet {
    pub record: LabelRecord,
    pub grey_matter: PathBuf,
    pub white_matter: PathBuf,
    pub csf: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TissueFeatures {
    pub gm_volume: f64,
    pub wm_volume: f64,
    pub csf_volume: f64,
}

impl TissueFeatures {
    pub fn to_vec(self) -> Vec<f64> {
        vec![self.gm_volume, self.wm_volume, self.csf_volume]
    }
}

pub trait FeatureExtractor: Sync {
    fn extract(
        &self,
        grey_matter: &Path,
        white_matter: &Path,
        csf: &Path,
    ) -> Result<TissueFeatures, PipelineError>;
}

/// Runs `extractor` for every subject; failures stay attached to their subject.
pub fn collect_features<E: FeatureExtractor>(
    coordinator: &Coordinator,
    extractor: &E,
    subjects: Vec<SegmentationSet>,
) -> Vec<JobOutcome<SegmentationSet, TissueFeatures>> {
    coordinator.run("Extracting features", subjects, |subject| {
        extractor.extract(&subject.grey_matter, &subject.white_matter, &subject.csf)
    })
}
