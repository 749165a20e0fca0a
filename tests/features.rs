use std::path::{Path, PathBuf};

use dicom_cohort::features::{FeatureExtractor, SegmentationSet, TissueFeatures, collect_features};
use dicom_cohort::{Coordinator, LabelRecord, PipelineError};

struct FileSizeExtractor;

impl FeatureExtractor for FileSizeExtractor {
    fn extract(&self, gm: &Path, wm: &Path, csf: &Path) -> Result<TissueFeatures, PipelineError> {
        if gm.to_string_lossy().contains("corrupt") {
            return Err(PipelineError::Conversion("unreadable segmentation".into()));
        }
        let len = |p: &Path| p.as_os_str().len() as f64;
        Ok(TissueFeatures {
            gm_volume: len(gm),
            wm_volume: len(wm),
            csf_volume: len(csf),
        })
    }
}

fn subject(name: &str) -> SegmentationSet {
    let base = PathBuf::from("/seg").join(name);
    SegmentationSet {
        record: LabelRecord {
            file_path: PathBuf::from(format!("/nifti/F/MCI/60_79/{name}.nii")),
            category: "F".into(),
            stage: "MCI".into(),
            age_range: "60-79".into(),
        },
        grey_matter: base.join("gm.nii"),
        white_matter: base.join("wm.nii"),
        csf: base.join("csf.nii"),
    }
}

#[test]
fn features_follow_their_subject_and_failures_stay_local() {
    let subjects = vec![subject("series_1"), subject("corrupt"), subject("series_3")];

    let outcomes = collect_features(&Coordinator::parallel(2), &FileSizeExtractor, subjects);

    assert_eq!(outcomes.len(), 3);
    assert!(outcomes[1].result.is_err());
    let first = outcomes[0].result.as_ref().unwrap();
    assert_eq!(first.to_vec().len(), 3);
    assert_eq!(first.gm_volume, "/seg/series_1/gm.nii".len() as f64);
    assert_eq!(outcomes[2].item.record.file_path, PathBuf::from("/nifti/F/MCI/60_79/series_3.nii"));
}
