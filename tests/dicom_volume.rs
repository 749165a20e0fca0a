mod common;

use std::fs;

use assert_matches::assert_matches;
use dicom_cohort::{DicomNiftiConverter, PipelineError, VolumeConverter};

use common::{read_nifti_u16, save_slice, slice_object, write_slice};
use dicom_core::{DataElement, PrimitiveValue, VR};
use dicom_dictionary_std::tags;

#[test]
fn stacks_slices_by_position_and_reorients_to_ras() {
    let tmp = tempfile::tempdir().unwrap();
    let series = tmp.path().join("series_1");
    let out = tmp.path().join("out");
    fs::create_dir_all(&series).unwrap();
    fs::create_dir_all(&out).unwrap();
    // File names run opposite to slice height.
    write_slice(&series.join("a.dcm"), 2, 3);
    write_slice(&series.join("b.dcm"), 1, 2);
    write_slice(&series.join("c.dcm"), 0, 1);

    DicomNiftiConverter::new("dcm")
        .convert_directory(&series, &out)
        .unwrap();

    let produced: Vec<_> = fs::read_dir(&out).unwrap().map(|e| e.unwrap().path()).collect();
    assert_eq!(produced.len(), 1);
    assert!(produced[0].ends_with("7_t1_mprage.nii"));

    let (dims, datatype, pixdim, voxels) = read_nifti_u16(&produced[0]);
    assert_eq!(dims, [3, 2, 3]);
    assert_eq!(datatype, 512);
    assert_eq!(pixdim, [0.75, 0.5, 1.0]);
    assert_eq!(voxels.len(), 18);
    // LPS rows/columns are flipped into RAS: the first voxel is the last
    // pixel of the lowest slice.
    assert_eq!(voxels[0], 12);
    assert_eq!(voxels[1], 11);
    assert_eq!(voxels[3], 2);
    assert_eq!(voxels[12], 212);
}

#[test]
fn unreadable_slice_fails_the_series() {
    let tmp = tempfile::tempdir().unwrap();
    let series = tmp.path().join("series_1");
    fs::create_dir_all(&series).unwrap();
    write_slice(&series.join("a.dcm"), 0, 1);
    write_slice(&series.join("b.dcm"), 1, 2);
    fs::write(series.join("c.dcm"), b"not dicom at all").unwrap();

    let err = DicomNiftiConverter::new("dcm")
        .convert_directory(&series, tmp.path())
        .unwrap_err();

    assert_matches!(err, PipelineError::Dicom { .. });
}

#[test]
fn companion_files_are_ignored() {
    let tmp = tempfile::tempdir().unwrap();
    let series = tmp.path().join("series_1");
    let out = tmp.path().join("out");
    fs::create_dir_all(series.join("notes")).unwrap();
    fs::create_dir_all(&out).unwrap();
    for z in 0..3 {
        write_slice(&series.join(format!("{z}.dcm")), z, i32::from(z) + 1);
    }
    fs::write(series.join("README.txt"), b"companion").unwrap();

    DicomNiftiConverter::new("dcm")
        .convert_directory(&series, &out)
        .unwrap();

    assert_eq!(fs::read_dir(&out).unwrap().count(), 1);
}

#[test]
fn instance_number_orders_slices_without_positions() {
    let tmp = tempfile::tempdir().unwrap();
    let series = tmp.path().join("series_1");
    let out = tmp.path().join("out");
    fs::create_dir_all(&series).unwrap();
    fs::create_dir_all(&out).unwrap();
    // Height z is stored as instance z + 1; file names run backwards.
    for (name, z) in [("a.dcm", 2_u16), ("b.dcm", 0), ("c.dcm", 1)] {
        let mut obj = slice_object(z, i32::from(z) + 1);
        obj.remove_element(tags::IMAGE_POSITION_PATIENT);
        save_slice(obj, &series.join(name));
    }

    DicomNiftiConverter::new("dcm")
        .convert_directory(&series, &out)
        .unwrap();

    let produced: Vec<_> = fs::read_dir(&out).unwrap().map(|e| e.unwrap().path()).collect();
    let (dims, _, pixdim, voxels) = read_nifti_u16(&produced[0]);
    assert_eq!(dims, [3, 2, 3]);
    assert_eq!(pixdim[2], 1.0);
    assert_eq!(voxels[0], 12);
    assert_eq!(voxels[6], 112);
    assert_eq!(voxels[12], 212);
}

#[test]
fn negative_dimensions_are_rejected() {
    let tmp = tempfile::tempdir().unwrap();
    let series = tmp.path().join("series_1");
    fs::create_dir_all(&series).unwrap();
    for z in 0..3_u16 {
        let mut obj = slice_object(z, i32::from(z) + 1);
        obj.put(DataElement::new(tags::ROWS, VR::SS, PrimitiveValue::from(-2_i16)));
        save_slice(obj, &series.join(format!("{z}.dcm")));
    }

    let err = DicomNiftiConverter::new("dcm")
        .convert_directory(&series, tmp.path())
        .unwrap_err();

    assert_matches!(err, PipelineError::UnsupportedSeries { .. });
    assert!(err.to_string().contains("Rows"));
}
