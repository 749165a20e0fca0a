#![allow(dead_code)]

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use dicom_cohort::{PipelineConfig, PipelineError, VolumeConverter};
use tempfile::TempDir;
use zip::ZipWriter;
use zip::write::FileOptions;

pub struct Workspace {
    pub tmp: TempDir,
    pub config: PipelineConfig,
}

impl Workspace {
    pub fn new() -> Self {
        let tmp = tempfile::tempdir().unwrap();
        let archives = tmp.path().join("downloads");
        fs::create_dir_all(&archives).unwrap();
        let mut config = PipelineConfig::new(archives, tmp.path().join("data"));
        config.workers = 4;
        config.validate().unwrap();
        Workspace { tmp, config }
    }

    pub fn archive_path(&self, name: &str) -> PathBuf {
        self.config.archive_dir.join(name)
    }

    /// Writes a ZIP archive into the input directory.
    pub fn add_archive(&self, name: &str, entries: &[(&str, &[u8])]) -> PathBuf {
        let path = self.archive_path(name);
        write_zip(&path, entries);
        path
    }

    /// Creates a canonical series directory holding `slices` fake slice files.
    pub fn add_series(&self, bucket: &str, series: &str, slices: usize) -> PathBuf {
        let dir = self.config.dicom_root().join(bucket).join(series);
        fs::create_dir_all(&dir).unwrap();
        for i in 0..slices {
            fs::write(dir.join(format!("IM{i:04}.dcm")), b"slice").unwrap();
        }
        dir
    }
}

pub fn write_zip(path: &Path, entries: &[(&str, &[u8])]) {
    let file = fs::File::create(path).unwrap();
    let mut zip = ZipWriter::new(file);
    for (name, content) in entries {
        zip.start_file(*name, FileOptions::default()).unwrap();
        zip.write_all(content).unwrap();
    }
    zip.finish().unwrap();
}

/// Writes one placeholder volume per call, named after the series directory
/// the way a real converter picks its own name.
pub struct FakeConverter;

impl VolumeConverter for FakeConverter {
    fn convert_directory(&self, series_dir: &Path, output_dir: &Path) -> Result<(), PipelineError> {
        let name = series_dir.file_name().unwrap().to_string_lossy();
        fs::write(output_dir.join(format!("converted_{name}.nii")), b"volume")
            .map_err(|err| PipelineError::io("write", output_dir, err))
    }
}

/// Fails for series whose directory name matches, converts the rest.
pub struct FaultyConverter {
    pub failing_series: String,
    pub panic: bool,
}

impl VolumeConverter for FaultyConverter {
    fn convert_directory(&self, series_dir: &Path, output_dir: &Path) -> Result<(), PipelineError> {
        if series_dir.ends_with(&self.failing_series) {
            if self.panic {
                panic!("converter crashed on {}", series_dir.display());
            }
            return Err(PipelineError::Conversion("malformed slices".into()));
        }
        FakeConverter.convert_directory(series_dir, output_dir)
    }
}

/// Succeeds without writing anything.
pub struct SilentConverter;

impl VolumeConverter for SilentConverter {
    fn convert_directory(&self, _series_dir: &Path, _output_dir: &Path) -> Result<(), PipelineError> {
        Ok(())
    }
}

pub fn relative_files(root: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = walkdir::WalkDir::new(root)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.path().strip_prefix(root).unwrap().to_path_buf())
        .collect();
    files.sort();
    files
}

pub const SLICE_ROWS: u16 = 2;
pub const SLICE_COLUMNS: u16 = 3;

/// Writes a 2x3, 16-bit axial MR slice at height `z`. Pixel `(row, col)`
/// of slice `z` holds `100 * z + 10 * row + col`.
pub fn write_slice(path: &Path, z: u16, instance: i32) {
    save_slice(slice_object(z, instance), path);
}

/// The in-memory dataset behind [`write_slice`], for tests that alter tags
/// before saving.
pub fn slice_object(z: u16, instance: i32) -> dicom_object::InMemDicomObject {
    use dicom_core::{DataElement, PrimitiveValue, VR};
    use dicom_dictionary_std::tags;
    use dicom_object::InMemDicomObject;

    let strs = |values: &[&str]| {
        PrimitiveValue::Strs(values.iter().map(|v| v.to_string()).collect::<Vec<_>>().into())
    };
    let mut pixels = Vec::new();
    for row in 0..SLICE_ROWS {
        for col in 0..SLICE_COLUMNS {
            pixels.extend_from_slice(&(100 * z + 10 * row + col).to_le_bytes());
        }
    }
    let sop_instance = format!("1.2.826.0.1.3680043.2.1125.{instance}");
    let z_text = z.to_string();

    InMemDicomObject::from_element_iter([
        DataElement::new(tags::SOP_CLASS_UID, VR::UI, PrimitiveValue::from(MR_STORAGE)),
        DataElement::new(tags::SOP_INSTANCE_UID, VR::UI, PrimitiveValue::from(sop_instance.as_str())),
        DataElement::new(tags::MODALITY, VR::CS, PrimitiveValue::from("MR")),
        DataElement::new(tags::SERIES_DESCRIPTION, VR::LO, PrimitiveValue::from("t1 mprage")),
        DataElement::new(tags::SERIES_NUMBER, VR::IS, PrimitiveValue::from("7")),
        DataElement::new(tags::INSTANCE_NUMBER, VR::IS, PrimitiveValue::from(instance.to_string().as_str())),
        DataElement::new(tags::IMAGE_POSITION_PATIENT, VR::DS, strs(&["0", "0", z_text.as_str()])),
        DataElement::new(tags::IMAGE_ORIENTATION_PATIENT, VR::DS, strs(&["1", "0", "0", "0", "1", "0"])),
        DataElement::new(tags::SAMPLES_PER_PIXEL, VR::US, PrimitiveValue::from(1_u16)),
        DataElement::new(tags::PHOTOMETRIC_INTERPRETATION, VR::CS, PrimitiveValue::from("MONOCHROME2")),
        DataElement::new(tags::ROWS, VR::US, PrimitiveValue::from(SLICE_ROWS)),
        DataElement::new(tags::COLUMNS, VR::US, PrimitiveValue::from(SLICE_COLUMNS)),
        DataElement::new(tags::PIXEL_SPACING, VR::DS, strs(&["0.5", "0.75"])),
        DataElement::new(tags::BITS_ALLOCATED, VR::US, PrimitiveValue::from(16_u16)),
        DataElement::new(tags::BITS_STORED, VR::US, PrimitiveValue::from(16_u16)),
        DataElement::new(tags::HIGH_BIT, VR::US, PrimitiveValue::from(15_u16)),
        DataElement::new(tags::PIXEL_REPRESENTATION, VR::US, PrimitiveValue::from(0_u16)),
        DataElement::new(tags::PIXEL_DATA, VR::OW, PrimitiveValue::from(pixels)),
    ])
}

const MR_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.4";

/// Saves `obj` as an explicit VR little endian Part 10 file.
pub fn save_slice(obj: dicom_object::InMemDicomObject, path: &Path) {
    use dicom_dictionary_std::tags;
    use dicom_object::FileMetaTableBuilder;

    let sop_instance = obj
        .element(tags::SOP_INSTANCE_UID)
        .unwrap()
        .to_str()
        .unwrap()
        .trim_end_matches('\0')
        .to_string();
    obj.with_meta(
        FileMetaTableBuilder::new()
            .transfer_syntax("1.2.840.10008.1.2.1")
            .media_storage_sop_class_uid(MR_STORAGE)
            .media_storage_sop_instance_uid(sop_instance.as_str()),
    )
    .unwrap()
    .write_to_file(path)
    .unwrap();
}

/// Reads back `(dims, datatype, pixdim, voxels)` of a 16-bit NIfTI-1 file.
pub fn read_nifti_u16(path: &Path) -> ([i16; 3], i16, [f32; 3], Vec<u16>) {
    let bytes = fs::read(path).unwrap();
    let i16_at = |o: usize| i16::from_le_bytes([bytes[o], bytes[o + 1]]);
    let f32_at = |o: usize| f32::from_le_bytes(bytes[o..o + 4].try_into().unwrap());
    assert_eq!(&bytes[344..348], b"n+1\0");
    let dims = [i16_at(42), i16_at(44), i16_at(46)];
    let pixdim = [f32_at(80), f32_at(84), f32_at(88)];
    let voxels = bytes[352..]
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect();
    (dims, i16_at(70), pixdim, voxels)
}
