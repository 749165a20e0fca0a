//! Slice-to-volume conversion for one series directory.

use std::borrow::Cow;
use std::path::{Path, PathBuf};

use dicom::encoding::TransferSyntaxIndex;
use dicom::encoding::transfer_syntax::Codec;
use dicom::transfer_syntax::TransferSyntaxRegistry;
use dicom_core::Tag;
use dicom_core::value::{PrimitiveValue, Value};
use dicom_dictionary_std::tags;
use dicom_object::{DefaultDicomObject, OpenFileOptions};
use tracing::debug;

use crate::error::PipelineError;
use crate::fs_util;
use crate::nifti::{self, Affine, Volume, VoxelType};

/// Turns a directory of slice files into a volume file inside `output_dir`.
///
/// Implementations choose the output file name; callers locate the new file
/// by comparing the directory listing before and after the call.
pub trait VolumeConverter: Send + Sync {
    fn convert_directory(&self, series_dir: &Path, output_dir: &Path) -> Result<(), PipelineError>;
}

/// Reads uncompressed single-frame slices with `dicom-object` and writes a
/// RAS+ reoriented, uncompressed NIfTI-1 file.
#[derive(Debug, Clone)]
pub struct DicomNiftiConverter {
    slice_extension: String,
}

impl DicomNiftiConverter {
    pub fn new(slice_extension: impl Into<String>) -> Self {
        Self {
            slice_extension: slice_extension.into(),
        }
    }

    fn slice_files(&self, series_dir: &Path) -> Result<Vec<PathBuf>, PipelineError> {
        let mut files: Vec<PathBuf> = fs_util::list_names(series_dir)?
            .into_iter()
            .map(|name| series_dir.join(name))
            .filter(|path| path.is_file() && fs_util::has_extension(path, &self.slice_extension))
            .collect();
        files.sort();
        Ok(files)
    }
}

impl VolumeConverter for DicomNiftiConverter {
    fn convert_directory(&self, series_dir: &Path, output_dir: &Path) -> Result<(), PipelineError> {
        let files = self.slice_files(series_dir)?;
        let slices = files
            .iter()
            .map(|path| Slice::read(path))
            .collect::<Result<Vec<_>, _>>()?;

        let volume = assemble_volume(series_dir, slices)?.reoriented_to_ras();
        let output = output_dir.join(format!("{}.nii", volume.description));
        debug!(series = %series_dir.display(), output = %output.display(), dims = ?volume.dims, "writing volume");
        nifti::write_nifti(&volume, &output)
    }
}

#[derive(Debug)]
struct Slice {
    path: PathBuf,
    rows: usize,
    columns: usize,
    voxel_type: VoxelType,
    pixel_spacing: Option<[f64; 2]>,
    orientation: Option<[f64; 6]>,
    position: Option<[f64; 3]>,
    instance_number: Option<i32>,
    slice_thickness: Option<f64>,
    spacing_between_slices: Option<f64>,
    rescale: (f32, f32),
    series_number: Option<String>,
    series_description: Option<String>,
    pixels: Vec<u8>,
}

impl Slice {
    fn read(path: &Path) -> Result<Self, PipelineError> {
        let obj = OpenFileOptions::new()
            .open_file(path)
            .map_err(|err| PipelineError::dicom(path, err))?;

        let ts_uid = obj.meta().transfer_syntax().trim_end_matches('\0');
        match TransferSyntaxRegistry.get(ts_uid) {
            Some(ts) if matches!(ts.codec(), Codec::EncapsulatedPixelData(..)) => {
                return Err(PipelineError::unsupported(
                    path,
                    format!("compressed transfer syntax {}", ts.name()),
                ));
            }
            None => {
                return Err(PipelineError::unsupported(
                    path,
                    format!("unknown transfer syntax {ts_uid}"),
                ));
            }
            Some(_) => {}
        }

        let samples = read_int(&obj, tags::SAMPLES_PER_PIXEL).unwrap_or(1);
        if samples != 1 {
            return Err(PipelineError::unsupported(path, format!("{samples} samples per pixel")));
        }
        let frames = read_int(&obj, tags::NUMBER_OF_FRAMES).unwrap_or(1);
        if frames > 1 {
            return Err(PipelineError::unsupported(path, format!("multi-frame image ({frames} frames)")));
        }

        let rows = require_dimension(&obj, path, tags::ROWS, "Rows")?;
        let columns = require_dimension(&obj, path, tags::COLUMNS, "Columns")?;
        let bits = require_int(&obj, path, tags::BITS_ALLOCATED, "BitsAllocated")?;
        let signed = read_int(&obj, tags::PIXEL_REPRESENTATION).unwrap_or(0) == 1;
        let voxel_type = u16::try_from(bits)
            .ok()
            .and_then(|bits| VoxelType::from_dicom(bits, signed))
            .ok_or_else(|| PipelineError::unsupported(path, format!("{bits} bits allocated")))?;

        let expected = rows
            .checked_mul(columns)
            .and_then(|n| n.checked_mul(voxel_type.size()))
            .ok_or_else(|| PipelineError::unsupported(path, format!("{rows}x{columns} slice is too large")))?;
        let mut pixels = pixel_bytes(&obj, path)?.into_owned();
        if pixels.len() < expected {
            return Err(PipelineError::unsupported(
                path,
                format!("pixel data holds {} bytes, expected {expected}", pixels.len()),
            ));
        }
        pixels.truncate(expected);

        Ok(Slice {
            path: path.to_path_buf(),
            rows,
            columns,
            voxel_type,
            pixel_spacing: read_floats::<2>(&obj, tags::PIXEL_SPACING),
            orientation: read_floats::<6>(&obj, tags::IMAGE_ORIENTATION_PATIENT),
            position: read_floats::<3>(&obj, tags::IMAGE_POSITION_PATIENT),
            instance_number: read_int(&obj, tags::INSTANCE_NUMBER),
            slice_thickness: read_float(&obj, tags::SLICE_THICKNESS),
            spacing_between_slices: read_float(&obj, tags::SPACING_BETWEEN_SLICES),
            rescale: (
                read_float(&obj, tags::RESCALE_SLOPE).unwrap_or(1.0) as f32,
                read_float(&obj, tags::RESCALE_INTERCEPT).unwrap_or(0.0) as f32,
            ),
            series_number: read_string(&obj, tags::SERIES_NUMBER),
            series_description: read_string(&obj, tags::SERIES_DESCRIPTION),
            pixels,
        })
    }
}

fn assemble_volume(series_dir: &Path, mut slices: Vec<Slice>) -> Result<Volume, PipelineError> {
    let Some(first) = slices.first() else {
        return Err(PipelineError::unsupported(series_dir, "no slice files"));
    };
    let (rows, columns, voxel_type) = (first.rows, first.columns, first.voxel_type);
    if let Some(odd) = slices
        .iter()
        .find(|s| s.rows != rows || s.columns != columns || s.voxel_type != voxel_type)
    {
        return Err(PipelineError::unsupported(
            series_dir,
            format!("slice {} has inconsistent geometry", odd.path.display()),
        ));
    }

    let orientation = first.orientation.unwrap_or([1.0, 0.0, 0.0, 0.0, 1.0, 0.0]);
    let row_dir = [orientation[0], orientation[1], orientation[2]];
    let col_dir = [orientation[3], orientation[4], orientation[5]];
    let normal = cross(row_dir, col_dir);

    if slices.iter().all(|s| s.position.is_some()) {
        slices.sort_by(|a, b| {
            let da = a.position.map(|p| dot(p, normal)).unwrap_or(0.0);
            let db = b.position.map(|p| dot(p, normal)).unwrap_or(0.0);
            da.total_cmp(&db)
        });
    } else if slices.iter().all(|s| s.instance_number.is_some()) {
        slices.sort_by_key(|s| s.instance_number);
    }

    let first = &slices[0];
    let last = &slices[slices.len() - 1];
    let [row_spacing, col_spacing] = first.pixel_spacing.unwrap_or([1.0, 1.0]);
    let origin = first.position.unwrap_or([0.0, 0.0, 0.0]);

    // Step between consecutive slices, in LPS.
    let step = match (first.position, last.position) {
        (Some(p0), Some(pn)) if slices.len() > 1 => {
            let n = (slices.len() - 1) as f64;
            [(pn[0] - p0[0]) / n, (pn[1] - p0[1]) / n, (pn[2] - p0[2]) / n]
        }
        _ => {
            let thickness = first
                .spacing_between_slices
                .or(first.slice_thickness)
                .unwrap_or(1.0);
            normal.map(|v| v * thickness)
        }
    };

    // PixelSpacing is (row spacing, column spacing): columns advance along
    // the row direction by the column spacing.
    let lps_columns = [
        row_dir.map(|v| v * col_spacing),
        col_dir.map(|v| v * row_spacing),
        step,
    ];
    let mut affine: Affine = [[0.0; 4]; 3];
    for row in 0..3 {
        // LPS -> RAS flips the first two world axes.
        let sign = if row < 2 { -1.0 } else { 1.0 };
        for (axis, column) in lps_columns.iter().enumerate() {
            affine[row][axis] = sign * column[row];
        }
        affine[row][3] = sign * origin[row];
    }

    let description = volume_name(first.series_number.as_deref(), first.series_description.as_deref());
    let rescale = first.rescale;
    let depth = slices.len();
    let mut data = Vec::with_capacity(rows * columns * voxel_type.size() * depth);
    for slice in slices {
        data.extend_from_slice(&slice.pixels);
    }

    Ok(Volume {
        dims: [columns, rows, depth],
        affine,
        voxel_type,
        data,
        scl_slope: rescale.0,
        scl_inter: rescale.1,
        description,
    })
}

/// `<SeriesNumber>_<SeriesDescription>`, sanitized for use as a file name.
fn volume_name(number: Option<&str>, description: Option<&str>) -> String {
    let parts: Vec<&str> = [number, description]
        .into_iter()
        .flatten()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect();
    if parts.is_empty() {
        "volume".to_string()
    } else {
        sanitize_filename(&parts.join("_"))
    }
}

fn sanitize_filename(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

fn pixel_bytes<'a>(obj: &'a DefaultDicomObject, path: &Path) -> Result<Cow<'a, [u8]>, PipelineError> {
    let element = obj
        .element(tags::PIXEL_DATA)
        .map_err(|err| PipelineError::dicom(path, err))?;
    match element.value() {
        Value::Primitive(PrimitiveValue::U8(bytes)) => Ok(Cow::Borrowed(&bytes[..])),
        Value::Primitive(PrimitiveValue::U16(values)) => {
            Ok(Cow::Owned(values.iter().flat_map(|v| v.to_le_bytes()).collect()))
        }
        Value::Primitive(PrimitiveValue::I16(values)) => {
            Ok(Cow::Owned(values.iter().flat_map(|v| v.to_le_bytes()).collect()))
        }
        Value::Primitive(PrimitiveValue::U32(values)) => {
            Ok(Cow::Owned(values.iter().flat_map(|v| v.to_le_bytes()).collect()))
        }
        Value::Primitive(PrimitiveValue::I32(values)) => {
            Ok(Cow::Owned(values.iter().flat_map(|v| v.to_le_bytes()).collect()))
        }
        Value::PixelSequence { .. } => Err(PipelineError::unsupported(path, "encapsulated pixel data")),
        _ => Err(PipelineError::unsupported(
            path,
            format!("unexpected pixel data value ({})", element.vr()),
        )),
    }
}

fn read_int(obj: &DefaultDicomObject, tag: Tag) -> Option<i32> {
    obj.element_opt(tag)
        .ok()
        .flatten()
        .and_then(|elem| elem.to_int::<i32>().ok())
}

fn require_int(obj: &DefaultDicomObject, path: &Path, tag: Tag, name: &str) -> Result<i32, PipelineError> {
    read_int(obj, tag).ok_or_else(|| PipelineError::unsupported(path, format!("missing {name}")))
}

fn require_dimension(obj: &DefaultDicomObject, path: &Path, tag: Tag, name: &str) -> Result<usize, PipelineError> {
    let value = require_int(obj, path, tag, name)?;
    usize::try_from(value)
        .ok()
        .filter(|&v| v > 0)
        .ok_or_else(|| PipelineError::unsupported(path, format!("invalid {name} {value}")))
}

fn read_float(obj: &DefaultDicomObject, tag: Tag) -> Option<f64> {
    obj.element_opt(tag)
        .ok()
        .flatten()
        .and_then(|elem| elem.to_float64().ok())
}

fn read_floats<const N: usize>(obj: &DefaultDicomObject, tag: Tag) -> Option<[f64; N]> {
    let values = obj
        .element_opt(tag)
        .ok()
        .flatten()
        .and_then(|elem| elem.to_multi_float64().ok())?;
    values.get(..N)?.try_into().ok()
}

fn read_string(obj: &DefaultDicomObject, tag: Tag) -> Option<String> {
    obj.element_opt(tag)
        .ok()
        .flatten()
        .and_then(|elem| elem.to_str().ok())
        .map(|s| s.trim().to_string())
}

fn cross(a: [f64; 3], b: [f64; 3]) -> [f64; 3] {
    [
        a[1] * b[2] - a[2] * b[1],
        a[2] * b[0] - a[0] * b[2],
        a[0] * b[1] - a[1] * b[0],
    ]
}

fn dot(a: [f64; 3], b: [f64; 3]) -> f64 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn volume_name_joins_number_and_description() {
        assert_eq!(volume_name(Some("3"), Some("t1 mprage/sag")), "3_t1_mprage_sag");
        assert_eq!(volume_name(None, Some("  ")), "volume");
        assert_eq!(volume_name(Some("12"), None), "12");
    }

    #[test]
    fn normal_of_axial_plane_points_up() {
        assert_eq!(cross([1.0, 0.0, 0.0], [0.0, 1.0, 0.0]), [0.0, 0.0, 1.0]);
    }
}
