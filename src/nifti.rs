//! Minimal NIfTI-1 single-file (`.nii`) writer.
//!
//! Voxel data is stored little-endian with the first axis varying fastest.
//! Affines map voxel indices to RAS+ millimetres.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::error::PipelineError;

const HEADER_SIZE: usize = 348;
const VOX_OFFSET: usize = 352;
const NIFTI_UNITS_MM: u8 = 2;
const NIFTI_XFORM_SCANNER_ANAT: i16 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoxelType {
    U8,
    I16,
    U16,
    I32,
    U32,
}

impl VoxelType {
    /// Maps DICOM BitsAllocated / PixelRepresentation to a NIfTI voxel type.
    pub fn from_dicom(bits_allocated: u16, signed: bool) -> Option<Self> {
        match (bits_allocated, signed) {
            (8, false) => Some(VoxelType::U8),
            (16, false) => Some(VoxelType::U16),
            (16, true) => Some(VoxelType::I16),
            (32, false) => Some(VoxelType::U32),
            (32, true) => Some(VoxelType::I32),
            _ => None,
        }
    }

    pub fn datatype_code(self) -> i16 {
        match self {
            VoxelType::U8 => 2,
            VoxelType::I16 => 4,
            VoxelType::I32 => 8,
            VoxelType::U16 => 512,
            VoxelType::U32 => 768,
        }
    }

    pub fn size(self) -> usize {
        match self {
            VoxelType::U8 => 1,
            VoxelType::I16 | VoxelType::U16 => 2,
            VoxelType::I32 | VoxelType::U32 => 4,
        }
    }
}

pub type Affine = [[f64; 4]; 3];

#[derive(Debug, Clone)]
pub struct Volume {
    pub dims: [usize; 3],
    pub affine: Affine,
    pub voxel_type: VoxelType,
    pub data: Vec<u8>,
    pub scl_slope: f32,
    pub scl_inter: f32,
    pub description: String,
}

impl Volume {
    fn column(&self, axis: usize) -> [f64; 3] {
        [
            self.affine[0][axis],
            self.affine[1][axis],
            self.affine[2][axis],
        ]
    }

    /// Voxel size along each axis, in millimetres.
    pub fn spacing(&self) -> [f64; 3] {
        [0, 1, 2].map(|axis| norm(self.column(axis)))
    }

    /// Permutes and flips the voxel axes so that axis `i` points along
    /// world axis `i` in the positive direction, as closely as the
    /// acquisition allows.
    pub fn reoriented_to_ras(self) -> Volume {
        let mut axis_for_world = [0usize; 3];
        let mut world_taken = [false; 3];

        let mut voxel_axes = [0usize, 1, 2];
        voxel_axes.sort_by(|&x, &y| max_abs(self.column(y)).total_cmp(&max_abs(self.column(x))));
        for axis in voxel_axes {
            let col = self.column(axis);
            let mut best: Option<usize> = None;
            for world in 0..3 {
                if world_taken[world] {
                    continue;
                }
                if best.is_none_or(|b| col[world].abs() > col[b].abs()) {
                    best = Some(world);
                }
            }
            let world = best.unwrap_or(axis);
            world_taken[world] = true;
            axis_for_world[world] = axis;
        }

        let flip = [0, 1, 2].map(|w| self.column(axis_for_world[w])[w] < 0.0);
        if axis_for_world == [0, 1, 2] && flip == [false, false, false] {
            return self;
        }

        let old_dims = self.dims;
        let new_dims = [0, 1, 2].map(|w| old_dims[axis_for_world[w]]);

        let mut affine = [[0.0; 4]; 3];
        for row in 0..3 {
            affine[row][3] = self.affine[row][3];
        }
        for w in 0..3 {
            let axis = axis_for_world[w];
            let col = self.column(axis);
            let sign = if flip[w] { -1.0 } else { 1.0 };
            for row in 0..3 {
                affine[row][w] = sign * col[row];
                if flip[w] {
                    affine[row][3] += col[row] * (old_dims[axis].saturating_sub(1)) as f64;
                }
            }
        }

        let size = self.voxel_type.size();
        let mut data = vec![0u8; self.data.len()];
        let mut dst = 0;
        for n2 in 0..new_dims[2] {
            for n1 in 0..new_dims[1] {
                for n0 in 0..new_dims[0] {
                    let new_index = [n0, n1, n2];
                    let mut old_index = [0usize; 3];
                    for w in 0..3 {
                        let axis = axis_for_world[w];
                        old_index[axis] = if flip[w] {
                            old_dims[axis] - 1 - new_index[w]
                        } else {
                            new_index[w]
                        };
                    }
                    let src = (old_index[0]
                        + old_dims[0] * (old_index[1] + old_dims[1] * old_index[2]))
                        * size;
                    data[dst..dst + size].copy_from_slice(&self.data[src..src + size]);
                    dst += size;
                }
            }
        }

        Volume {
            dims: new_dims,
            affine,
            data,
            ..self
        }
    }
}

/// Writes `volume` as an uncompressed single-file NIfTI-1 image.
pub fn write_nifti(volume: &Volume, path: &Path) -> Result<(), PipelineError> {
    let expected = volume.dims.iter().product::<usize>() * volume.voxel_type.size();
    if volume.data.len() != expected {
        return Err(PipelineError::Conversion(format!(
            "voxel buffer holds {} bytes, {:?} x {:?} needs {expected}",
            volume.data.len(),
            volume.dims,
            volume.voxel_type
        )));
    }

    let header = encode_header(volume)?;
    let file = File::create(path).map_err(|err| PipelineError::io("create", path, err))?;
    let mut writer = BufWriter::new(file);
    writer
        .write_all(&header)
        .and_then(|_| writer.write_all(&volume.data))
        .and_then(|_| writer.flush())
        .map_err(|err| PipelineError::io("write", path, err))
}

struct HeaderBuf(Vec<u8>);

impl HeaderBuf {
    fn i16(&mut self, offset: usize, value: i16) {
        self.0[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
    }

    fn i32(&mut self, offset: usize, value: i32) {
        self.0[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    fn f32(&mut self, offset: usize, value: f32) {
        self.0[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    fn text(&mut self, offset: usize, max_len: usize, value: &str) {
        let bytes = value.as_bytes();
        let len = bytes.len().min(max_len - 1);
        self.0[offset..offset + len].copy_from_slice(&bytes[..len]);
    }
}

fn encode_header(volume: &Volume) -> Result<Vec<u8>, PipelineError> {
    let mut h = HeaderBuf(vec![0u8; VOX_OFFSET]);
    h.i32(0, HEADER_SIZE as i32);
    h.0[38] = b'r';

    h.i16(40, 3);
    for (i, &dim) in volume.dims.iter().enumerate() {
        let dim = i16::try_from(dim).map_err(|_| {
            PipelineError::Conversion(format!("dimension {dim} exceeds NIfTI-1 limits"))
        })?;
        h.i16(42 + 2 * i, dim);
    }
    for i in 3..7 {
        h.i16(42 + 2 * i, 1);
    }

    h.i16(70, volume.voxel_type.datatype_code());
    h.i16(72, (volume.voxel_type.size() * 8) as i16);

    let (quatern, offset, qfac) = quaternion(&volume.affine);
    let spacing = volume.spacing();
    h.f32(76, qfac as f32);
    for (i, value) in spacing.iter().enumerate() {
        h.f32(80 + 4 * i, *value as f32);
    }

    h.f32(108, VOX_OFFSET as f32);
    h.f32(112, volume.scl_slope);
    h.f32(116, volume.scl_inter);
    h.0[123] = NIFTI_UNITS_MM;
    h.text(148, 80, &volume.description);

    h.i16(252, NIFTI_XFORM_SCANNER_ANAT);
    h.i16(254, NIFTI_XFORM_SCANNER_ANAT);
    for (i, value) in quatern.iter().chain(offset.iter()).enumerate() {
        h.f32(256 + 4 * i, *value as f32);
    }
    for (row, values) in volume.affine.iter().enumerate() {
        for (col, value) in values.iter().enumerate() {
            h.f32(280 + 16 * row + 4 * col, *value as f32);
        }
    }

    h.0[344..348].copy_from_slice(b"n+1\0");
    Ok(h.0)
}

/// qform parameters `(b, c, d)`, offset and qfac for an orthogonal affine.
fn quaternion(affine: &Affine) -> ([f64; 3], [f64; 3], f64) {
    let offset = [affine[0][3], affine[1][3], affine[2][3]];
    let mut r = [[0.0f64; 3]; 3];
    for col in 0..3 {
        let length = norm([affine[0][col], affine[1][col], affine[2][col]]);
        let length = if length > 0.0 { length } else { 1.0 };
        for row in 0..3 {
            r[row][col] = affine[row][col] / length;
        }
    }

    let det = r[0][0] * (r[1][1] * r[2][2] - r[2][1] * r[1][2])
        - r[0][1] * (r[1][0] * r[2][2] - r[2][0] * r[1][2])
        + r[0][2] * (r[1][0] * r[2][1] - r[2][0] * r[1][1]);
    let qfac = if det < 0.0 { -1.0 } else { 1.0 };
    if qfac < 0.0 {
        for row in r.iter_mut() {
            row[2] = -row[2];
        }
    }

    let trace = r[0][0] + r[1][1] + r[2][2] + 1.0;
    let (a, b, c, d);
    if trace > 0.5 {
        a = 0.5 * trace.sqrt();
        b = 0.25 * (r[2][1] - r[1][2]) / a;
        c = 0.25 * (r[0][2] - r[2][0]) / a;
        d = 0.25 * (r[1][0] - r[0][1]) / a;
    } else {
        let xd = 1.0 + r[0][0] - (r[1][1] + r[2][2]);
        let yd = 1.0 + r[1][1] - (r[0][0] + r[2][2]);
        let zd = 1.0 + r[2][2] - (r[0][0] + r[1][1]);
        if xd > 1.0 {
            b = 0.5 * xd.sqrt();
            c = 0.25 * (r[0][1] + r[1][0]) / b;
            d = 0.25 * (r[0][2] + r[2][0]) / b;
            a = 0.25 * (r[2][1] - r[1][2]) / b;
        } else if yd > 1.0 {
            c = 0.5 * yd.sqrt();
            b = 0.25 * (r[0][1] + r[1][0]) / c;
            d = 0.25 * (r[1][2] + r[2][1]) / c;
            a = 0.25 * (r[0][2] - r[2][0]) / c;
        } else {
            d = 0.5 * zd.sqrt();
            b = 0.25 * (r[0][2] + r[2][0]) / d;
            c = 0.25 * (r[1][2] + r[2][1]) / d;
            a = 0.25 * (r[1][0] - r[0][1]) / d;
        }
    }

    let quatern = if a < 0.0 { [-b, -c, -d] } else { [b, c, d] };
    (quatern, offset, qfac)
}

fn norm(v: [f64; 3]) -> f64 {
    (v[0] * v[0] + v[1] * v[1] + v[2] * v[2]).sqrt()
}

fn max_abs(v: [f64; 3]) -> f64 {
    v.iter().fold(0.0, |acc: f64, x| acc.max(x.abs()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn volume(affine: Affine) -> Volume {
        Volume {
            dims: [2, 3, 1],
            affine,
            voxel_type: VoxelType::U8,
            data: (0u8..6).collect(),
            scl_slope: 1.0,
            scl_inter: 0.0,
            description: "test".into(),
        }
    }

    #[test]
    fn header_layout() {
        let vol = volume([[1.0, 0.0, 0.0, 0.0], [0.0, 1.0, 0.0, 0.0], [0.0, 0.0, 2.5, 0.0]]);
        let header = encode_header(&vol).unwrap();
        assert_eq!(header.len(), VOX_OFFSET);
        assert_eq!(i32::from_le_bytes(header[0..4].try_into().unwrap()), 348);
        assert_eq!(&header[344..348], b"n+1\0");
        assert_eq!(i16::from_le_bytes(header[42..44].try_into().unwrap()), 2);
        assert_eq!(i16::from_le_bytes(header[44..46].try_into().unwrap()), 3);
        assert_eq!(f32::from_le_bytes(header[88..92].try_into().unwrap()), 2.5);
        assert_eq!(f32::from_le_bytes(header[108..112].try_into().unwrap()), 352.0);
    }

    #[test]
    fn already_ras_is_untouched() {
        let vol = volume([[1.0, 0.0, 0.0, 0.0], [0.0, 1.0, 0.0, 0.0], [0.0, 0.0, 1.0, 0.0]]);
        let out = vol.clone().reoriented_to_ras();
        assert_eq!(out.data, vol.data);
        assert_eq!(out.affine, vol.affine);
    }

    #[test]
    fn flipped_axes_are_reversed() {
        // LPS-style acquisition: x and y point the wrong way.
        let vol = volume([[-1.0, 0.0, 0.0, 10.0], [0.0, -1.0, 0.0, 20.0], [0.0, 0.0, 1.0, 0.0]]);
        let out = vol.reoriented_to_ras();
        assert_eq!(out.dims, [2, 3, 1]);
        // rows of the original (x fastest): [0,1] [2,3] [4,5]
        assert_eq!(out.data, vec![5, 4, 3, 2, 1, 0]);
        assert_eq!(out.affine[0][0], 1.0);
        assert_eq!(out.affine[1][1], 1.0);
        assert_eq!(out.affine[0][3], 9.0);
        assert_eq!(out.affine[1][3], 18.0);
    }

    #[test]
    fn swapped_axes_are_permuted() {
        let vol = volume([[0.0, 1.0, 0.0, 0.0], [1.0, 0.0, 0.0, 0.0], [0.0, 0.0, 1.0, 0.0]]);
        let out = vol.reoriented_to_ras();
        assert_eq!(out.dims, [3, 2, 1]);
        assert_eq!(out.data, vec![0, 2, 4, 1, 3, 5]);
    }

    #[test]
    fn rejects_short_buffer() {
        let mut vol = volume([[1.0, 0.0, 0.0, 0.0], [0.0, 1.0, 0.0, 0.0], [0.0, 0.0, 1.0, 0.0]]);
        vol.data.pop();
        let tmp = tempfile::tempdir().unwrap();
        assert!(write_nifti(&vol, &tmp.path().join("x.nii")).is_err());
    }
}
