//! NIfTI-1 volume loading
//!
//! Reads `.nii` / `.nii.gz` files, derives the voxel-to-world affine from the
//! header and reduces 4D series to their first time point.

use ndarray::{ArrayD, IxDyn, ShapeBuilder};
use nifti::{IntoNdArray, NiftiHeader, NiftiObject, ReaderOptions};
use std::path::Path;

use super::{Affine, Volume, IDENTITY_AFFINE};
use crate::error::PipelineError;

/// Load a NIfTI file as a [`Volume`] (not yet reoriented)
///
/// Voxels are decoded in one pass with `scl_slope`/`scl_inter` applied;
/// 4D series keep only their first time point.
pub fn load_nifti(path: &Path) -> Result<Volume, PipelineError> {
    let object = ReaderOptions::new()
        .read_file(path)
        .map_err(|e| unreadable(path, e))?;

    let header = object.header().clone();
    log_header(path, &header);

    let affine = header_affine(&header);
    let decoded = object
        .into_volume()
        .into_ndarray::<f32>()
        .map_err(|e| unreadable(path, e))?;

    // nifti decodes into its own ndarray release, column-major
    let shape = decoded.shape().to_vec();
    let data = if decoded.t().is_standard_layout() {
        ArrayD::from_shape_vec(IxDyn(&shape).f(), decoded.into_raw_vec())
    } else {
        ArrayD::from_shape_vec(IxDyn(&shape), decoded.iter().copied().collect())
    }
    .map_err(|e| unreadable(path, e))?;

    Volume::from_dynamic(data, affine)
}

/// Voxel-to-world affine following the NIfTI-1 precedence rules
///
/// sform (code > 0) → qform (code > 0) → diagonal of the voxel sizes.
pub fn header_affine(header: &NiftiHeader) -> Affine {
    let pixdim = [
        header.pixdim[0] as f64,
        header.pixdim[1] as f64,
        header.pixdim[2] as f64,
        header.pixdim[3] as f64,
    ];

    if header.sform_code > 0 {
        let rows = [header.srow_x, header.srow_y, header.srow_z];
        let mut affine = IDENTITY_AFFINE;
        for (r, row) in rows.iter().enumerate() {
            for c in 0..4 {
                affine[r][c] = row[c] as f64;
            }
        }
        return affine;
    }

    if header.qform_code > 0 {
        return qform_affine(
            [
                header.quatern_b as f64,
                header.quatern_c as f64,
                header.quatern_d as f64,
            ],
            [
                header.quatern_x as f64,
                header.quatern_y as f64,
                header.quatern_z as f64,
            ],
            pixdim,
        );
    }

    let mut affine = IDENTITY_AFFINE;
    for axis in 0..3 {
        affine[axis][axis] = voxel_size(pixdim[axis + 1]);
    }
    affine
}

/// Affine from the quaternion representation (qform)
///
/// `pixdim[0]` is the qfac sign applied to the third axis.
pub fn qform_affine(quaternion: [f64; 3], offset: [f64; 3], pixdim: [f64; 4]) -> Affine {
    let [b, c, d] = quaternion;
    let a_squared = 1.0 - (b * b + c * c + d * d);
    let (a, b, c, d) = if a_squared < 1e-7 {
        // 180° rotation; renormalize the vector part
        let norm = (b * b + c * c + d * d).sqrt();
        if norm > 0.0 {
            (0.0, b / norm, c / norm, d / norm)
        } else {
            (1.0, 0.0, 0.0, 0.0)
        }
    } else {
        (a_squared.sqrt(), b, c, d)
    };

    let rotation = [
        [
            a * a + b * b - c * c - d * d,
            2.0 * (b * c - a * d),
            2.0 * (b * d + a * c),
        ],
        [
            2.0 * (b * c + a * d),
            a * a + c * c - b * b - d * d,
            2.0 * (c * d - a * b),
        ],
        [
            2.0 * (b * d - a * c),
            2.0 * (c * d + a * b),
            a * a + d * d - c * c - b * b,
        ],
    ];

    let qfac = if pixdim[0] < 0.0 { -1.0 } else { 1.0 };
    let zooms = [
        voxel_size(pixdim[1]),
        voxel_size(pixdim[2]),
        voxel_size(pixdim[3]) * qfac,
    ];

    let mut affine = IDENTITY_AFFINE;
    for r in 0..3 {
        for col in 0..3 {
            affine[r][col] = rotation[r][col] * zooms[col];
        }
        affine[r][3] = offset[r];
    }
    affine
}

fn voxel_size(value: f64) -> f64 {
    if value > 0.0 {
        value
    } else {
        1.0
    }
}

fn log_header(path: &Path, header: &NiftiHeader) {
    tracing::debug!(
        path = %path.display(),
        dim = ?header.dim,
        datatype = header.datatype,
        pixdim = ?header.pixdim,
        qform_code = header.qform_code,
        sform_code = header.sform_code,
        scl_slope = header.scl_slope,
        scl_inter = header.scl_inter,
        cal_min = header.cal_min,
        cal_max = header.cal_max,
        toffset = header.toffset,
        "NIfTI header"
    );
}

fn unreadable(path: &Path, err: impl std::fmt::Display) -> PipelineError {
    PipelineError::UnreadableVolume {
        path: path.to_path_buf(),
        reason: err.to_string(),
    }
}
