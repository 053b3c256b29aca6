//! Volumetric scans: in-memory representation, NIfTI loading, orientation
//! and slice selection

pub mod loader;
pub mod orientation;
pub mod slices;

pub use loader::load_nifti;
pub use orientation::{canonicalize, AxisCode, Canonicalized};
pub use slices::{select_slices, slice_range, Slice, DEFAULT_SLICE_COUNT};

use ndarray::{Array3, ArrayD, Axis, Ix3};

use crate::error::PipelineError;

/// Voxel index → physical space (row-major 4×4)
pub type Affine = [[f64; 4]; 4];

pub const IDENTITY_AFFINE: Affine = [
    [1.0, 0.0, 0.0, 0.0],
    [0.0, 1.0, 0.0, 0.0],
    [0.0, 0.0, 1.0, 0.0],
    [0.0, 0.0, 0.0, 1.0],
];

/// 3D intensity volume with its voxel-to-world affine
///
/// Axis 2 is the slicing (superior-inferior) axis once the volume is in RAS.
#[derive(Debug, Clone)]
pub struct Volume {
    data: Array3<f32>,
    affine: Affine,
}

impl Volume {
    /// Wrap a 3D array; every extent must be non-zero
    pub fn new(data: Array3<f32>, affine: Affine) -> Result<Self, PipelineError> {
        if data.shape().iter().any(|&extent| extent == 0) {
            return Err(PipelineError::UnsupportedShape(data.shape().to_vec()));
        }
        Ok(Self { data, affine })
    }

    /// Build a volume from an array of any supported rank
    ///
    /// - 2D: a single slice, promoted to depth 1
    /// - 3D: used as is
    /// - 4D: reduced to the first time point
    pub fn from_dynamic(data: ArrayD<f32>, affine: Affine) -> Result<Self, PipelineError> {
        let shape = data.shape().to_vec();
        let data = match data.ndim() {
            2 => data.insert_axis(Axis(2)),
            3 => data,
            4 => {
                if shape[3] == 0 {
                    return Err(PipelineError::UnsupportedShape(shape));
                }
                data.index_axis_move(Axis(3), 0)
            }
            _ => return Err(PipelineError::UnsupportedShape(shape)),
        };

        let data = data
            .into_dimensionality::<Ix3>()
            .map_err(|_| PipelineError::UnsupportedShape(shape))?;
        Self::new(data, affine)
    }

    pub fn data(&self) -> &Array3<f32> {
        &self.data
    }

    pub fn affine(&self) -> &Affine {
        &self.affine
    }

    pub fn shape(&self) -> [usize; 3] {
        let (x, y, z) = self.data.dim();
        [x, y, z]
    }

    /// Extent along the slicing axis
    pub fn depth(&self) -> usize {
        self.data.len_of(Axis(2))
    }

    pub fn into_parts(self) -> (Array3<f32>, Affine) {
        (self.data, self.affine)
    }
}
