//! Centered axial slice selection

use ndarray::{Array2, Axis};
use std::ops::Range;

use super::Volume;
use crate::error::PipelineError;

/// Slices taken around the volume center unless configured otherwise
pub const DEFAULT_SLICE_COUNT: usize = 15;

/// One axial cross-section and its index along the slicing axis
#[derive(Debug, Clone, PartialEq)]
pub struct Slice {
    pub index: usize,
    pub data: Array2<f32>,
}

/// Indices of the centered run of `count` slices in a volume of `depth`
///
/// `start = max(0, mid - half)`, `end = min(depth, mid + half + 1)` with
/// `mid = depth / 2` and `half = count / 2`. Near the borders the run is
/// truncated, never padded.
pub fn slice_range(depth: usize, count: usize) -> Range<usize> {
    let mid = depth / 2;
    let half = count / 2;
    let start = mid.saturating_sub(half);
    let end = depth.min(mid + half + 1);
    start..end
}

/// Extract the centered run of slices along axis 2, in ascending index order
pub fn select_slices(volume: &Volume, count: usize) -> Result<Vec<Slice>, PipelineError> {
    if count == 0 {
        return Err(PipelineError::InvalidInput(
            "slice count must be at least 1".to_string(),
        ));
    }

    let depth = volume.depth();
    if depth == 0 {
        return Err(PipelineError::UnsupportedShape(volume.shape().to_vec()));
    }

    let slices = slice_range(depth, count)
        .map(|index| Slice {
            index,
            data: volume.data().index_axis(Axis(2), index).to_owned(),
        })
        .collect();

    Ok(slices)
}
