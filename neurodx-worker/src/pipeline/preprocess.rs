//! Slice preprocessing into the classifier's input layout
//!
//! slice → 3 identical channels → area resize to 224×224 → per-channel
//! standardization → channel-first batch.

use image::GrayImage;
use ndarray::{s, Array2, Array3, Array4, ArrayView2, ArrayView3, Axis};
use std::path::{Path, PathBuf};

use crate::error::PipelineError;
use crate::volume::Slice;

/// Spatial edge length expected by the classifier
pub const INPUT_SIZE: usize = 224;

/// Channel count expected by the classifier
pub const INPUT_CHANNELS: usize = 3;

/// Preprocessed slices, shape `(count, 3, 224, 224)`
#[derive(Debug, Clone)]
pub struct SliceBatch {
    pub tensor: Array4<f32>,
    /// Source slice index of each batch entry
    pub indices: Vec<usize>,
}

impl SliceBatch {
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    /// Channel-first image of one batch entry
    pub fn image(&self, position: usize) -> ArrayView3<'_, f32> {
        self.tensor.index_axis(Axis(0), position)
    }
}

/// Resize by area averaging (adaptive average pooling)
///
/// Output cell `i` averages input cells `floor(i*in/out) .. ceil((i+1)*in/out)`
/// along each axis. The two axes are pooled one after the other, which gives
/// the same result as pooling the rectangle at once.
pub fn resize_area(src: ArrayView2<'_, f32>, out_height: usize, out_width: usize) -> Array2<f32> {
    let (in_height, in_width) = src.dim();

    let mut rows = Array2::<f32>::zeros((out_height, in_width));
    for i in 0..out_height {
        let (start, end) = pool_window(i, in_height, out_height);
        let mean = src.slice(s![start..end, ..]).sum_axis(Axis(0)) / (end - start) as f32;
        rows.row_mut(i).assign(&mean);
    }

    let mut out = Array2::<f32>::zeros((out_height, out_width));
    for j in 0..out_width {
        let (start, end) = pool_window(j, in_width, out_width);
        let column: Vec<f32> = rows
            .slice(s![.., start..end])
            .rows()
            .into_iter()
            .map(|row| row.sum() / (end - start) as f32)
            .collect();
        for (i, value) in column.into_iter().enumerate() {
            out[[i, j]] = value;
        }
    }
    out
}

fn pool_window(index: usize, input: usize, output: usize) -> (usize, usize) {
    let start = index * input / output;
    let end = ((index + 1) * input).div_ceil(output);
    (start, end.max(start + 1))
}

/// Standardize by the array's own mean and population standard deviation
///
/// A zero standard deviation divides by 1 instead.
pub fn normalize(channel: &mut Array2<f32>) {
    let count = channel.len().max(1) as f64;
    let mean = channel.iter().map(|&v| v as f64).sum::<f64>() / count;
    let variance = channel
        .iter()
        .map(|&v| {
            let d = v as f64 - mean;
            d * d
        })
        .sum::<f64>()
        / count;
    let std = variance.sqrt();
    let std = if std == 0.0 { 1.0 } else { std };

    channel.mapv_inplace(|v| ((v as f64 - mean) / std) as f32);
}

/// Preprocess one slice into a `(3, 224, 224)` image
pub fn preprocess_slice(slice: ArrayView2<'_, f32>) -> Array3<f32> {
    // Channels are identical copies, so the per-channel statistics are too
    let mut channel = resize_area(slice, INPUT_SIZE, INPUT_SIZE);
    normalize(&mut channel);

    let mut image = Array3::<f32>::zeros((INPUT_CHANNELS, INPUT_SIZE, INPUT_SIZE));
    for mut plane in image.axis_iter_mut(Axis(0)) {
        plane.assign(&channel);
    }
    image
}

/// Preprocess selected slices into a batch, preserving their order
pub fn preprocess_slices(slices: &[Slice]) -> Result<SliceBatch, PipelineError> {
    if slices.is_empty() {
        return Err(PipelineError::InvalidInput(
            "no slices to preprocess".to_string(),
        ));
    }

    let mut tensor = Array4::<f32>::zeros((slices.len(), INPUT_CHANNELS, INPUT_SIZE, INPUT_SIZE));
    for (position, slice) in slices.iter().enumerate() {
        if slice.data.is_empty() {
            return Err(PipelineError::UnsupportedShape(slice.data.shape().to_vec()));
        }
        tensor
            .index_axis_mut(Axis(0), position)
            .assign(&preprocess_slice(slice.data.view()));
    }

    Ok(SliceBatch {
        tensor,
        indices: slices.iter().map(|slice| slice.index).collect(),
    })
}

/// Write channel 0 of each preprocessed slice as `slice_NN.png`
///
/// Files land in `<debug_dir>/<volume_stem>/`; values are scaled by 255 and
/// clipped to the 8-bit range.
pub fn save_debug_slices(
    batch: &SliceBatch,
    debug_dir: &Path,
    volume_stem: &str,
) -> Result<PathBuf, PipelineError> {
    let dir = debug_dir.join(volume_stem);
    std::fs::create_dir_all(&dir)?;

    for position in 0..batch.len() {
        let plane = batch.image(position).index_axis(Axis(0), 0).to_owned();
        let pixels: Vec<u8> = plane
            .iter()
            .map(|&v| (v * 255.0).clamp(0.0, 255.0) as u8)
            .collect();
        let image = GrayImage::from_raw(INPUT_SIZE as u32, INPUT_SIZE as u32, pixels)
            .ok_or_else(|| PipelineError::Render("debug slice buffer size mismatch".to_string()))?;

        let path = dir.join(format!("slice_{:02}.png", position + 1));
        image
            .save(&path)
            .map_err(|e| PipelineError::Render(format!("{}: {}", path.display(), e)))?;
    }

    tracing::debug!(dir = %dir.display(), count = batch.len(), "Saved debug slices");
    Ok(dir)
}

/// File stem of a volume path with `.nii`/`.nii.gz` removed
pub fn volume_stem(path: &Path) -> String {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "volume".to_string());
    name.strip_suffix(".gz")
        .unwrap_or(name.as_str())
        .strip_suffix(".nii")
        .map(str::to_string)
        .unwrap_or_else(|| name.trim_end_matches(".gz").to_string())
}
