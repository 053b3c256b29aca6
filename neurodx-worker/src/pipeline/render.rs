//! Overlay artifact rendering
//!
//! Grayscale slice under a 50% "hot" heatmap, written as RGB PNG.

use image::{imageops, Rgb, RgbImage};
use ndarray::{Array2, ArrayView2};
use std::path::Path;

use super::localization::LocalizationMap;
use crate::error::PipelineError;

/// Opacity of the heatmap layer
const OVERLAY_ALPHA: f32 = 0.5;

/// Small crops are upscaled by an integer factor towards this edge length
const TARGET_EDGE: u32 = 448;

/// "hot" colormap breakpoints per channel, `(position, value)`
const HOT_RED: [(f32, f32); 3] = [(0.0, 0.0416), (0.365079, 1.0), (1.0, 1.0)];
const HOT_GREEN: [(f32, f32); 4] = [(0.0, 0.0), (0.365079, 0.0), (0.746032, 1.0), (1.0, 1.0)];
const HOT_BLUE: [(f32, f32); 3] = [(0.0, 0.0), (0.746032, 0.0), (1.0, 1.0)];

/// Black → red → yellow → white for `value` in `[0, 1]`
pub fn hot_colormap(value: f32) -> [f32; 3] {
    let v = if value.is_finite() { value.clamp(0.0, 1.0) } else { 0.0 };
    [
        interpolate(&HOT_RED, v),
        interpolate(&HOT_GREEN, v),
        interpolate(&HOT_BLUE, v),
    ]
}

fn interpolate(points: &[(f32, f32)], v: f32) -> f32 {
    for pair in points.windows(2) {
        let (x0, y0) = pair[0];
        let (x1, y1) = pair[1];
        if v <= x1 {
            return y0 + (y1 - y0) * (v - x0) / (x1 - x0);
        }
    }
    points.last().map_or(0.0, |&(_, y)| y)
}

/// Min-max scale to `[0, 1]`; a constant array maps to 0
fn scale_unit(values: ArrayView2<'_, f32>) -> Array2<f32> {
    let (min, max) = values
        .iter()
        .filter(|v| v.is_finite())
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
    let range = max - min;
    if !range.is_finite() || range <= 0.0 {
        return Array2::zeros(values.dim());
    }
    values.mapv(|v| if v.is_finite() { (v - min) / range } else { 0.0 })
}

/// Blend the slice and its map into an RGB image
pub fn render_overlay(slice: ArrayView2<'_, f32>, map: ArrayView2<'_, f32>) -> Result<RgbImage, PipelineError> {
    if slice.dim() != map.dim() {
        return Err(PipelineError::Render(format!(
            "slice {:?} and map {:?} differ in shape",
            slice.dim(),
            map.dim()
        )));
    }
    let (height, width) = slice.dim();
    if height == 0 || width == 0 {
        return Err(PipelineError::Render("empty slice".to_string()));
    }

    let gray = scale_unit(slice);
    let heat = scale_unit(map);

    let mut image = RgbImage::new(width as u32, height as u32);
    for ((row, col), &g) in gray.indexed_iter() {
        let hot = hot_colormap(heat[[row, col]]);
        let pixel = hot.map(|c| {
            let blended = OVERLAY_ALPHA * c + (1.0 - OVERLAY_ALPHA) * g;
            (blended * 255.0).round().clamp(0.0, 255.0) as u8
        });
        image.put_pixel(col as u32, row as u32, Rgb(pixel));
    }

    let longest = width.max(height) as u32;
    let factor = (TARGET_EDGE / longest).max(1);
    if factor > 1 {
        image = imageops::resize(
            &image,
            width as u32 * factor,
            height as u32 * factor,
            imageops::FilterType::Nearest,
        );
    }
    Ok(image)
}

/// Render a localization map and write it as PNG, creating parent directories
pub fn save_overlay(localization: &LocalizationMap, path: &Path) -> Result<(), PipelineError> {
    let image = render_overlay(localization.image.view(), localization.map.view())?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    image
        .save_with_format(path, image::ImageFormat::Png)
        .map_err(|e| PipelineError::Render(format!("{}: {}", path.display(), e)))?;

    tracing::debug!(
        path = %path.display(),
        width = image.width(),
        height = image.height(),
        "Saved localization overlay"
    );
    Ok(())
}
