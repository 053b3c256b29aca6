//! Gradient-weighted class activation maps
//!
//! Explains the single most confident slice: its prediction is backpropagated
//! to one feature layer, the channel-weighted activations form a coarse map
//! that is upsampled, smoothed, thresholded and restricted to the tissue
//! visible in the slice.

use ndarray::{s, Array2, ArrayView2, Axis};
use neurodx_common::DiagnosisClass;
use std::collections::VecDeque;

use super::inference::{argmax, softmax_rows};
use super::preprocess::SliceBatch;
use crate::error::PipelineError;
use crate::model::{Classifier, LayerCapture};

/// Added to the min-max range so a flat map does not divide by zero
const NORMALIZE_EPSILON: f32 = 1e-8;

/// Gaussian kernels are cut off at this many standard deviations
const BLUR_TRUNCATE: f64 = 4.0;

/// Percentile of positive intensities used as the tissue threshold
const FOREGROUND_PERCENTILE: f64 = 20.0;

#[derive(Debug, Clone, PartialEq)]
pub struct LocalizationSettings {
    /// Feature layer the map is computed on, e.g. `features.denseblock3`
    pub target_layer: String,
    /// Map values below this become 0; `<= 0` disables thresholding
    pub threshold: f32,
    pub apply_blur: bool,
    pub blur_sigma: f32,
}

impl Default for LocalizationSettings {
    fn default() -> Self {
        Self {
            target_layer: "features.denseblock3".to_string(),
            threshold: 0.3,
            apply_blur: true,
            blur_sigma: 2.0,
        }
    }
}

/// Slice with the highest single-class probability
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BestSlice {
    /// Position in the batch
    pub position: usize,
    /// Index along the volume's slicing axis
    pub slice_index: usize,
    pub class: DiagnosisClass,
    pub score: f32,
}

/// Final map together with the slice it explains
#[derive(Debug, Clone)]
pub struct LocalizationMap {
    /// Values in `[0, 1]`, same extent as `image`
    pub map: Array2<f32>,
    /// Channel 0 of the preprocessed slice
    pub image: Array2<f32>,
    pub slice_index: usize,
    pub class: DiagnosisClass,
    pub score: f32,
    /// Whether `map` and `image` were cropped to the tissue bounding box
    pub cropped: bool,
}

/// Half-open rectangle `[row_start, row_end) × [col_start, col_end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundingBox {
    pub row_start: usize,
    pub row_end: usize,
    pub col_start: usize,
    pub col_end: usize,
}

/// Produce the localization map for a preprocessed batch
pub fn localize(
    classifier: &dyn Classifier,
    batch: &SliceBatch,
    settings: &LocalizationSettings,
) -> Result<LocalizationMap, PipelineError> {
    let best = find_best_slice(classifier, batch)?;
    tracing::info!(
        slice = best.slice_index,
        class = %best.class,
        score = best.score,
        "Localizing most confident slice"
    );

    let image = batch.image(best.position);
    let (_, height, width) = image.dim();
    let capture = classifier.forward_with_capture(image, &settings.target_layer, best.class.index())?;

    let coarse = class_activation_map(&capture)?;
    let mut map = upsample_bilinear(coarse.view(), height, width);
    normalize_min_max(&mut map);
    if settings.apply_blur {
        map = gaussian_blur(map.view(), settings.blur_sigma as f64);
    }
    apply_threshold(&mut map, settings.threshold);

    let slice_image = image.index_axis(Axis(0), 0).to_owned();
    let (map, image, cropped) = refine_map(map, slice_image);

    Ok(LocalizationMap {
        map,
        image,
        slice_index: best.slice_index,
        class: best.class,
        score: best.score,
        cropped,
    })
}

/// Classify each slice on its own and keep the most confident one
///
/// Only a strictly greater score replaces the current best, so the earliest
/// slice wins ties.
pub fn find_best_slice(classifier: &dyn Classifier, batch: &SliceBatch) -> Result<BestSlice, PipelineError> {
    let mut best: Option<BestSlice> = None;

    for position in 0..batch.len() {
        let single = batch.tensor.slice(s![position..position + 1, .., .., ..]);
        let probabilities = softmax_rows(&classifier.forward(single)?);
        let row = probabilities.row(0);
        let Some(index) = argmax(row) else {
            continue;
        };
        let score = row[index];

        if score.is_finite() && best.map_or(true, |current| score > current.score) {
            let class = DiagnosisClass::from_index(index)
                .ok_or_else(|| PipelineError::Compute(format!("class index {} out of range", index)))?;
            best = Some(BestSlice {
                position,
                slice_index: batch.indices[position],
                class,
                score,
            });
        }
    }

    best.ok_or_else(|| PipelineError::Compute("no slice produced a usable score".to_string()))
}

/// Channel weights are the spatial mean of the gradients; the weighted sum of
/// activations is rectified
pub fn class_activation_map(capture: &LayerCapture) -> Result<Array2<f32>, PipelineError> {
    let activations = &capture.activations;
    let gradients = &capture.gradients;
    if activations.dim() != gradients.dim() {
        return Err(PipelineError::Compute(format!(
            "activation shape {:?} does not match gradient shape {:?}",
            activations.dim(),
            gradients.dim()
        )));
    }

    let weights = gradients
        .mean_axis(Axis(2))
        .and_then(|g| g.mean_axis(Axis(1)))
        .ok_or_else(|| PipelineError::Compute("empty feature map".to_string()))?;

    let (_, height, width) = activations.dim();
    let mut cam = Array2::<f32>::zeros((height, width));
    for (channel, &weight) in activations.axis_iter(Axis(0)).zip(weights.iter()) {
        cam.scaled_add(weight, &channel);
    }
    cam.mapv_inplace(|v| v.max(0.0));
    Ok(cam)
}

/// Bilinear resize with half-pixel centers (`align_corners = false`)
pub fn upsample_bilinear(src: ArrayView2<'_, f32>, out_height: usize, out_width: usize) -> Array2<f32> {
    let (in_height, in_width) = src.dim();
    let rows: Vec<(usize, usize, f32)> = (0..out_height)
        .map(|i| source_coordinate(i, in_height, out_height))
        .collect();
    let cols: Vec<(usize, usize, f32)> = (0..out_width)
        .map(|j| source_coordinate(j, in_width, out_width))
        .collect();

    Array2::from_shape_fn((out_height, out_width), |(i, j)| {
        let (r0, r1, dr) = rows[i];
        let (c0, c1, dc) = cols[j];
        let top = src[[r0, c0]] * (1.0 - dc) + src[[r0, c1]] * dc;
        let bottom = src[[r1, c0]] * (1.0 - dc) + src[[r1, c1]] * dc;
        top * (1.0 - dr) + bottom * dr
    })
}

fn source_coordinate(index: usize, input: usize, output: usize) -> (usize, usize, f32) {
    let scale = input as f32 / output as f32;
    let position = ((index as f32 + 0.5) * scale - 0.5).max(0.0);
    let lower = (position.floor() as usize).min(input - 1);
    let upper = (lower + 1).min(input - 1);
    (lower, upper, position - lower as f32)
}

/// Rescale to `[0, 1]` as `(x - min) / (max - min + eps)`
pub fn normalize_min_max(map: &mut Array2<f32>) {
    let (min, max) = min_max(map.view());
    map.mapv_inplace(|v| (v - min) / (max - min + NORMALIZE_EPSILON));
}

fn min_max(values: ArrayView2<'_, f32>) -> (f32, f32) {
    values.iter().fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| {
        (lo.min(v), hi.max(v))
    })
}

/// Separable Gaussian filter with mirror-reflected borders
///
/// The kernel covers `round(4 * sigma)` pixels on each side; border pixels
/// are mirrored including the edge (`d c b a | a b c d | d c b a`).
pub fn gaussian_blur(src: ArrayView2<'_, f32>, sigma: f64) -> Array2<f32> {
    if sigma <= 0.0 {
        return src.to_owned();
    }
    let kernel = gaussian_kernel(sigma);
    let radius = (kernel.len() / 2) as isize;
    let (height, width) = src.dim();

    let mut vertical = Array2::<f32>::zeros((height, width));
    for ((i, j), out) in vertical.indexed_iter_mut() {
        let sum: f64 = kernel
            .iter()
            .enumerate()
            .map(|(k, w)| w * src[[reflect(i as isize + k as isize - radius, height), j]] as f64)
            .sum();
        *out = sum as f32;
    }

    let mut blurred = Array2::<f32>::zeros((height, width));
    for ((i, j), out) in blurred.indexed_iter_mut() {
        let sum: f64 = kernel
            .iter()
            .enumerate()
            .map(|(k, w)| w * vertical[[i, reflect(j as isize + k as isize - radius, width)]] as f64)
            .sum();
        *out = sum as f32;
    }
    blurred
}

fn gaussian_kernel(sigma: f64) -> Vec<f64> {
    let radius = (BLUR_TRUNCATE * sigma + 0.5) as isize;
    let weights: Vec<f64> = (-radius..=radius)
        .map(|x| (-0.5 * (x * x) as f64 / (sigma * sigma)).exp())
        .collect();
    let total: f64 = weights.iter().sum();
    weights.into_iter().map(|w| w / total).collect()
}

/// Map an out-of-range index back into `0..len` by half-sample reflection
fn reflect(index: isize, len: usize) -> usize {
    let len = len as isize;
    let period = 2 * len;
    let wrapped = index.rem_euclid(period);
    if wrapped < len {
        wrapped as usize
    } else {
        (period - 1 - wrapped) as usize
    }
}

/// Zero every value below `threshold`; a threshold `<= 0` leaves the map as is
pub fn apply_threshold(map: &mut Array2<f32>, threshold: f32) {
    if threshold > 0.0 {
        map.mapv_inplace(|v| if v < threshold { 0.0 } else { v });
    }
}

/// Percentile with linear interpolation between closest ranks
pub fn percentile(values: &[f32], q: f64) -> Option<f32> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));

    let rank = q.clamp(0.0, 100.0) / 100.0 * (sorted.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    let fraction = (rank - lower as f64) as f32;
    Some(sorted[lower] + (sorted[upper] - sorted[lower]) * fraction)
}

/// Tissue mask: pixels brighter than the 20th percentile of the positive ones
///
/// All-false when the image has no positive pixels.
pub fn foreground_mask(image: ArrayView2<'_, f32>) -> Array2<bool> {
    let positives: Vec<f32> = image.iter().copied().filter(|&v| v > 0.0).collect();
    match percentile(&positives, FOREGROUND_PERCENTILE) {
        Some(threshold) => image.mapv(|v| v > threshold),
        None => Array2::from_elem(image.dim(), false),
    }
}

/// 8-connected component labelling
///
/// Labels start at 1 and follow the raster order of each component's first
/// pixel; background is 0. Returns the label image and the component count.
pub fn label_components(mask: ArrayView2<'_, bool>) -> (Array2<u32>, u32) {
    let (height, width) = mask.dim();
    let mut labels = Array2::<u32>::zeros((height, width));
    let mut next = 0u32;
    let mut queue = VecDeque::new();

    for start_row in 0..height {
        for start_col in 0..width {
            if !mask[[start_row, start_col]] || labels[[start_row, start_col]] != 0 {
                continue;
            }
            next += 1;
            labels[[start_row, start_col]] = next;
            queue.push_back((start_row, start_col));

            while let Some((row, col)) = queue.pop_front() {
                for dr in -1isize..=1 {
                    for dc in -1isize..=1 {
                        let r = row as isize + dr;
                        let c = col as isize + dc;
                        if r < 0 || c < 0 || r >= height as isize || c >= width as isize {
                            continue;
                        }
                        let (r, c) = (r as usize, c as usize);
                        if mask[[r, c]] && labels[[r, c]] == 0 {
                            labels[[r, c]] = next;
                            queue.push_back((r, c));
                        }
                    }
                }
            }
        }
    }

    (labels, next)
}

/// Bounding box of one label, `None` when the label is absent
pub fn component_bbox(labels: ArrayView2<'_, u32>, label: u32) -> Option<BoundingBox> {
    let mut bbox: Option<BoundingBox> = None;
    for ((row, col), &value) in labels.indexed_iter() {
        if value != label {
            continue;
        }
        bbox = Some(match bbox {
            None => BoundingBox {
                row_start: row,
                row_end: row + 1,
                col_start: col,
                col_end: col + 1,
            },
            Some(b) => BoundingBox {
                row_start: b.row_start.min(row),
                row_end: b.row_end.max(row + 1),
                col_start: b.col_start.min(col),
                col_end: b.col_end.max(col + 1),
            },
        });
    }
    bbox
}

/// Mask the map to tissue and crop both arrays to the first component
///
/// With no tissue pixels the inputs are returned untouched.
pub fn refine_map(map: Array2<f32>, image: Array2<f32>) -> (Array2<f32>, Array2<f32>, bool) {
    let mask = foreground_mask(image.view());
    if !mask.iter().any(|&m| m) {
        tracing::debug!("Foreground mask is empty; keeping full slice");
        return (map, image, false);
    }

    let mut map = map;
    map.zip_mut_with(&mask, |v, &keep| {
        if !keep {
            *v = 0.0;
        }
    });

    let (labels, count) = label_components(mask.view());
    match component_bbox(labels.view(), 1) {
        Some(b) => {
            tracing::debug!(components = count, bbox = ?b, "Cropping to first tissue component");
            let window = s![b.row_start..b.row_end, b.col_start..b.col_end];
            (map.slice(window).to_owned(), image.slice(window).to_owned(), true)
        }
        None => (map, image, false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::inference::aggregate;
    use ndarray::{arr2, Array3, Array4, ArrayView3, ArrayView4};
    use std::sync::Mutex;

    /// Returns fixed logits per slice; each slice image is filled with its
    /// row number in `logits`
    struct ScriptedClassifier {
        logits: Array2<f32>,
        captured: Mutex<Vec<(usize, usize)>>,
    }

    impl ScriptedClassifier {
        fn new(logits: Array2<f32>) -> Self {
            Self {
                logits,
                captured: Mutex::new(Vec::new()),
            }
        }

        fn batch(&self, first_index: usize) -> SliceBatch {
            let count = self.logits.nrows();
            SliceBatch {
                tensor: Array4::from_shape_fn((count, 3, 32, 32), |(n, _, _, _)| n as f32),
                indices: (first_index..first_index + count).collect(),
            }
        }
    }

    impl Classifier for ScriptedClassifier {
        fn num_classes(&self) -> usize {
            self.logits.ncols()
        }

        fn forward(&self, batch: ArrayView4<'_, f32>) -> Result<Array2<f32>, PipelineError> {
            let rows: Vec<usize> = batch.outer_iter().map(|image| image[[0, 0, 0]] as usize).collect();
            Ok(self.logits.select(Axis(0), &rows))
        }

        fn forward_with_capture(
            &self,
            image: ArrayView3<'_, f32>,
            _layer: &str,
            class_index: usize,
        ) -> Result<LayerCapture, PipelineError> {
            let row = image[[0, 0, 0]] as usize;
            self.captured.lock().unwrap().push((row, class_index));
            Ok(LayerCapture {
                logits: self.logits.row(row).to_owned(),
                activations: Array3::ones((2, 4, 4)),
                gradients: Array3::ones((2, 4, 4)),
            })
        }
    }

    fn mixed_logits() -> Array2<f32> {
        // Three moderately confident CN slices outvote two very confident
        // MCI slices in the mean
        arr2(&[
            [2.5, 0.0, 0.0],
            [0.0, 3.0, 0.0],
            [2.5, 0.0, 0.0],
            [0.0, 3.0, 0.0],
            [2.5, 0.0, 0.0],
        ])
    }

    #[test]
    fn test_best_slice_tie_keeps_earliest() {
        let classifier = ScriptedClassifier::new(mixed_logits());
        let batch = classifier.batch(10);

        let best = find_best_slice(&classifier, &batch).unwrap();
        assert_eq!(best.position, 1);
        assert_eq!(best.slice_index, 11);
        assert_eq!(best.class, DiagnosisClass::MildCognitiveImpairment);
        assert!(best.score > 0.9);
    }

    #[test]
    fn test_best_slice_class_can_differ_from_diagnosis() {
        let classifier = ScriptedClassifier::new(mixed_logits());
        let batch = classifier.batch(0);

        let logits = classifier.forward(batch.tensor.view()).unwrap();
        let diagnosis = aggregate(&softmax_rows(&logits)).unwrap();
        assert_eq!(diagnosis.class, DiagnosisClass::CognitivelyNormal);

        let best = find_best_slice(&classifier, &batch).unwrap();
        assert_eq!(best.class, DiagnosisClass::MildCognitiveImpairment);
    }

    #[test]
    fn test_localization_explains_the_best_slice_class() {
        let classifier = ScriptedClassifier::new(mixed_logits());
        let batch = classifier.batch(20);

        let localization = localize(&classifier, &batch, &LocalizationSettings::default()).unwrap();

        assert_eq!(*classifier.captured.lock().unwrap(), vec![(1, 1)]);
        assert_eq!(localization.slice_index, 21);
        assert_eq!(localization.class, DiagnosisClass::MildCognitiveImpairment);
        assert_eq!(localization.image.dim(), (32, 32));
        assert!(localization.image.iter().all(|&v| v == 1.0));
    }

    #[test]
    fn test_non_finite_scores_are_skipped() {
        let classifier = ScriptedClassifier::new(arr2(&[
            [f32::NAN, 0.0, 0.0],
            [0.0, 0.0, 1.0],
        ]));
        let best = find_best_slice(&classifier, &classifier.batch(0)).unwrap();
        assert_eq!(best.position, 1);
        assert_eq!(best.class, DiagnosisClass::Alzheimers);

        let broken = ScriptedClassifier::new(arr2(&[[f32::NAN, 0.0, 0.0]]));
        assert!(matches!(
            find_best_slice(&broken, &broken.batch(0)),
            Err(PipelineError::Compute(_))
        ));
    }

    #[test]
    fn test_cam_weights_channels_by_mean_gradient() {
        let mut activations = Array3::<f32>::zeros((2, 2, 2));
        activations.index_axis_mut(Axis(0), 0).fill(1.0);
        activations[[1, 0, 0]] = 4.0;
        let mut gradients = Array3::<f32>::zeros((2, 2, 2));
        gradients.index_axis_mut(Axis(0), 0).fill(0.5);
        gradients.index_axis_mut(Axis(0), 1).fill(-1.0);

        let capture = LayerCapture {
            logits: ndarray::arr1(&[0.0, 0.0, 0.0]),
            activations,
            gradients,
        };
        let cam = class_activation_map(&capture).unwrap();
        // 0.5 * 1 - 1 * 4 < 0 → rectified
        assert_eq!(cam, arr2(&[[0.0, 0.5], [0.5, 0.5]]));
    }

    #[test]
    fn test_bilinear_half_pixel_centers() {
        let src = arr2(&[[0.0f32, 1.0]]);
        let out = upsample_bilinear(src.view(), 1, 4);
        let expected = [0.0, 0.25, 0.75, 1.0];
        for (a, b) in out.iter().zip(expected) {
            assert!((a - b).abs() < 1e-6, "{a} vs {b}");
        }
    }

    #[test]
    fn test_min_max_normalization_range() {
        let mut map = arr2(&[[2.0f32, 4.0], [6.0, 10.0]]);
        normalize_min_max(&mut map);
        assert!(map.iter().all(|&v| (0.0..=1.0).contains(&v)));
        assert_eq!(map[[0, 0]], 0.0);
        assert!((map[[1, 1]] - 1.0).abs() < 1e-6);

        let mut flat = Array2::<f32>::from_elem((3, 3), 5.0);
        normalize_min_max(&mut flat);
        assert!(flat.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_reflect_mirrors_including_edge() {
        assert_eq!(reflect(-1, 4), 0);
        assert_eq!(reflect(-2, 4), 1);
        assert_eq!(reflect(4, 4), 3);
        assert_eq!(reflect(5, 4), 2);
        assert_eq!(reflect(0, 1), 0);
        assert_eq!(reflect(-3, 1), 0);
    }

    #[test]
    fn test_blur_preserves_mass_and_constants() {
        let flat = Array2::<f32>::from_elem((10, 12), 0.7);
        let blurred = gaussian_blur(flat.view(), 2.0);
        assert!(blurred.iter().all(|&v| (v - 0.7).abs() < 1e-5));

        let mut impulse = Array2::<f32>::zeros((41, 41));
        impulse[[20, 20]] = 1.0;
        let blurred = gaussian_blur(impulse.view(), 2.0);
        assert!((blurred.sum() - 1.0).abs() < 1e-4);
        assert_eq!(argmax_2d(&blurred), (20, 20));
        assert!((blurred[[20, 19]] - blurred[[20, 21]]).abs() < 1e-7);
    }

    fn argmax_2d(a: &Array2<f32>) -> (usize, usize) {
        a.indexed_iter()
            .fold(((0, 0), f32::NEG_INFINITY), |(best, value), (ij, &v)| {
                if v > value { (ij, v) } else { (best, value) }
            })
            .0
    }

    #[test]
    fn test_threshold_zeroes_small_values() {
        let mut map = arr2(&[[0.1f32, 0.3], [0.29, 0.9]]);
        apply_threshold(&mut map, 0.3);
        assert_eq!(map, arr2(&[[0.0, 0.3], [0.0, 0.9]]));

        let mut untouched = arr2(&[[0.1f32, 0.2]]);
        apply_threshold(&mut untouched, 0.0);
        assert_eq!(untouched, arr2(&[[0.1, 0.2]]));
    }

    #[test]
    fn test_percentile_interpolates_linearly() {
        let values = [1.0f32, 2.0, 3.0, 4.0, 5.0];
        let p20 = percentile(&values, 20.0).unwrap();
        assert!((p20 - 1.8).abs() < 1e-6);
        assert_eq!(percentile(&values, 0.0), Some(1.0));
        assert_eq!(percentile(&values, 100.0), Some(5.0));
        assert_eq!(percentile(&[], 20.0), None);
    }

    #[test]
    fn test_labels_follow_raster_order_with_diagonals() {
        let mask = arr2(&[
            [false, false, false, true],
            [true, false, false, false],
            [false, true, false, false],
            [false, false, false, true],
        ]);
        let (labels, count) = label_components(mask.view());
        assert_eq!(count, 3);
        assert_eq!(labels[[0, 3]], 1);
        assert_eq!(labels[[1, 0]], 2);
        assert_eq!(labels[[2, 1]], 2);
        assert_eq!(labels[[3, 3]], 3);

        assert_eq!(
            component_bbox(labels.view(), 2),
            Some(BoundingBox { row_start: 1, row_end: 3, col_start: 0, col_end: 2 })
        );
    }

    #[test]
    fn test_empty_mask_leaves_map_uncropped() {
        let map = Array2::from_shape_fn((6, 6), |(i, j)| (i + j) as f32 / 10.0);
        let image = Array2::<f32>::from_elem((6, 6), -1.0);

        let (out_map, out_image, cropped) = refine_map(map.clone(), image.clone());
        assert!(!cropped);
        assert_eq!(out_map, map);
        assert_eq!(out_image, image);
    }

    #[test]
    fn test_refine_crops_to_first_component() {
        let mut image = Array2::<f32>::from_elem((8, 8), -1.0);
        image.slice_mut(s![2..5, 3..7]).fill(1.0);
        image[[6, 0]] = 1.0;
        let map = Array2::<f32>::from_elem((8, 8), 0.5);

        // 20th percentile of identical positives equals them, so nothing is
        // strictly brighter and the mask stays empty
        let (_, _, cropped) = refine_map(map.clone(), image.clone());
        assert!(!cropped);

        image[[3, 4]] = 2.0;
        image[[6, 0]] = 2.0;
        let (out_map, out_image, cropped) = refine_map(map, image);
        assert!(cropped);
        assert_eq!(out_map.dim(), (1, 1));
        assert_eq!(out_image[[0, 0]], 2.0);
        assert_eq!(out_map[[0, 0]], 0.5);
    }
}
