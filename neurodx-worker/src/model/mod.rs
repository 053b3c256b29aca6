//! Slice classifier
//!
//! The pipeline only sees the [`Classifier`] trait; [`BurnClassifier`] is the
//! DenseNet implementation loaded once at startup and shared by `Arc`.

pub mod checkpoint;
pub mod densenet;
pub mod engine;

pub use checkpoint::StateDict;
pub use densenet::{DenseNet, DenseNetConfig, FeatureStage};
pub use engine::BurnClassifier;

use ndarray::{Array1, Array2, Array3, ArrayView3, ArrayView4};

use crate::error::PipelineError;

/// Activations and gradients of one named layer for a single image
///
/// Produced by one explicit forward/backward call; nothing stays attached
/// to the network afterwards.
#[derive(Debug, Clone)]
pub struct LayerCapture {
    /// Raw class scores of the image, shape `(classes,)`
    pub logits: Array1<f32>,
    /// Layer output, shape `(channels, height, width)`
    pub activations: Array3<f32>,
    /// Gradient of the chosen class logit with respect to the layer output
    pub gradients: Array3<f32>,
}

/// Immutable image classifier over `(batch, 3, H, W)` inputs
pub trait Classifier: Send + Sync {
    fn num_classes(&self) -> usize;

    /// Raw class scores, shape `(batch, classes)`
    fn forward(&self, batch: ArrayView4<'_, f32>) -> Result<Array2<f32>, PipelineError>;

    /// Single-image forward pass that backpropagates the logit of
    /// `class_index` and returns the named layer's activations and gradients
    fn forward_with_capture(
        &self,
        image: ArrayView3<'_, f32>,
        layer: &str,
        class_index: usize,
    ) -> Result<LayerCapture, PipelineError>;
}
