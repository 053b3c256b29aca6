//! CPU inference engine around the burn DenseNet
//!
//! Plain forward passes run on the `NdArray` backend. Layer capture splits the
//! network at the requested stage: the head runs without gradient tracking,
//! its output becomes the only tracked leaf, and the tail runs under
//! `Autodiff` so the class logit can be backpropagated onto it.

use burn::backend::ndarray::NdArrayDevice;
use burn::backend::{Autodiff, NdArray};
use burn::module::AutodiffModule;
use burn::prelude::*;
use burn::record::{FullPrecisionSettings, NamedMpkFileRecorder};
use ndarray::{Array1, Array2, Array3, ArrayView3, ArrayView4};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use super::checkpoint::StateDict;
use super::densenet::{DenseNet, DenseNetConfig};
use super::{Classifier, LayerCapture};
use crate::error::PipelineError;

type InferenceBackend = NdArray<f32>;
type GradientBackend = Autodiff<InferenceBackend>;

/// DenseNet classifier shared read-only across tasks
///
/// burn modules are not `Sync`, so each copy sits behind a mutex. Locks are
/// always taken inference first, then gradient. Forward passes never mutate
/// the network, so a lock poisoned by a panicking task is taken over as is.
pub struct BurnClassifier {
    inference: Mutex<DenseNet<InferenceBackend>>,
    gradient: Mutex<DenseNet<GradientBackend>>,
    num_classes: usize,
    in_channels: usize,
    min_extent: usize,
    device: NdArrayDevice,
}

impl std::fmt::Debug for BurnClassifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BurnClassifier")
            .field("num_classes", &self.num_classes)
            .field("in_channels", &self.in_channels)
            .finish_non_exhaustive()
    }
}

impl BurnClassifier {
    /// Wrap an already built network
    pub fn new(model: DenseNet<GradientBackend>, device: NdArrayDevice) -> Self {
        let model = model.no_grad();
        let inference = model.valid();
        Self {
            num_classes: model.num_classes(),
            in_channels: model.in_channels(),
            min_extent: model.min_input_extent(),
            inference: Mutex::new(inference),
            gradient: Mutex::new(model),
            device,
        }
    }

    /// Randomly initialized network; used for tests and dry runs
    pub fn from_config(config: &DenseNetConfig) -> Self {
        let device = NdArrayDevice::Cpu;
        Self::new(config.init::<GradientBackend>(&device), device)
    }

    /// Load trained weights
    ///
    /// `.pth`/`.pt` files are PyTorch `state_dict` archives; anything else is
    /// read as a burn named-MessagePack record. The architecture comes from
    /// `config_path` (JSON) when given, DenseNet-121 otherwise.
    pub fn load(weights_path: &Path, config_path: Option<&Path>) -> Result<Self, PipelineError> {
        let config = match config_path {
            Some(path) => load_config(path)?,
            None => DenseNetConfig::densenet121(),
        };

        let device = NdArrayDevice::Cpu;
        let model = config.init::<GradientBackend>(&device);
        let model = if is_pytorch_checkpoint(weights_path) {
            model.load_state_dict(StateDict::read_pth(weights_path)?, &device)?
        } else {
            let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::new();
            model
                .load_file(weights_path.to_path_buf(), &recorder, &device)
                .map_err(|e| {
                    PipelineError::Compute(format!(
                        "failed to load weights from {}: {}",
                        weights_path.display(),
                        e
                    ))
                })?
        };

        tracing::info!(
            weights = %weights_path.display(),
            blocks = ?config.block_config,
            growth_rate = config.growth_rate,
            classes = config.num_classes,
            "Classifier loaded"
        );
        Ok(Self::new(model, device))
    }

    fn check_image_shape(&self, channels: usize, height: usize, width: usize) -> Result<(), PipelineError> {
        if channels != self.in_channels {
            return Err(PipelineError::Compute(format!(
                "expected {} input channels, got {}",
                self.in_channels, channels
            )));
        }
        if height < self.min_extent || width < self.min_extent {
            return Err(PipelineError::Compute(format!(
                "input {}x{} is smaller than {}x{}",
                height, width, self.min_extent, self.min_extent
            )));
        }
        Ok(())
    }

    fn lock_inference(&self) -> MutexGuard<'_, DenseNet<InferenceBackend>> {
        recover(&self.inference)
    }

    fn lock_gradient(&self) -> MutexGuard<'_, DenseNet<GradientBackend>> {
        recover(&self.gradient)
    }
}

fn recover<T>(lock: &Mutex<T>) -> MutexGuard<'_, T> {
    lock.lock().unwrap_or_else(|poisoned| {
        tracing::warn!("Classifier lock was poisoned by a panicked task; continuing");
        lock.clear_poison();
        poisoned.into_inner()
    })
}

fn is_pytorch_checkpoint(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("pth") | Some("pt")
    )
}

/// Read an architecture description saved with `DenseNetConfig::save`
pub fn load_config(path: &Path) -> Result<DenseNetConfig, PipelineError> {
    DenseNetConfig::load(path).map_err(|e| {
        PipelineError::Compute(format!("invalid model config {}: {}", path.display(), e))
    })
}

impl Classifier for BurnClassifier {
    fn num_classes(&self) -> usize {
        self.num_classes
    }

    fn forward(&self, batch: ArrayView4<'_, f32>) -> Result<Array2<f32>, PipelineError> {
        let (count, channels, height, width) = batch.dim();
        if count == 0 {
            return Err(PipelineError::InvalidInput("empty batch".to_string()));
        }
        self.check_image_shape(channels, height, width)?;

        let data = TensorData::new(batch.iter().copied().collect::<Vec<f32>>(), [count, channels, height, width]);
        let input = Tensor::<InferenceBackend, 4>::from_data(data, &self.device);

        let logits = self.lock_inference().forward(input);
        let [rows, classes] = logits.dims();
        let values = tensor_values(logits.into_data())?;
        Array2::from_shape_vec((rows, classes), values).map_err(|e| PipelineError::Compute(e.to_string()))
    }

    fn forward_with_capture(
        &self,
        image: ArrayView3<'_, f32>,
        layer: &str,
        class_index: usize,
    ) -> Result<LayerCapture, PipelineError> {
        let (channels, height, width) = image.dim();
        self.check_image_shape(channels, height, width)?;
        if class_index >= self.num_classes {
            return Err(PipelineError::Compute(format!(
                "class index {} out of range for {} classes",
                class_index, self.num_classes
            )));
        }

        let inference = self.lock_inference();
        let stage = inference
            .stage_index(layer)
            .ok_or_else(|| PipelineError::MissingLayer(layer.to_string()))?;
        let total = inference.stages().len();

        let data = TensorData::new(image.iter().copied().collect::<Vec<f32>>(), [1, channels, height, width]);
        let input = Tensor::<InferenceBackend, 4>::from_data(data, &self.device);
        let activation = inference.forward_stages(input, 0..stage + 1);
        drop(inference);

        let activation = Tensor::<GradientBackend, 4>::from_inner(activation).require_grad();
        let gradient_model = self.lock_gradient();
        let logits = gradient_model.head(gradient_model.forward_stages(activation.clone(), stage + 1..total));
        drop(gradient_model);

        let target = logits
            .clone()
            .slice([0..1, class_index..class_index + 1])
            .sum();
        let grads = target.backward();
        let gradient = activation
            .grad(&grads)
            .ok_or_else(|| PipelineError::Compute(format!("no gradient reached {}", layer)))?;

        let [_, feature_channels, feature_height, feature_width] = gradient.dims();
        let shape = (feature_channels, feature_height, feature_width);

        let activations = Array3::from_shape_vec(shape, tensor_values(activation.inner().into_data())?)
            .map_err(|e| PipelineError::Compute(e.to_string()))?;
        let gradients = Array3::from_shape_vec(shape, tensor_values(gradient.into_data())?)
            .map_err(|e| PipelineError::Compute(e.to_string()))?;
        let logits = Array1::from(tensor_values(logits.inner().into_data())?);

        Ok(LayerCapture {
            logits,
            activations,
            gradients,
        })
    }
}

fn tensor_values(data: TensorData) -> Result<Vec<f32>, PipelineError> {
    data.to_vec::<f32>()
        .map_err(|e| PipelineError::Compute(format!("tensor readback failed: {:?}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array3, Array4};

    fn tiny_classifier() -> BurnClassifier {
        BurnClassifier::from_config(
            &DenseNetConfig::new(vec![1, 1])
                .with_growth_rate(4)
                .with_init_features(8)
                .with_bn_size(2),
        )
    }

    fn ramp_image() -> Array3<f32> {
        Array3::from_shape_fn((3, 64, 64), |(_, i, j)| ((i * 64 + j) as f32 / 4096.0) - 0.5)
    }

    #[test]
    fn test_forward_shape() {
        let classifier = tiny_classifier();
        let batch = Array4::<f32>::zeros((4, 3, 64, 64));
        let logits = classifier.forward(batch.view()).unwrap();
        assert_eq!(logits.dim(), (4, 3));
    }

    #[test]
    fn test_wrong_channel_count_is_compute_error() {
        let classifier = tiny_classifier();
        let batch = Array4::<f32>::zeros((1, 1, 64, 64));
        assert!(matches!(
            classifier.forward(batch.view()),
            Err(PipelineError::Compute(_))
        ));
    }

    #[test]
    fn test_capture_returns_layer_tensors() {
        let classifier = tiny_classifier();
        let image = ramp_image();

        let capture = classifier
            .forward_with_capture(image.view(), "features.denseblock1", 1)
            .unwrap();

        // stem: 64 → 32 (conv) → 16 (pool); block keeps the extent
        assert_eq!(capture.activations.dim(), (12, 16, 16));
        assert_eq!(capture.gradients.dim(), capture.activations.dim());
        assert_eq!(capture.logits.len(), 3);
    }

    #[test]
    fn test_capture_logits_match_forward() {
        let classifier = tiny_classifier();
        let image = ramp_image();

        let capture = classifier
            .forward_with_capture(image.view(), "features.transition1", 0)
            .unwrap();
        let batch = image.insert_axis(ndarray::Axis(0));
        let logits = classifier.forward(batch.view()).unwrap();

        for (a, b) in capture.logits.iter().zip(logits.row(0)) {
            assert!((a - b).abs() < 1e-4);
        }
    }

    #[test]
    fn test_unknown_layer_is_missing_layer() {
        let classifier = tiny_classifier();
        let err = classifier
            .forward_with_capture(ramp_image().view(), "features.denseblock7", 0)
            .unwrap_err();
        assert!(matches!(err, PipelineError::MissingLayer(_)));
    }

    #[test]
    fn test_panic_while_holding_inference_lock_is_survived() {
        let classifier = tiny_classifier();
        std::thread::scope(|scope| {
            let crashed = scope
                .spawn(|| {
                    let _model = classifier.inference.lock().unwrap();
                    panic!("task crashed mid-inference");
                })
                .join();
            assert!(crashed.is_err());
        });
        assert!(classifier.inference.is_poisoned());

        let batch = Array4::<f32>::zeros((1, 3, 64, 64));
        assert!(classifier.forward(batch.view()).is_ok());
        assert!(!classifier.inference.is_poisoned());
        assert!(classifier
            .forward_with_capture(ramp_image().view(), "features.denseblock1", 0)
            .is_ok());
    }

    #[test]
    fn test_panic_while_holding_gradient_lock_is_survived() {
        let classifier = tiny_classifier();
        std::thread::scope(|scope| {
            let crashed = scope
                .spawn(|| {
                    let _model = classifier.gradient.lock().unwrap();
                    panic!("task crashed mid-backward");
                })
                .join();
            assert!(crashed.is_err());
        });

        let capture = classifier
            .forward_with_capture(ramp_image().view(), "features.transition1", 2)
            .unwrap();
        assert_eq!(capture.logits.len(), 3);
    }

    #[test]
    fn test_input_too_small_for_network_depth_is_rejected() {
        let classifier = BurnClassifier::from_config(
            &DenseNetConfig::new(vec![1, 1, 1, 1, 1])
                .with_growth_rate(4)
                .with_init_features(8)
                .with_bn_size(2),
        );

        let small = Array4::<f32>::zeros((1, 3, 32, 32));
        match classifier.forward(small.view()) {
            Err(PipelineError::Compute(message)) => assert!(message.contains("64x64")),
            other => panic!("expected compute error, got {:?}", other),
        }

        let fits = Array4::<f32>::zeros((1, 3, 64, 64));
        assert_eq!(classifier.forward(fits.view()).unwrap().dim(), (1, 3));
    }

    #[test]
    fn test_weight_format_follows_extension() {
        assert!(is_pytorch_checkpoint(Path::new("fullyunfrozen_2.pth")));
        assert!(is_pytorch_checkpoint(Path::new("/models/densenet.pt")));
        assert!(!is_pytorch_checkpoint(Path::new("densenet121.mpk")));
        assert!(!is_pytorch_checkpoint(Path::new("weights")));
    }

    #[test]
    fn test_missing_checkpoint_is_compute_error() {
        let dir = tempfile::TempDir::new().unwrap();
        for name in ["absent.pth", "absent.mpk"] {
            let err = BurnClassifier::load(&dir.path().join(name), None).unwrap_err();
            assert!(matches!(err, PipelineError::Compute(_)), "{name}: {err}");
        }
    }

    #[test]
    fn test_named_record_round_trip() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = DenseNetConfig::new(vec![1, 1])
            .with_growth_rate(4)
            .with_init_features(8)
            .with_bn_size(2);
        let config_path = dir.path().join("densenet.json");
        config.save(&config_path).unwrap();

        let device = NdArrayDevice::Cpu;
        let model = config.init::<InferenceBackend>(&device);
        let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::new();
        model
            .clone()
            .save_file(dir.path().join("weights"), &recorder)
            .unwrap();

        let classifier =
            BurnClassifier::load(&dir.path().join("weights.mpk"), Some(&config_path)).unwrap();
        let image = ramp_image();
        let batch = image.clone().insert_axis(ndarray::Axis(0));
        let logits = classifier.forward(batch.view()).unwrap();

        let data = TensorData::new(image.iter().copied().collect::<Vec<f32>>(), [1, 3, 64, 64]);
        let expected = model
            .forward(Tensor::<InferenceBackend, 4>::from_data(data, &device))
            .into_data()
            .to_vec::<f32>()
            .unwrap();
        for (a, b) in logits.iter().zip(&expected) {
            assert!((a - b).abs() < 1e-5);
        }
    }

    #[test]
    fn test_config_round_trips_through_json() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("densenet.json");
        let config = DenseNetConfig::new(vec![2, 3]).with_growth_rate(8);
        config.save(&path).unwrap();

        let loaded = load_config(&path).unwrap();
        assert_eq!(loaded.block_config, vec![2, 3]);
        assert_eq!(loaded.growth_rate, 8);
        assert_eq!(loaded.num_classes, 3);
    }
}
