//! Volume → diagnosis + localization artifact
//!
//! CPU-bound and synchronous; the orchestrator runs it on the blocking pool.

pub mod inference;
pub mod localization;
pub mod preprocess;
pub mod render;

pub use inference::{aggregate, diagnose, softmax_rows, Diagnosis};
pub use localization::{localize, LocalizationMap, LocalizationSettings};
pub use preprocess::{preprocess_slices, SliceBatch, INPUT_CHANNELS, INPUT_SIZE};
pub use render::{render_overlay, save_overlay};

use neurodx_common::config::PipelineConfig;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::PipelineError;
use crate::model::Classifier;
use crate::volume::{canonicalize, load_nifti, select_slices, Volume};

/// Turns one local volume file into a diagnosis and an overlay PNG
pub trait ScanAnalyzer: Send + Sync {
    fn analyze(&self, volume_path: &Path, artifact_path: &Path) -> Result<Diagnosis, PipelineError>;
}

/// Pipeline parameters outside the classifier itself
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineSettings {
    pub num_slices: usize,
    pub localization: LocalizationSettings,
    /// Directory for preprocessed slice dumps; `None` disables them
    pub debug_dir: Option<PathBuf>,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            num_slices: crate::volume::DEFAULT_SLICE_COUNT,
            localization: LocalizationSettings::default(),
            debug_dir: None,
        }
    }
}

impl From<&PipelineConfig> for PipelineSettings {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            num_slices: config.num_slices,
            localization: LocalizationSettings {
                target_layer: config.target_layer.clone(),
                threshold: config.threshold,
                apply_blur: config.apply_blur,
                blur_sigma: config.blur_sigma,
            },
            debug_dir: config.save_debug_slices.then(|| config.debug_dir.clone()),
        }
    }
}

/// Production analyzer over a shared classifier
#[derive(Clone)]
pub struct DiagnosticPipeline {
    classifier: Arc<dyn Classifier>,
    settings: PipelineSettings,
}

impl DiagnosticPipeline {
    pub fn new(classifier: Arc<dyn Classifier>, settings: PipelineSettings) -> Self {
        Self {
            classifier,
            settings,
        }
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// Load a volume and bring it to RAS
    pub fn prepare_volume(&self, volume_path: &Path) -> Result<Volume, PipelineError> {
        let raw = load_nifti(volume_path)?;
        tracing::info!(path = %volume_path.display(), shape = ?raw.shape(), "Volume loaded");

        let canonical = canonicalize(raw);
        tracing::info!(
            input = %canonical.input_codes,
            output = %canonical.output_codes(),
            "Orientation normalized"
        );
        Ok(canonical.volume)
    }

    /// Select and preprocess the centered slices of a RAS volume
    pub fn slice_batch(&self, volume: &Volume) -> Result<SliceBatch, PipelineError> {
        let slices = select_slices(volume, self.settings.num_slices)?;
        preprocess_slices(&slices)
    }

    /// Mean-probability diagnosis of a RAS volume
    pub fn diagnose_volume(&self, volume: &Volume, volume_path: &Path) -> Result<Diagnosis, PipelineError> {
        let batch = self.slice_batch(volume)?;
        tracing::info!(
            slices = ?batch.indices,
            "Running inference on {} slices",
            batch.len()
        );

        if let Some(debug_dir) = &self.settings.debug_dir {
            preprocess::save_debug_slices(&batch, debug_dir, &preprocess::volume_stem(volume_path))?;
        }

        diagnose(self.classifier.as_ref(), &batch)
    }

    /// Localization map of a RAS volume, from its own slice batch
    pub fn localize_volume(&self, volume: &Volume) -> Result<LocalizationMap, PipelineError> {
        let batch = self.slice_batch(volume)?;
        localize(self.classifier.as_ref(), &batch, &self.settings.localization)
    }
}

impl ScanAnalyzer for DiagnosticPipeline {
    fn analyze(&self, volume_path: &Path, artifact_path: &Path) -> Result<Diagnosis, PipelineError> {
        let volume = self.prepare_volume(volume_path)?;

        let diagnosis = self.diagnose_volume(&volume, volume_path)?;
        tracing::info!(
            class = %diagnosis.class,
            confidence = diagnosis.confidence,
            probabilities = ?diagnosis.probabilities,
            "Diagnosis"
        );

        let localization = self.localize_volume(&volume)?;
        save_overlay(&localization, artifact_path)?;
        tracing::info!(
            artifact = %artifact_path.display(),
            slice = localization.slice_index,
            cropped = localization.cropped,
            "Localization map rendered"
        );

        Ok(diagnosis)
    }
}
