//! Slice ensemble inference
//!
//! Per-slice softmax, averaged across slices. The volume-level class is the
//! argmax of the mean probability vector.

use ndarray::{Array1, Array2, ArrayView1, Axis};
use neurodx_common::DiagnosisClass;
use serde::Serialize;

use super::preprocess::SliceBatch;
use crate::error::PipelineError;
use crate::model::Classifier;

/// Volume-level classification outcome
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Diagnosis {
    pub class: DiagnosisClass,
    /// Mean probability of `class`
    pub confidence: f32,
    /// Mean probability per class, indexed like [`DiagnosisClass::ALL`]
    pub probabilities: Vec<f32>,
    pub slice_count: usize,
}

impl Diagnosis {
    pub fn class_index(&self) -> usize {
        self.class.index()
    }
}

/// Row-wise numerically stable softmax
pub fn softmax_rows(logits: &Array2<f32>) -> Array2<f32> {
    let mut probabilities = logits.clone();
    for mut row in probabilities.rows_mut() {
        let max = row.fold(f32::NEG_INFINITY, |acc, &v| acc.max(v));
        row.mapv_inplace(|v| (v - max).exp());
        let sum = row.sum();
        row.mapv_inplace(|v| v / sum);
    }
    probabilities
}

/// Index of the largest value; the first one wins ties
pub fn argmax(values: ArrayView1<'_, f32>) -> Option<usize> {
    let mut best: Option<(usize, f32)> = None;
    for (index, &value) in values.iter().enumerate() {
        if best.map_or(true, |(_, current)| value > current) {
            best = Some((index, value));
        }
    }
    best.map(|(index, _)| index)
}

/// Average per-slice probabilities into one diagnosis
pub fn aggregate(probabilities: &Array2<f32>) -> Result<Diagnosis, PipelineError> {
    let (slices, classes) = probabilities.dim();
    if slices == 0 {
        return Err(PipelineError::InvalidInput("no slice probabilities".to_string()));
    }
    if classes != DiagnosisClass::COUNT {
        return Err(PipelineError::Compute(format!(
            "classifier produced {} classes, expected {}",
            classes,
            DiagnosisClass::COUNT
        )));
    }
    if probabilities.iter().any(|p| !p.is_finite()) {
        return Err(PipelineError::Compute("non-finite class probabilities".to_string()));
    }

    let mean: Array1<f32> = probabilities
        .mean_axis(Axis(0))
        .ok_or_else(|| PipelineError::InvalidInput("no slice probabilities".to_string()))?;

    let index = argmax(mean.view())
        .ok_or_else(|| PipelineError::Compute("empty probability vector".to_string()))?;
    let class = DiagnosisClass::from_index(index)
        .ok_or_else(|| PipelineError::Compute(format!("class index {} out of range", index)))?;

    Ok(Diagnosis {
        class,
        confidence: mean[index],
        probabilities: mean.to_vec(),
        slice_count: slices,
    })
}

/// Classify every slice of the batch and aggregate the result
pub fn diagnose(classifier: &dyn Classifier, batch: &SliceBatch) -> Result<Diagnosis, PipelineError> {
    let logits = classifier.forward(batch.tensor.view())?;
    if logits.nrows() != batch.len() {
        return Err(PipelineError::Compute(format!(
            "classifier returned {} rows for {} slices",
            logits.nrows(),
            batch.len()
        )));
    }

    let probabilities = softmax_rows(&logits);
    for (row, index) in probabilities.rows().into_iter().zip(&batch.indices) {
        tracing::debug!(slice = index, probabilities = ?row.to_vec(), "Slice probabilities");
    }

    aggregate(&probabilities)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr2;

    #[test]
    fn test_softmax_rows_sum_to_one() {
        let logits = arr2(&[[1.0f32, 2.0, 3.0], [1000.0, 1000.0, -1000.0], [0.0, 0.0, 0.0]]);
        let probabilities = softmax_rows(&logits);
        for row in probabilities.rows() {
            assert!((row.sum() - 1.0).abs() < 1e-5);
            assert!(row.iter().all(|p| p.is_finite() && *p >= 0.0));
        }
        assert!((probabilities[[2, 0]] - 1.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn test_argmax_prefers_first_maximum() {
        let values = ndarray::arr1(&[0.2f32, 0.4, 0.4]);
        assert_eq!(argmax(values.view()), Some(1));
        assert_eq!(argmax(ndarray::arr1::<f32>(&[]).view()), None);
    }

    #[test]
    fn test_aggregate_averages_slices() {
        let probabilities = arr2(&[[0.7f32, 0.2, 0.1], [0.1, 0.2, 0.7], [0.4, 0.5, 0.1]]);
        let diagnosis = aggregate(&probabilities).unwrap();

        assert_eq!(diagnosis.class, DiagnosisClass::CognitivelyNormal);
        assert!((diagnosis.confidence - 0.4).abs() < 1e-6);
        assert!((diagnosis.probabilities.iter().sum::<f32>() - 1.0).abs() < 1e-5);
        assert_eq!(diagnosis.slice_count, 3);
    }

    #[test]
    fn test_aggregate_rejects_wrong_class_count() {
        let probabilities = arr2(&[[0.5f32, 0.5]]);
        assert!(matches!(aggregate(&probabilities), Err(PipelineError::Compute(_))));
    }

    #[test]
    fn test_aggregate_rejects_nan() {
        let probabilities = arr2(&[[f32::NAN, 0.5, 0.5]]);
        assert!(aggregate(&probabilities).is_err());
    }
}
