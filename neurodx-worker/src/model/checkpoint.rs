//! PyTorch `state_dict` import
//!
//! Trained weights ship as a `torch.save(model.state_dict())` archive. The
//! tensors are read with candle's pickle reader and handed to
//! [`DenseNet::load_state_dict`](super::DenseNet::load_state_dict), which
//! assigns them by their PyTorch parameter names.

use burn::module::Param;
use burn::prelude::*;
use candle_core::DType;
use std::collections::BTreeMap;
use std::path::Path;

use crate::error::PipelineError;

/// Counter buffers PyTorch keeps next to batch norm statistics
const IGNORED_SUFFIX: &str = ".num_batches_tracked";

/// Named tensors keyed by PyTorch parameter path
#[derive(Debug, Default, Clone)]
pub struct StateDict {
    tensors: BTreeMap<String, TensorData>,
}

impl StateDict {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read every tensor of a `.pth`/`.pt` archive as `f32`
    pub fn read_pth(path: &Path) -> Result<Self, PipelineError> {
        let unreadable = |e: candle_core::Error| {
            PipelineError::Compute(format!("failed to read checkpoint {}: {}", path.display(), e))
        };

        let mut dict = Self::new();
        for (name, tensor) in candle_core::pickle::read_all(path).map_err(unreadable)? {
            if name.ends_with(IGNORED_SUFFIX) {
                continue;
            }
            let shape = tensor.dims().to_vec();
            let values = tensor
                .to_dtype(DType::F32)
                .and_then(|t| t.flatten_all())
                .and_then(|t| t.to_vec1::<f32>())
                .map_err(unreadable)?;
            dict.insert(name, TensorData::new(values, shape));
        }

        tracing::debug!(path = %path.display(), tensors = dict.len(), "Checkpoint read");
        Ok(dict)
    }

    pub fn insert(&mut self, name: impl Into<String>, data: TensorData) {
        self.tensors.insert(name.into(), data);
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    pub fn shape(&self, name: &str) -> Option<&[usize]> {
        self.tensors.get(name).map(|data| data.shape.as_slice())
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tensors.keys().map(String::as_str)
    }

    /// Remove a tensor and check it has the expected shape
    pub(crate) fn take_tensor<B: Backend, const D: usize>(
        &mut self,
        name: &str,
        shape: [usize; D],
        device: &B::Device,
    ) -> Result<Tensor<B, D>, PipelineError> {
        let data = self
            .tensors
            .remove(name)
            .ok_or_else(|| PipelineError::Compute(format!("checkpoint has no tensor {}", name)))?;
        if data.shape != shape {
            return Err(PipelineError::Compute(format!(
                "checkpoint tensor {} has shape {:?}, expected {:?}",
                name, data.shape, shape
            )));
        }
        Ok(Tensor::from_data(data, device))
    }

    pub(crate) fn take_param<B: Backend, const D: usize>(
        &mut self,
        name: &str,
        shape: [usize; D],
        device: &B::Device,
    ) -> Result<Param<Tensor<B, D>>, PipelineError> {
        self.take_tensor(name, shape, device).map(Param::from_tensor)
    }

    pub(crate) fn put<B: Backend, const D: usize>(&mut self, name: impl Into<String>, tensor: Tensor<B, D>) {
        self.insert(name, tensor.into_data());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    #[test]
    fn test_take_checks_shape_and_presence() {
        let device = Default::default();
        let mut dict = StateDict::new();
        dict.insert("features.norm0.weight", TensorData::new(vec![1.0f32, 2.0], [2]));
        dict.insert("features.norm0.bias", TensorData::new(vec![0.0f32; 3], [3]));

        let weight = dict
            .take_tensor::<NdArray, 1>("features.norm0.weight", [2], &device)
            .unwrap();
        assert_eq!(weight.into_data().to_vec::<f32>().unwrap(), vec![1.0, 2.0]);
        assert!(dict.shape("features.norm0.weight").is_none());

        let err = dict
            .take_tensor::<NdArray, 1>("features.norm0.bias", [2], &device)
            .unwrap_err();
        assert!(err.to_string().contains("[3]"));

        let err = dict
            .take_tensor::<NdArray, 1>("features.norm5.weight", [2], &device)
            .unwrap_err();
        assert!(err.to_string().contains("features.norm5.weight"));
    }

    #[test]
    fn test_missing_archive_is_compute_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let err = StateDict::read_pth(&dir.path().join("absent.pth")).unwrap_err();
        assert!(matches!(err, PipelineError::Compute(_)));
    }
}
