//! 2D DenseNet built with burn
//!
//! Layer naming follows the common `features.*` convention so localization
//! targets can be given as `features.denseblock3`, `features.norm5`, ...
//! Parameters map one to one onto the PyTorch (MONAI `DenseNet121`)
//! `state_dict` names, see [`DenseNet::load_state_dict`].

use burn::module::Param;
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::pool::{
    AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig, AvgPool2d, AvgPool2dConfig, MaxPool2d,
    MaxPool2dConfig,
};
use burn::nn::{Linear, LinearConfig, PaddingConfig2d};
use burn::prelude::*;
use burn::tensor::activation::relu;
use std::ops::Range;

use super::checkpoint::StateDict;
use crate::error::PipelineError;

const BATCH_NORM_EPSILON: f64 = 1e-5;

/// Architecture hyper-parameters
#[derive(Config, Debug)]
pub struct DenseNetConfig {
    /// Number of dense layers in each block
    pub block_config: Vec<usize>,
    #[config(default = 3)]
    pub in_channels: usize,
    #[config(default = 3)]
    pub num_classes: usize,
    #[config(default = 32)]
    pub growth_rate: usize,
    #[config(default = 64)]
    pub init_features: usize,
    /// Bottleneck width multiplier (`bn_size * growth_rate` channels)
    #[config(default = 4)]
    pub bn_size: usize,
}

impl DenseNetConfig {
    /// DenseNet-121: blocks of 6, 12, 24 and 16 layers
    pub fn densenet121() -> Self {
        Self::new(vec![6, 12, 24, 16])
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> DenseNet<B> {
        let conv0 = Conv2dConfig::new([self.in_channels, self.init_features], [7, 7])
            .with_stride([2, 2])
            .with_padding(PaddingConfig2d::Explicit(3, 3))
            .with_bias(false)
            .init(device);
        let pool0 = MaxPool2dConfig::new([3, 3])
            .with_strides([2, 2])
            .with_padding(PaddingConfig2d::Explicit(1, 1))
            .init();

        let mut channels = self.init_features;
        let mut blocks = Vec::with_capacity(self.block_config.len());
        let mut transitions = Vec::with_capacity(self.block_config.len().saturating_sub(1));

        for (i, &layers) in self.block_config.iter().enumerate() {
            blocks.push(DenseBlock::new(
                layers,
                channels,
                self.growth_rate,
                self.bn_size,
                device,
            ));
            channels += layers * self.growth_rate;

            if i + 1 < self.block_config.len() {
                transitions.push(Transition::new(channels, channels / 2, device));
                channels /= 2;
            }
        }

        DenseNet {
            conv0,
            norm0: FrozenBatchNorm::new(self.init_features, device),
            pool0,
            blocks,
            transitions,
            norm5: FrozenBatchNorm::new(channels, device),
            pool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
            classifier: LinearConfig::new(channels, self.num_classes).init(device),
        }
    }
}

/// Batch normalization using stored statistics only
///
/// Behaves the same under an autodiff backend as under plain inference.
#[derive(Module, Debug)]
pub struct FrozenBatchNorm<B: Backend> {
    pub weight: Param<Tensor<B, 1>>,
    pub bias: Param<Tensor<B, 1>>,
    pub running_mean: Param<Tensor<B, 1>>,
    pub running_var: Param<Tensor<B, 1>>,
}

impl<B: Backend> FrozenBatchNorm<B> {
    pub fn new(channels: usize, device: &B::Device) -> Self {
        Self {
            weight: Param::from_tensor(Tensor::ones([channels], device)),
            bias: Param::from_tensor(Tensor::zeros([channels], device)),
            running_mean: Param::from_tensor(Tensor::zeros([channels], device)),
            running_var: Param::from_tensor(Tensor::ones([channels], device)),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let [channels] = self.weight.dims();
        let scale = self
            .weight
            .val()
            .div(self.running_var.val().add_scalar(BATCH_NORM_EPSILON).sqrt());
        let shift = self.bias.val().sub(self.running_mean.val().mul(scale.clone()));

        x.mul(scale.reshape([1, channels, 1, 1]))
            .add(shift.reshape([1, channels, 1, 1]))
    }

    fn load_state_dict(self, dict: &mut StateDict, prefix: &str, device: &B::Device) -> Result<Self, PipelineError> {
        let shape = self.weight.dims();
        Ok(Self {
            weight: dict.take_param(&format!("{prefix}.weight"), shape, device)?,
            bias: dict.take_param(&format!("{prefix}.bias"), shape, device)?,
            running_mean: dict.take_param(&format!("{prefix}.running_mean"), shape, device)?,
            running_var: dict.take_param(&format!("{prefix}.running_var"), shape, device)?,
        })
    }

    fn export(&self, dict: &mut StateDict, prefix: &str) {
        dict.put(format!("{prefix}.weight"), self.weight.val());
        dict.put(format!("{prefix}.bias"), self.bias.val());
        dict.put(format!("{prefix}.running_mean"), self.running_mean.val());
        dict.put(format!("{prefix}.running_var"), self.running_var.val());
    }
}

fn load_conv<B: Backend>(
    mut conv: Conv2d<B>,
    dict: &mut StateDict,
    prefix: &str,
    device: &B::Device,
) -> Result<Conv2d<B>, PipelineError> {
    conv.weight = dict.take_param(&format!("{prefix}.weight"), conv.weight.dims(), device)?;
    Ok(conv)
}

/// BN → ReLU → 1×1 conv → BN → ReLU → 3×3 conv, concatenated onto its input
#[derive(Module, Debug)]
pub struct DenseLayer<B: Backend> {
    norm1: FrozenBatchNorm<B>,
    conv1: Conv2d<B>,
    norm2: FrozenBatchNorm<B>,
    conv2: Conv2d<B>,
}

impl<B: Backend> DenseLayer<B> {
    fn new(in_channels: usize, growth_rate: usize, bn_size: usize, device: &B::Device) -> Self {
        let bottleneck = bn_size * growth_rate;
        Self {
            norm1: FrozenBatchNorm::new(in_channels, device),
            conv1: Conv2dConfig::new([in_channels, bottleneck], [1, 1])
                .with_bias(false)
                .init(device),
            norm2: FrozenBatchNorm::new(bottleneck, device),
            conv2: Conv2dConfig::new([bottleneck, growth_rate], [3, 3])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .with_bias(false)
                .init(device),
        }
    }

    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let out = self.conv1.forward(relu(self.norm1.forward(x.clone())));
        let out = self.conv2.forward(relu(self.norm2.forward(out)));
        Tensor::cat(vec![x, out], 1)
    }

    fn load_state_dict(self, dict: &mut StateDict, prefix: &str, device: &B::Device) -> Result<Self, PipelineError> {
        Ok(Self {
            norm1: self.norm1.load_state_dict(dict, &format!("{prefix}.norm1"), device)?,
            conv1: load_conv(self.conv1, dict, &format!("{prefix}.conv1"), device)?,
            norm2: self.norm2.load_state_dict(dict, &format!("{prefix}.norm2"), device)?,
            conv2: load_conv(self.conv2, dict, &format!("{prefix}.conv2"), device)?,
        })
    }

    fn export(&self, dict: &mut StateDict, prefix: &str) {
        self.norm1.export(dict, &format!("{prefix}.norm1"));
        dict.put(format!("{prefix}.conv1.weight"), self.conv1.weight.val());
        self.norm2.export(dict, &format!("{prefix}.norm2"));
        dict.put(format!("{prefix}.conv2.weight"), self.conv2.weight.val());
    }
}

#[derive(Module, Debug)]
pub struct DenseBlock<B: Backend> {
    layers: Vec<DenseLayer<B>>,
}

impl<B: Backend> DenseBlock<B> {
    fn new(
        num_layers: usize,
        in_channels: usize,
        growth_rate: usize,
        bn_size: usize,
        device: &B::Device,
    ) -> Self {
        let layers = (0..num_layers)
            .map(|i| DenseLayer::new(in_channels + i * growth_rate, growth_rate, bn_size, device))
            .collect();
        Self { layers }
    }

    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        self.layers.iter().fold(x, |x, layer| layer.forward(x))
    }
}

/// BN → ReLU → 1×1 conv → 2×2 average pool
#[derive(Module, Debug)]
pub struct Transition<B: Backend> {
    norm: FrozenBatchNorm<B>,
    conv: Conv2d<B>,
    pool: AvgPool2d,
}

impl<B: Backend> Transition<B> {
    fn new(in_channels: usize, out_channels: usize, device: &B::Device) -> Self {
        Self {
            norm: FrozenBatchNorm::new(in_channels, device),
            conv: Conv2dConfig::new([in_channels, out_channels], [1, 1])
                .with_bias(false)
                .init(device),
            pool: AvgPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),
        }
    }

    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        self.pool.forward(self.conv.forward(relu(self.norm.forward(x))))
    }

    fn load_state_dict(self, dict: &mut StateDict, prefix: &str, device: &B::Device) -> Result<Self, PipelineError> {
        Ok(Self {
            norm: self.norm.load_state_dict(dict, &format!("{prefix}.norm"), device)?,
            conv: load_conv(self.conv, dict, &format!("{prefix}.conv"), device)?,
            pool: self.pool,
        })
    }
}

/// One addressable stage of the feature extractor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeatureStage {
    /// conv0 → norm0 → relu0 → pool0
    Stem,
    DenseBlock(usize),
    Transition(usize),
    /// Final batch norm before the classifier head
    Norm,
}

impl FeatureStage {
    pub fn name(&self) -> String {
        match self {
            FeatureStage::Stem => "features.pool0".to_string(),
            FeatureStage::DenseBlock(i) => format!("features.denseblock{}", i + 1),
            FeatureStage::Transition(i) => format!("features.transition{}", i + 1),
            FeatureStage::Norm => "features.norm5".to_string(),
        }
    }
}

#[derive(Module, Debug)]
pub struct DenseNet<B: Backend> {
    conv0: Conv2d<B>,
    norm0: FrozenBatchNorm<B>,
    pool0: MaxPool2d,
    blocks: Vec<DenseBlock<B>>,
    transitions: Vec<Transition<B>>,
    norm5: FrozenBatchNorm<B>,
    pool: AdaptiveAvgPool2d,
    classifier: Linear<B>,
}

impl<B: Backend> DenseNet<B> {
    /// Feature stages in execution order
    pub fn stages(&self) -> Vec<FeatureStage> {
        let mut stages = vec![FeatureStage::Stem];
        for i in 0..self.blocks.len() {
            stages.push(FeatureStage::DenseBlock(i));
            if i < self.transitions.len() {
                stages.push(FeatureStage::Transition(i));
            }
        }
        stages.push(FeatureStage::Norm);
        stages
    }

    /// Position of a named layer in [`Self::stages`]
    pub fn stage_index(&self, name: &str) -> Option<usize> {
        self.stages().iter().position(|stage| stage.name() == name)
    }

    pub fn num_classes(&self) -> usize {
        let [_, classes] = self.classifier.weight.dims();
        classes
    }

    pub fn in_channels(&self) -> usize {
        let [_, channels, _, _] = self.conv0.weight.dims();
        channels
    }

    /// Smallest height or width that survives every downsampling step
    ///
    /// The stem divides the extent by 4 and each transition halves it.
    pub fn min_input_extent(&self) -> usize {
        4 << self.transitions.len()
    }

    fn apply_stage(&self, stage: FeatureStage, x: Tensor<B, 4>) -> Tensor<B, 4> {
        match stage {
            FeatureStage::Stem => self
                .pool0
                .forward(relu(self.norm0.forward(self.conv0.forward(x)))),
            FeatureStage::DenseBlock(i) => self.blocks[i].forward(x),
            FeatureStage::Transition(i) => self.transitions[i].forward(x),
            FeatureStage::Norm => self.norm5.forward(x),
        }
    }

    /// Run the stages whose positions fall in `range`
    pub fn forward_stages(&self, x: Tensor<B, 4>, range: Range<usize>) -> Tensor<B, 4> {
        self.stages()
            .into_iter()
            .enumerate()
            .filter(|(position, _)| range.contains(position))
            .fold(x, |x, (_, stage)| self.apply_stage(stage, x))
    }

    /// ReLU → global average pool → linear, on the output of `features.norm5`
    pub fn head(&self, features: Tensor<B, 4>) -> Tensor<B, 2> {
        let pooled = self.pool.forward(relu(features));
        let [batch, channels, _, _] = pooled.dims();
        self.classifier.forward(pooled.reshape([batch, channels]))
    }

    /// Logits, shape `(batch, classes)`
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 2> {
        let stages = self.stages().len();
        self.head(self.forward_stages(x, 0..stages))
    }

    /// Replace every parameter with the tensor stored under its PyTorch name
    ///
    /// Names follow MONAI's DenseNet: `features.conv0`,
    /// `features.denseblock{i}.denselayer{j}.layers.{norm1,conv1,norm2,conv2}`,
    /// `features.transition{i}.{norm,conv}`, `features.norm5` and
    /// `class_layers.out`, all 1-based. A missing or misshapen tensor is an
    /// error; tensors left over in `dict` are reported and ignored.
    pub fn load_state_dict(self, mut dict: StateDict, device: &B::Device) -> Result<Self, PipelineError> {
        let blocks = self
            .blocks
            .into_iter()
            .enumerate()
            .map(|(i, block)| {
                let layers = block
                    .layers
                    .into_iter()
                    .enumerate()
                    .map(|(j, layer)| layer.load_state_dict(&mut dict, &dense_layer_prefix(i, j), device))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(DenseBlock { layers })
            })
            .collect::<Result<Vec<_>, PipelineError>>()?;
        let transitions = self
            .transitions
            .into_iter()
            .enumerate()
            .map(|(i, transition)| transition.load_state_dict(&mut dict, &transition_prefix(i), device))
            .collect::<Result<Vec<_>, _>>()?;

        // PyTorch stores linear weights as (out, in)
        let [features, classes] = self.classifier.weight.dims();
        let mut classifier = self.classifier;
        classifier.weight = Param::from_tensor(
            dict.take_tensor::<B, 2>(&format!("{CLASSIFIER_PREFIX}.weight"), [classes, features], device)?
                .transpose(),
        );
        if classifier.bias.is_some() {
            classifier.bias = Some(dict.take_param(&format!("{CLASSIFIER_PREFIX}.bias"), [classes], device)?);
        }

        let model = Self {
            conv0: load_conv(self.conv0, &mut dict, "features.conv0", device)?,
            norm0: self.norm0.load_state_dict(&mut dict, "features.norm0", device)?,
            pool0: self.pool0,
            blocks,
            transitions,
            norm5: self.norm5.load_state_dict(&mut dict, "features.norm5", device)?,
            pool: self.pool,
            classifier,
        };

        if !dict.is_empty() {
            let unused: Vec<&str> = dict.names().collect();
            tracing::warn!(count = unused.len(), names = ?unused, "Checkpoint tensors not used by the network");
        }
        Ok(model)
    }

    /// Parameters under the names [`Self::load_state_dict`] reads
    pub fn state_dict(&self) -> StateDict {
        let mut dict = StateDict::new();
        dict.put("features.conv0.weight", self.conv0.weight.val());
        self.norm0.export(&mut dict, "features.norm0");
        for (i, block) in self.blocks.iter().enumerate() {
            for (j, layer) in block.layers.iter().enumerate() {
                layer.export(&mut dict, &dense_layer_prefix(i, j));
            }
        }
        for (i, transition) in self.transitions.iter().enumerate() {
            let prefix = transition_prefix(i);
            transition.norm.export(&mut dict, &format!("{prefix}.norm"));
            dict.put(format!("{prefix}.conv.weight"), transition.conv.weight.val());
        }
        self.norm5.export(&mut dict, "features.norm5");
        dict.put(
            format!("{CLASSIFIER_PREFIX}.weight"),
            self.classifier.weight.val().transpose(),
        );
        if let Some(bias) = &self.classifier.bias {
            dict.put(format!("{CLASSIFIER_PREFIX}.bias"), bias.val());
        }
        dict
    }
}

const CLASSIFIER_PREFIX: &str = "class_layers.out";

fn dense_layer_prefix(block: usize, layer: usize) -> String {
    format!("features.denseblock{}.denselayer{}.layers", block + 1, layer + 1)
}

fn transition_prefix(index: usize) -> String {
    format!("features.transition{}", index + 1)
}
