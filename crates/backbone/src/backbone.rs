use burn::module::Module;
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::pool::{MaxPool2d, MaxPool2dConfig};
use burn::nn::{Initializer, PaddingConfig2d, Relu};
use burn::prelude::{Backend, Device};
use burn::record::{FullPrecisionSettings, Recorder, RecorderError};
use burn::tensor::Tensor;
use burn_import::pytorch::{LoadArgs, PyTorchFileRecorder};
use std::f64::consts::SQRT_2;
use std::ops::Range;

use crate::block::{LayerBlock, LayerBlockConfig};
use crate::norm::FrozenBatchNorm;
use crate::weights::ResNet18;

const RESNET18_BLOCKS: [usize; 4] = [2, 2, 2, 2];

pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Stage names in execution order. Each stage maps a 4-D activation to a 4-D
/// activation, so any of them can be captured by index.
pub const STAGES: [&str; 8] = [
	"conv1", "bn1", "relu", "maxpool", "layer1", "layer2", "layer3", "layer4",
];

/// Channels produced by the last stage.
pub const FEATURE_CHANNELS: usize = 512;

/// ResNet-18 without its classification head.
#[derive(Debug, Module)]
pub struct Backbone<B: Backend> {
	pub(crate) conv1: Conv2d<B>,
	pub(crate) bn1: FrozenBatchNorm<B>,
	pub(crate) relu: Relu,
	pub(crate) maxpool: MaxPool2d,
	pub(crate) layer1: LayerBlock<B>,
	pub(crate) layer2: LayerBlock<B>,
	pub(crate) layer3: LayerBlock<B>,
	pub(crate) layer4: LayerBlock<B>,
}

impl<B: Backend> Backbone<B> {
	/// Randomly initialized ResNet-18 feature extractor.
	pub fn resnet18(device: &Device<B>) -> Self {
		let [b1, b2, b3, b4] = RESNET18_BLOCKS;

		// 7x7 conv, 64, /2
		let conv1 = Conv2dConfig::new([3, 64], [7, 7])
			.with_stride([2, 2])
			.with_padding(PaddingConfig2d::Explicit(3, 3))
			.with_bias(false)
			.with_initializer(Initializer::KaimingNormal {
				gain: SQRT_2,
				fan_out_only: true,
			})
			.init(device);

		// 3x3 maxpool, /2
		let maxpool = MaxPool2dConfig::new([3, 3])
			.with_strides([2, 2])
			.with_padding(PaddingConfig2d::Explicit(1, 1))
			.init();

		Self {
			conv1,
			bn1: FrozenBatchNorm::new(64, device),
			relu: Relu::new(),
			maxpool,
			layer1: LayerBlockConfig::new(b1, 64, 64, 1).init(device),
			layer2: LayerBlockConfig::new(b2, 64, 128, 2).init(device),
			layer3: LayerBlockConfig::new(b3, 128, 256, 2).init(device),
			layer4: LayerBlockConfig::new(b4, 256, FEATURE_CHANNELS, 2).init(device),
		}
	}

	/// ResNet-18 with ImageNet weights, downloaded on first use.
	pub fn resnet18_pretrained(weights: ResNet18, device: &Device<B>) -> Result<Self, RecorderError> {
		let record = Self::load_weights_record(weights, device)?;

		Ok(Self::resnet18(device).load_record(record))
	}

	pub fn load_weights_record(weights: ResNet18, device: &Device<B>) -> Result<BackboneRecord<B>, RecorderError> {
		let torch_weights = weights.weights().download().map_err(|err| {
			RecorderError::Unknown(format!("Could not download weights.\nError: {err}"))
		})?;

		log::info!("Importing backbone weights from {}", torch_weights.display());

		// The `fc.*` keys of the checkpoint have no counterpart here and are skipped.
		let load_args = LoadArgs::new(torch_weights)
			// Map *.downsample.0.* -> *.downsample.conv.*
			.with_key_remap("(.+)\\.downsample\\.0\\.(.+)", "$1.downsample.conv.$2")
			// Map *.downsample.1.* -> *.downsample.bn.*
			.with_key_remap("(.+)\\.downsample\\.1\\.(.+)", "$1.downsample.bn.$2")
			// Map layer[i].[j].* -> layer[i].blocks.[j].*
			.with_key_remap("(layer[1-4])\\.([0-9]+)\\.(.+)", "$1.blocks.$2.$3");

		PyTorchFileRecorder::<FullPrecisionSettings>::new().load(load_args, device)
	}

	/// Maps `[0, 1]` RGB input to the statistics the pretrained weights expect.
	pub fn normalize(&self, images: Tensor<B, 4>) -> Tensor<B, 4> {
		let device = images.device();
		let mean = Tensor::<B, 1>::from_floats(IMAGENET_MEAN, &device).reshape([1, 3, 1, 1]);
		let std = Tensor::<B, 1>::from_floats(IMAGENET_STD, &device).reshape([1, 3, 1, 1]);

		(images - mean) / std
	}

	/// Runs a single stage; see [STAGES] for the index order.
	pub fn forward_stage(&self, stage: usize, x: Tensor<B, 4>) -> Tensor<B, 4> {
		match stage {
			0 => self.conv1.forward(x),
			1 => self.bn1.forward(x),
			2 => self.relu.forward(x),
			3 => self.maxpool.forward(x),
			4 => self.layer1.forward(x),
			5 => self.layer2.forward(x),
			6 => self.layer3.forward(x),
			7 => self.layer4.forward(x),
			_ => x,
		}
	}

	/// Runs the stages in `stages`, which must already be normalized input when
	/// the range starts at 0.
	pub fn forward_range(&self, x: Tensor<B, 4>, stages: Range<usize>) -> Tensor<B, 4> {
		stages.fold(x, |x, stage| self.forward_stage(stage, x))
	}

	/// `[N, 3, H, W]` in `[0, 1]` -> `[N, 512, H / 32, W / 32]`.
	pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 4> {
		let x = self.normalize(images);
		self.forward_range(x, 0..STAGES.len())
	}
}
