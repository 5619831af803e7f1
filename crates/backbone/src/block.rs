use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::{Initializer, PaddingConfig2d, Relu};
use burn::prelude::{Backend, Config, Device, Module, Tensor};
use std::f64::consts::SQRT_2;

use crate::norm::FrozenBatchNorm;

fn conv_initializer() -> Initializer {
	Initializer::KaimingNormal {
		gain: SQRT_2, // recommended value for ReLU
		fan_out_only: true,
	}
}

fn conv3x3(in_channels: usize, out_channels: usize, stride: usize) -> Conv2dConfig {
	Conv2dConfig::new([in_channels, out_channels], [3, 3])
		.with_stride([stride, stride])
		.with_padding(PaddingConfig2d::Explicit(1, 1))
		.with_bias(false)
		.with_initializer(conv_initializer())
}

fn conv1x1(in_channels: usize, out_channels: usize, stride: usize) -> Conv2dConfig {
	Conv2dConfig::new([in_channels, out_channels], [1, 1])
		.with_stride([stride, stride])
		.with_padding(PaddingConfig2d::Explicit(0, 0))
		.with_bias(false)
		.with_initializer(conv_initializer())
}

/// Two 3x3 convolutions with an identity (or projected) skip connection.
#[derive(Debug, Module)]
pub struct BasicBlock<B: Backend> {
	pub(crate) conv1: Conv2d<B>,
	pub(crate) bn1: FrozenBatchNorm<B>,
	pub(crate) conv2: Conv2d<B>,
	pub(crate) bn2: FrozenBatchNorm<B>,
	pub(crate) relu: Relu,
	pub(crate) downsample: Option<Downsample<B>>,
}

impl<B: Backend> BasicBlock<B> {
	pub fn new(in_channels: usize, out_channels: usize, stride: usize, device: &Device<B>) -> Self {
		let downsample = (in_channels != out_channels || stride != 1)
			.then(|| Downsample::new(in_channels, out_channels, stride, device));

		Self {
			conv1: conv3x3(in_channels, out_channels, stride).init(device),
			bn1: FrozenBatchNorm::new(out_channels, device),
			conv2: conv3x3(out_channels, out_channels, 1).init(device),
			bn2: FrozenBatchNorm::new(out_channels, device),
			relu: Relu::new(),
			downsample,
		}
	}

	pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
		let identity = match &self.downsample {
			Some(downsample) => downsample.forward(input.clone()),
			None => input.clone(),
		};

		let x = self.conv1.forward(input);
		let x = self.bn1.forward(x);
		let x = self.relu.forward(x);

		let x = self.conv2.forward(x);
		let x = self.bn2.forward(x);

		self.relu.forward(x + identity)
	}
}

#[derive(Debug, Module)]
pub struct Downsample<B: Backend> {
	pub(crate) conv: Conv2d<B>,
	pub(crate) bn: FrozenBatchNorm<B>,
}

impl<B: Backend> Downsample<B> {
	pub fn new(in_channels: usize, out_channels: usize, stride: usize, device: &Device<B>) -> Self {
		Self {
			conv: conv1x1(in_channels, out_channels, stride).init(device),
			bn: FrozenBatchNorm::new(out_channels, device),
		}
	}

	pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
		self.bn.forward(self.conv.forward(input))
	}
}

/// A run of basic blocks; only the first one changes stride and width.
#[derive(Debug, Module)]
pub struct LayerBlock<B: Backend> {
	pub(crate) blocks: Vec<BasicBlock<B>>,
}

impl<B: Backend> LayerBlock<B> {
	pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
		self.blocks.iter().fold(input, |x, block| block.forward(x))
	}
}

#[derive(Config, Debug)]
pub struct LayerBlockConfig {
	pub num_blocks: usize,
	pub in_channels: usize,
	pub out_channels: usize,
	pub stride: usize,
}

impl LayerBlockConfig {
	pub fn init<B: Backend>(&self, device: &Device<B>) -> LayerBlock<B> {
		let blocks = (0..self.num_blocks)
			.map(|b| {
				if b == 0 {
					BasicBlock::new(self.in_channels, self.out_channels, self.stride, device)
				} else {
					BasicBlock::new(self.out_channels, self.out_channels, 1, device)
				}
			})
			.collect();

		LayerBlock { blocks }
	}
}
