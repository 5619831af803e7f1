use burn::config::Config;
use burn::module::Module;
use burn::nn::loss::CrossEntropyLossConfig;
use burn::nn::pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig};
use burn::nn::{Dropout, DropoutConfig, Linear, LinearConfig};
use burn::prelude::{Backend, Device, Int, Tensor};
use burn::record::{CompactRecorder, Recorder};
use burn::tensor::activation::softmax;
use burn::train::ClassificationOutput;
use rice_backbone::{Backbone, ResNet18, FEATURE_CHANNELS, STAGES};
use std::path::Path;

use crate::error::RiceError;

/// Layers of the classifier in execution order, as seen by Grad-CAM.
pub const LAYERS: [&str; 11] = [
	"conv1", "bn1", "relu", "maxpool", "layer1", "layer2", "layer3", "layer4", "avgpool", "dropout", "fc",
];

/// Index of the global pooling layer; this and everything before it produce
/// 4-D activations.
pub const POOL_LAYER: usize = STAGES.len();

/// Frozen pretrained backbone, global average pooling, dropout and a dense
/// soft-max head.
#[derive(Debug, Module)]
pub struct RiceClassifier<B: Backend> {
	backbone: Backbone<B>,
	pool: AdaptiveAvgPool2d,
	dropout: Dropout,
	fc: Linear<B>,
}

#[derive(Config, Debug)]
pub struct RiceClassifierConfig {
	pub num_classes: usize,
	#[config(default = 0.3)]
	pub dropout: f64,
}

impl RiceClassifierConfig {
	/// Head on top of a randomly initialized backbone. Used as the skeleton
	/// that saved records are loaded into.
	pub fn init<B: Backend>(&self, device: &Device<B>) -> RiceClassifier<B> {
		self.with_backbone(Backbone::resnet18(device), device)
	}

	/// Head on top of the ImageNet backbone, ready for transfer learning.
	pub fn init_pretrained<B: Backend>(&self, weights: ResNet18, device: &Device<B>) -> Result<RiceClassifier<B>, RiceError> {
		let backbone = Backbone::resnet18_pretrained(weights, device)
			.map_err(|err| RiceError::model_load("pretrained backbone", err))?;

		Ok(self.with_backbone(backbone, device))
	}

	fn with_backbone<B: Backend>(&self, backbone: Backbone<B>, device: &Device<B>) -> RiceClassifier<B> {
		RiceClassifier {
			backbone: backbone.no_grad(),
			pool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
			dropout: DropoutConfig::new(self.dropout).init(),
			fc: LinearConfig::new(FEATURE_CHANNELS, self.num_classes).init(device),
		}
	}
}

impl<B: Backend> RiceClassifier<B> {
	pub fn num_classes(&self) -> usize {
		let [_, outputs] = self.fc.weight.dims();
		outputs
	}

	/// Marks every backbone parameter as not requiring gradients. Records
	/// loaded from disk come back trainable, so call this after loading.
	pub fn freeze_backbone(self) -> Self {
		Self {
			backbone: self.backbone.no_grad(),
			..self
		}
	}

	/// Training logits. The backbone output is detached so only the head
	/// receives gradients; dropout is active on autodiff backends.
	pub fn forward_train(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
		let features = self.backbone.forward(images).detach();
		let x = self.pool.forward(features).flatten(1, 3);
		let x = self.dropout.forward(x);

		self.fc.forward(x)
	}

	pub fn forward_classification(&self, images: Tensor<B, 4>, targets: Tensor<B, 1, Int>) -> ClassificationOutput<B> {
		let output = self.forward_train(images);

		let loss = CrossEntropyLossConfig::new()
			.init(&output.device())
			.forward(output.clone(), targets.clone());

		ClassificationOutput::new(loss, output, targets)
	}

	/// `[N, 3, H, W]` in `[0, 1]` -> `[N, classes]` probabilities.
	pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
		let activation = self.forward_until(images, POOL_LAYER);
		self.forward_after(activation, POOL_LAYER)
	}

	/// Output of layer `layer` (an index into [LAYERS], at most [POOL_LAYER]).
	pub fn forward_until(&self, images: Tensor<B, 4>, layer: usize) -> Tensor<B, 4> {
		let x = self.backbone.normalize(images);
		let x = self.backbone.forward_range(x, 0..(layer + 1).min(STAGES.len()));

		if layer >= POOL_LAYER {
			self.pool.forward(x)
		} else {
			x
		}
	}

	/// Probabilities computed from the output of layer `layer`. Dropout is an
	/// identity at inference and is skipped.
	pub fn forward_after(&self, activation: Tensor<B, 4>, layer: usize) -> Tensor<B, 2> {
		let x = if layer < POOL_LAYER {
			let x = self.backbone.forward_range(activation, (layer + 1)..STAGES.len());
			self.pool.forward(x)
		} else {
			activation
		};

		softmax(self.fc.forward(x.flatten(1, 3)), 1)
	}

	pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), RiceError> {
		let path = path.as_ref();

		self.clone()
			.save_file(path.to_path_buf(), &CompactRecorder::new())
			.map_err(|err| RiceError::Checkpoint(format!("saving {}: {err}", path.display())))
	}

	/// Loads a saved classifier and checks that its head matches the label
	/// index it will be decoded with.
	pub fn load<P: AsRef<Path>>(path: P, num_classes: usize, device: &Device<B>) -> Result<Self, RiceError> {
		let path = path.as_ref();

		let record = CompactRecorder::new()
			.load(path.to_path_buf(), device)
			.map_err(|err| RiceError::model_load(path, err))?;

		let model = RiceClassifierConfig::new(num_classes)
			.init::<B>(device)
			.load_record(record)
			.freeze_backbone();

		if model.num_classes() != num_classes {
			return Err(RiceError::model_load(
				path,
				format!("model predicts {} classes but the label index has {num_classes}", model.num_classes()),
			));
		}

		log::info!("Loaded classifier from {} ({num_classes} classes)", path.display());
		Ok(model)
	}
}
