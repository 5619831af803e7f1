use burn::module::{Module, Param};
use burn::prelude::{Backend, Device, Tensor};

/// Batch normalization that always applies the stored running statistics.
///
/// Field names follow the PyTorch `state_dict` layout (`weight`, `bias`,
/// `running_mean`, `running_var`) so pretrained checkpoints load without a
/// key remap. Behaves the same on autodiff and inference backends, which
/// keeps a frozen backbone deterministic during fine-tuning and Grad-CAM.
#[derive(Module, Debug)]
pub struct FrozenBatchNorm<B: Backend> {
	pub weight: Param<Tensor<B, 1>>,
	pub bias: Param<Tensor<B, 1>>,
	pub running_mean: Param<Tensor<B, 1>>,
	pub running_var: Param<Tensor<B, 1>>,
	epsilon: f64,
}

impl<B: Backend> FrozenBatchNorm<B> {
	pub fn new(channels: usize, device: &Device<B>) -> Self {
		Self {
			weight: Param::from_tensor(Tensor::ones([channels], device)),
			bias: Param::from_tensor(Tensor::zeros([channels], device)),
			running_mean: Param::from_tensor(Tensor::zeros([channels], device)),
			running_var: Param::from_tensor(Tensor::ones([channels], device)),
			epsilon: 1e-5,
		}
	}

	pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
		let [channels] = self.weight.dims();
		let shape = [1, channels, 1, 1];

		let scale = self.weight.val() / (self.running_var.val() + self.epsilon).sqrt();
		let shift = self.bias.val() - self.running_mean.val() * scale.clone();

		input * scale.reshape(shape) + shift.reshape(shape)
	}
}
