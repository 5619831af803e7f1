//! Gradient-weighted class activation maps.
//!
//! The classifier is split at the target layer: everything before it runs
//! without a graph, the activation is marked as a leaf that requires grad and
//! the rest of the network runs on top of it. Back-propagating one class score
//! then yields `d score / d activation` directly.

use burn::prelude::{Backend, ElementConversion, Tensor};
use burn::tensor::backend::AutodiffBackend;
use image::imageops::{self, FilterType};
use image::{ImageBuffer, Luma, Rgb, RgbImage};

use crate::error::RiceError;
use crate::model::{RiceClassifier, LAYERS, POOL_LAYER};

pub const PREFERRED_LAYER: &str = "layer4";

/// Weight of the colour-mapped heatmap in the overlay.
pub const OVERLAY_ALPHA: f32 = 0.4;

const EPSILON: f32 = 1e-8;

/// Index of the layer the map is taken from when none is requested: the
/// preferred layer if the list has it, else the one three from the end.
pub fn default_layer(layers: &[&str]) -> usize {
	layers
		.iter()
		.position(|layer| *layer == PREFERRED_LAYER)
		.unwrap_or(layers.len().saturating_sub(3))
}

pub fn layer_index(name: &str) -> Result<usize, RiceError> {
	let index = LAYERS
		.iter()
		.position(|layer| *layer == name)
		.ok_or_else(|| RiceError::LayerNotFound(name.to_string()))?;

	if index > POOL_LAYER {
		return Err(RiceError::LayerNotSpatial(name.to_string()));
	}

	Ok(index)
}

pub fn resolve_target_layer(requested: Option<&str>) -> Result<usize, RiceError> {
	match requested {
		Some(name) => layer_index(name),
		None => Ok(default_layer(&LAYERS)),
	}
}

/// `width x height` activation map, row-major, values in `[0, 1]`.
#[derive(Debug, Clone, PartialEq)]
pub struct Heatmap {
	pub width: usize,
	pub height: usize,
	pub values: Vec<f32>,
}

impl Heatmap {
	pub fn get(&self, x: usize, y: usize) -> f32 {
		self.values[y * self.width + x]
	}

	fn to_image(&self) -> ImageBuffer<Luma<f32>, Vec<f32>> {
		ImageBuffer::from_fn(self.width as u32, self.height as u32, |x, y| {
			Luma([self.get(x as usize, y as usize)])
		})
	}
}

/// Computes the map for `class` (the arg-max when `None`) at layer index
/// `layer`. `input` is a single `[1, 3, S, S]` image in `[0, 1]`.
pub fn gradcam<B: AutodiffBackend>(
	model: &RiceClassifier<B>,
	input: Tensor<B, 4>,
	layer: usize,
	class: Option<usize>,
) -> Result<Heatmap, RiceError> {
	let activation = model.forward_until(input, layer).detach().require_grad();
	let probs = model.forward_after(activation.clone(), layer);

	let [_, num_classes] = probs.dims();
	let class = match class {
		Some(class) if class >= num_classes => return Err(RiceError::InvalidRequest("Class index out of range")),
		Some(class) => class,
		None => probs.clone().argmax(1).into_scalar().elem::<i64>() as usize,
	};

	let score = probs.slice([0..1, class..class + 1]).sum();
	let grads = score.backward();

	let activation_inner = activation.clone().inner();
	let gradients = activation
		.grad(&grads)
		.unwrap_or_else(|| activation_inner.zeros_like());

	log::debug!("Grad-CAM for class {class} at {}", LAYERS[layer]);
	Ok(weighted_cam(activation_inner, gradients))
}

/// Channel weights are the spatially averaged gradients; the map is the
/// weighted channel sum, rectified and scaled by its maximum.
pub fn weighted_cam<B: Backend>(activations: Tensor<B, 4>, gradients: Tensor<B, 4>) -> Heatmap {
	let [_, _, height, width] = activations.dims();

	let weights = gradients.mean_dim(3).mean_dim(2);
	let cam = (activations * weights).sum_dim(1).clamp_min(0.0);
	let max = cam.clone().max().into_scalar().elem::<f32>();
	let cam = cam / (max + EPSILON);

	Heatmap {
		width,
		height,
		values: cam.into_data().iter::<f32>().collect(),
	}
}

/// Jet colour map for `v` in `[0, 1]`: dark blue through cyan, yellow to
/// dark red.
pub fn jet(v: f32) -> [u8; 3] {
	let channel = |offset: f32| ((1.5 - (4.0 * v - offset).abs()).clamp(0.0, 1.0) * 255.0) as u8;
	[channel(3.0), channel(2.0), channel(1.0)]
}

/// Upsamples the map to the original image, colours it and blends
/// `alpha * heat + (1 - alpha) * original`.
pub fn overlay(heatmap: &Heatmap, original: &RgbImage, alpha: f32) -> RgbImage {
	let (width, height) = original.dimensions();
	let heat = imageops::resize(&heatmap.to_image(), width, height, FilterType::Triangle);

	RgbImage::from_fn(width, height, |x, y| {
		// Quantize like an 8-bit heatmap would be
		let level = (heat.get_pixel(x, y)[0].clamp(0.0, 1.0) * 255.0) as u8;
		let colour = jet(level as f32 / 255.0);
		let Rgb(pixel) = *original.get_pixel(x, y);

		Rgb(std::array::from_fn(|c| {
			(alpha * colour[c] as f32 + (1.0 - alpha) * pixel[c] as f32)
				.round()
				.clamp(0.0, 255.0) as u8
		}))
	})
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::model::RiceClassifierConfig;
	use burn::backend::{Autodiff, NdArray};
	use burn::tensor::Distribution;

	type TestBackend = NdArray<f32>;

	#[test]
	fn zero_gradients_give_zero_map() {
		let device = Default::default();
		let activations = Tensor::<TestBackend, 4>::random([1, 8, 3, 3], Distribution::Default, &device);
		let gradients = Tensor::<TestBackend, 4>::zeros([1, 8, 3, 3], &device);

		let heatmap = weighted_cam(activations, gradients);

		assert_eq!((heatmap.width, heatmap.height), (3, 3));
		assert!(heatmap.values.iter().all(|v| *v == 0.0));
	}

	#[test]
	fn map_is_normalized_and_rectified() {
		let device = Default::default();
		// Channel 0 is positive on the left column, channel 1 negative everywhere
		let activations = Tensor::<TestBackend, 4>::from_floats(
			[[[[2.0, 0.0], [4.0, 0.0]], [[1.0, 1.0], [1.0, 1.0]]]],
			&device,
		);
		let gradients = Tensor::<TestBackend, 4>::from_floats(
			[[[[1.0, 1.0], [1.0, 1.0]], [[-0.5, -0.5], [-0.5, -0.5]]]],
			&device,
		);

		let heatmap = weighted_cam(activations, gradients);

		assert!(heatmap.values.iter().all(|v| (0.0..=1.0).contains(v)));
		assert!((heatmap.get(0, 1) - 1.0).abs() < 1e-6);
		assert!((heatmap.get(0, 0) - 1.5 / 3.5).abs() < 1e-6);
		assert_eq!(heatmap.get(1, 0), 0.0);
	}

	#[test]
	fn map_has_layer_resolution() {
		let device = Default::default();
		let model = RiceClassifierConfig::new(3).init::<Autodiff<TestBackend>>(&device);
		let input = Tensor::<Autodiff<TestBackend>, 4>::random([1, 3, 64, 64], Distribution::Default, &device);
		let layer = resolve_target_layer(None).unwrap();

		let heatmap = gradcam(&model, input, layer, None).unwrap();

		assert_eq!((heatmap.width, heatmap.height), (2, 2));
		assert!(heatmap.values.iter().all(|v| v.is_finite() && (0.0..=1.0).contains(v)));
	}

	#[test]
	fn out_of_range_class_is_rejected() {
		let device = Default::default();
		let model = RiceClassifierConfig::new(2).init::<Autodiff<TestBackend>>(&device);
		let input = Tensor::<Autodiff<TestBackend>, 4>::zeros([1, 3, 32, 32], &device);

		let result = gradcam(&model, input, 7, Some(2));

		assert!(matches!(result, Err(RiceError::InvalidRequest(_))));
	}

	#[test]
	fn layer_resolution() {
		assert_eq!(LAYERS[resolve_target_layer(None).unwrap()], "layer4");
		assert_eq!(resolve_target_layer(Some("layer2")).unwrap(), 5);
		assert!(matches!(resolve_target_layer(Some("fc")), Err(RiceError::LayerNotSpatial(_))));
		assert!(matches!(resolve_target_layer(Some("dropout")), Err(RiceError::LayerNotSpatial(_))));
		assert!(matches!(resolve_target_layer(Some("conv5")), Err(RiceError::LayerNotFound(_))));
	}

	#[test]
	fn fallback_is_three_from_the_end() {
		assert_eq!(default_layer(&["stem", "block1", "block2", "pool", "fc"]), 2);
		assert_eq!(default_layer(&["fc"]), 0);
	}

	#[test]
	fn jet_endpoints() {
		assert_eq!(jet(0.0), [0, 0, 127]);
		assert_eq!(jet(0.5), [127, 255, 127]);
		assert_eq!(jet(1.0), [127, 0, 0]);
	}

	#[test]
	fn overlay_keeps_original_size() {
		let heatmap = Heatmap {
			width: 2,
			height: 2,
			values: vec![0.0; 4],
		};
		let original = RgbImage::from_pixel(30, 20, Rgb([100, 100, 100]));

		let blended = overlay(&heatmap, &original, OVERLAY_ALPHA);

		assert_eq!(blended.dimensions(), (30, 20));
		// 0.4 * jet(0) + 0.6 * 100
		assert_eq!(blended.get_pixel(5, 5), &Rgb([60, 60, 111]));
	}
}
