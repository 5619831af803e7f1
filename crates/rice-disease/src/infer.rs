use burn::module::AutodiffModule;
use burn::prelude::Device;
use burn::tensor::backend::AutodiffBackend;
use image::{DynamicImage, RgbImage};
use rand::seq::SliceRandom;
use rand::Rng;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use crate::data::has_image_extension;
use crate::error::RiceError;
use crate::gradcam::{self, Heatmap};
use crate::labels::LabelIndex;
use crate::model::RiceClassifier;
use crate::preprocess::{preprocess, to_batch};

#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
	pub label: String,
	pub confidence: f32,
}

/// The `k` most likely labels, highest first.
pub fn top_k(probabilities: &[f32], labels: &LabelIndex, k: usize) -> Vec<Prediction> {
	let mut ranked: Vec<(usize, f32)> = probabilities.iter().copied().enumerate().collect();
	ranked.sort_by(|a, b| b.1.total_cmp(&a.1));

	ranked
		.into_iter()
		.filter_map(|(index, confidence)| {
			labels.label(index).map(|label| Prediction {
				label: label.to_string(),
				confidence,
			})
		})
		.take(k)
		.collect()
}

fn sorted_entries(dir: &Path, keep: impl Fn(&Path) -> bool) -> Result<Vec<PathBuf>, RiceError> {
	let mut entries = Vec::new();
	for entry in fs::read_dir(dir).map_err(|_| RiceError::ImageNotFound(dir.to_path_buf()))? {
		let path = entry?.path();
		if keep(&path) {
			entries.push(path);
		}
	}
	entries.sort();

	Ok(entries)
}

/// Picks a class folder of `val_dir` uniformly, then an image inside it.
pub fn random_validation_image<R: Rng + ?Sized>(val_dir: &Path, rng: &mut R) -> Result<PathBuf, RiceError> {
	let classes = sorted_entries(val_dir, |path| path.is_dir())?;
	let class_dir = classes
		.choose(rng)
		.ok_or_else(|| RiceError::ImageNotFound(val_dir.to_path_buf()))?;

	let images = sorted_entries(class_dir, |path| path.is_file() && has_image_extension(path))?;
	images
		.choose(rng)
		.cloned()
		.ok_or_else(|| RiceError::ImageNotFound(class_dir.clone()))
}

/// Where the CLI takes its image from.
#[derive(Debug, Clone)]
pub enum ImageSource {
	Path(PathBuf),
	RandomFrom(PathBuf),
}

impl ImageSource {
	pub fn resolve<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<PathBuf, RiceError> {
		let path = match self {
			ImageSource::Path(path) => path.clone(),
			ImageSource::RandomFrom(val_dir) => random_validation_image(val_dir, rng)?,
		};

		if !path.is_file() {
			return Err(RiceError::ImageNotFound(path));
		}
		Ok(path)
	}
}

/// What the web front end needs from a loaded model.
pub trait LeafClassifier: Send + Sync + 'static {
	/// Soft-max output for one image, one entry per class.
	fn probabilities(&self, image: &DynamicImage) -> Result<Vec<f32>, RiceError>;

	/// Grad-CAM overlay for `class` at the default layer, same size as `image`.
	fn gradcam_overlay(&self, image: &DynamicImage, class: usize) -> Result<RgbImage, RiceError>;
}

/// A classifier loaded once and shared between requests. Burn modules are
/// `Send` but not `Sync`, so each copy sits behind its own lock.
pub struct InferenceSession<B: AutodiffBackend> {
	model: Mutex<RiceClassifier<B>>,
	inference: Mutex<RiceClassifier<B::InnerBackend>>,
	device: Device<B>,
	side: u32,
}

impl<B: AutodiffBackend> InferenceSession<B> {
	pub fn load<P: AsRef<Path>>(model_path: P, labels: &LabelIndex, side: u32, device: Device<B>) -> Result<Self, RiceError> {
		let model = RiceClassifier::<B>::load(model_path, labels.len(), &device)?;

		Ok(Self {
			inference: Mutex::new(model.valid()),
			model: Mutex::new(model),
			device,
			side,
		})
	}

	pub fn side(&self) -> u32 {
		self.side
	}

	pub fn predict(&self, image: &DynamicImage, labels: &LabelIndex, k: usize) -> Result<Vec<Prediction>, RiceError> {
		Ok(top_k(&self.probabilities(image)?, labels, k))
	}

	/// Heatmap at `layer` (the default layer when `None`) for `class` (the
	/// predicted class when `None`).
	pub fn gradcam(&self, image: &DynamicImage, layer: Option<&str>, class: Option<usize>) -> Result<Heatmap, RiceError> {
		let layer = gradcam::resolve_target_layer(layer)?;
		let input = to_batch::<B>(preprocess(image, self.side), self.side as usize, &self.device);
		let model = self.model.lock().unwrap_or_else(PoisonError::into_inner);

		gradcam::gradcam(&model, input, layer, class)
	}
}

impl<B: AutodiffBackend> LeafClassifier for InferenceSession<B> {
	fn probabilities(&self, image: &DynamicImage) -> Result<Vec<f32>, RiceError> {
		let input = to_batch::<B::InnerBackend>(preprocess(image, self.side), self.side as usize, &self.device);

		let probs = {
			let model = self.inference.lock().unwrap_or_else(PoisonError::into_inner);
			model.forward(input)
		};

		Ok(probs.into_data().iter::<f32>().collect())
	}

	fn gradcam_overlay(&self, image: &DynamicImage, class: usize) -> Result<RgbImage, RiceError> {
		let heatmap = self.gradcam(image, None, Some(class))?;
		Ok(gradcam::overlay(&heatmap, &image.to_rgb8(), gradcam::OVERLAY_ALPHA))
	}
}
