use burn::data::dataloader::batcher::Batcher;
use burn::data::dataset::Dataset;
use burn::prelude::{Backend, Device, ElementConversion, Int, Tensor, TensorData};
use image::ImageReader;
use rand::thread_rng;
use rayon::prelude::*;
use std::fs;
use std::path::{Path, PathBuf};

use crate::augment::AugmentationConfig;
use crate::error::RiceError;
use crate::labels::LabelIndex;
use crate::preprocess::{open_image, rescale, resized_rgb};

pub const IMAGE_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

pub fn has_image_extension(path: &Path) -> bool {
	path.extension()
		.and_then(|ext| ext.to_str())
		.is_some_and(|ext| IMAGE_EXTENSIONS.iter().any(|known| ext.eq_ignore_ascii_case(known)))
}

/// Cheap validity check: reads the header only.
fn probe(path: &Path) -> bool {
	ImageReader::open(path)
		.and_then(|reader| reader.with_guessed_format())
		.map(|reader| reader.into_dimensions().is_ok())
		.unwrap_or(false)
}

#[derive(Debug, Clone)]
pub struct LeafItem {
	/// `[H, W, 3]` floats in `[0, 1]`.
	pub pixels: Vec<f32>,
	pub label: usize,
}

/// `<dir>/<class>/<image>` folder decoded lazily, one image per `get`.
pub struct LeafDataset {
	samples: Vec<(PathBuf, usize)>,
	side: u32,
	augmentation: Option<AugmentationConfig>,
}

impl LeafDataset {
	/// Collects every image under the class folders known to `labels`. Folders
	/// absent from `dir` contribute nothing; files whose header cannot be read
	/// are dropped with a warning.
	pub fn from_dir<P: AsRef<Path>>(
		dir: P,
		labels: &LabelIndex,
		side: u32,
		augmentation: Option<AugmentationConfig>,
	) -> Result<Self, RiceError> {
		let dir = dir.as_ref();
		let mut candidates = Vec::new();

		for (label, class) in labels.classes().iter().enumerate() {
			let class_dir = dir.join(class);
			if !class_dir.is_dir() {
				log::warn!("No {class} folder in {}", dir.display());
				continue;
			}

			for entry in fs::read_dir(&class_dir)? {
				let path = entry?.path();
				if path.is_file() {
					candidates.push((path, label));
				}
			}
		}
		candidates.sort();

		let total = candidates.len();
		let samples: Vec<(PathBuf, usize)> = candidates
			.into_par_iter()
			.filter(|(path, _)| probe(path))
			.collect();

		if samples.len() < total {
			log::warn!("Skipped {} unreadable files in {}", total - samples.len(), dir.display());
		}
		log::info!("Found {} images in {} classes under {}", samples.len(), labels.len(), dir.display());

		Ok(Self { samples, side, augmentation })
	}

	pub fn side(&self) -> u32 {
		self.side
	}

	fn load(&self, path: &Path) -> Result<Vec<f32>, RiceError> {
		let image = resized_rgb(&open_image(path)?, self.side);

		let image = match &self.augmentation {
			Some(config) => config.sample(&mut thread_rng()).apply(&image),
			None => image,
		};

		Ok(rescale(&image))
	}
}

impl Dataset<LeafItem> for LeafDataset {
	fn get(&self, index: usize) -> Option<LeafItem> {
		let (path, label) = self.samples.get(index)?;

		let pixels = self.load(path).unwrap_or_else(|err| {
			log::error!("{err}; using a blank sample");
			vec![0.0; (self.side * self.side * 3) as usize]
		});

		Some(LeafItem { pixels, label: *label })
	}

	fn len(&self) -> usize {
		self.samples.len()
	}
}

#[derive(Clone, Debug)]
pub struct LeafBatcher<B: Backend> {
	device: Device<B>,
	side: usize,
}

impl<B: Backend> LeafBatcher<B> {
	pub fn new(device: Device<B>, side: u32) -> Self {
		Self { device, side: side as usize }
	}
}

#[derive(Clone, Debug)]
pub struct LeafBatch<B: Backend> {
	/// `[N, 3, side, side]` in `[0, 1]`.
	pub images: Tensor<B, 4>,
	pub targets: Tensor<B, 1, Int>,
}

impl<B: Backend> Batcher<LeafItem, LeafBatch<B>> for LeafBatcher<B> {
	fn batch(&self, items: Vec<LeafItem>) -> LeafBatch<B> {
		let side = self.side;

		let targets = items
			.iter()
			.map(|item| Tensor::<B, 1, Int>::from_data([(item.label as i64).elem::<B::IntElem>()], &self.device))
			.collect();

		let images = items
			.into_iter()
			.map(|item| TensorData::new(item.pixels, [side, side, 3]).convert::<B::FloatElem>())
			.map(|data| Tensor::<B, 3>::from_data(data, &self.device))
			.map(|tensor| tensor.permute([2, 0, 1]).unsqueeze::<4>())
			.collect();

		LeafBatch {
			images: Tensor::cat(images, 0),
			targets: Tensor::cat(targets, 0),
		}
	}
}
