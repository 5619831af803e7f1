use burn::prelude::{Backend, Device, Tensor, TensorData};
use image::imageops::FilterType;
use image::{DynamicImage, ImageReader, RgbImage};
use std::path::Path;

use crate::error::RiceError;

/// Side length of the square model input.
pub const DEFAULT_SIDE: u32 = 224;

/// Decodes an image file, guessing the format from its content rather than
/// its extension.
pub fn open_image<P: AsRef<Path>>(path: P) -> Result<DynamicImage, RiceError> {
	let path = path.as_ref();
	let name = path.display().to_string();

	ImageReader::open(path)
		.map_err(|err| RiceError::decode(&name, err))?
		.with_guessed_format()
		.map_err(|err| RiceError::decode(&name, err))?
		.decode()
		.map_err(|err| RiceError::decode(&name, err))
}

pub fn decode_image(bytes: &[u8]) -> Result<DynamicImage, RiceError> {
	image::load_from_memory(bytes).map_err(|err| RiceError::decode("upload", err))
}

/// Any colour layout (grayscale, alpha, 16-bit) is folded into 8-bit RGB
/// before resizing to `side x side` with a bilinear filter.
pub fn resized_rgb(image: &DynamicImage, side: u32) -> RgbImage {
	image.resize_exact(side, side, FilterType::Triangle).into_rgb8()
}

/// `[H, W, 3]` bytes -> `[H, W, 3]` floats in `[0, 1]`.
pub fn rescale(image: &RgbImage) -> Vec<f32> {
	image.as_raw().iter().map(|&x| x as f32 / 255.0).collect()
}

pub fn preprocess(image: &DynamicImage, side: u32) -> Vec<f32> {
	rescale(&resized_rgb(image, side))
}

pub fn load_and_preprocess<P: AsRef<Path>>(path: P, side: u32) -> Result<Vec<f32>, RiceError> {
	Ok(preprocess(&open_image(path)?, side))
}

/// `[H, W, C]` pixels -> `[C, H, W]` tensor.
pub fn to_tensor<B: Backend>(pixels: Vec<f32>, side: usize, device: &Device<B>) -> Tensor<B, 3> {
	Tensor::<B, 3>::from_data(TensorData::new(pixels, [side, side, 3]).convert::<B::FloatElem>(), device)
		.permute([2, 0, 1])
}

/// Single preprocessed image as a batch of one, `[1, C, H, W]`.
pub fn to_batch<B: Backend>(pixels: Vec<f32>, side: usize, device: &Device<B>) -> Tensor<B, 4> {
	to_tensor(pixels, side, device).unsqueeze::<4>()
}
