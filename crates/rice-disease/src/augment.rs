use burn::config::Config;
use image::{Rgb, RgbImage};
use imageproc::geometric_transformations::{warp_with, Interpolation};
use rand::Rng;

/// Random geometric jitter applied to training images only.
#[derive(Config, Debug)]
pub struct AugmentationConfig {
	/// Maximum rotation in degrees, either direction.
	#[config(default = 20.0)]
	pub rotation_range: f32,
	/// Maximum horizontal shift as a fraction of the width.
	#[config(default = 0.1)]
	pub width_shift: f32,
	#[config(default = 0.1)]
	pub height_shift: f32,
	/// Scale is drawn from `[1 - zoom_range, 1 + zoom_range]`.
	#[config(default = 0.1)]
	pub zoom_range: f32,
	#[config(default = true)]
	pub horizontal_flip: bool,
}

impl AugmentationConfig {
	pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Transform {
		Transform {
			angle: rng.gen_range(-self.rotation_range..=self.rotation_range).to_radians(),
			dx: rng.gen_range(-self.width_shift..=self.width_shift),
			dy: rng.gen_range(-self.height_shift..=self.height_shift),
			zoom: rng.gen_range((1.0 - self.zoom_range)..=(1.0 + self.zoom_range)),
			flip: self.horizontal_flip && rng.gen_bool(0.5),
		}
	}
}

/// One sampled augmentation. Shifts are fractions of the image size, the
/// angle is in radians.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transform {
	pub angle: f32,
	pub dx: f32,
	pub dy: f32,
	pub zoom: f32,
	pub flip: bool,
}

impl Transform {
	pub const IDENTITY: Transform = Transform {
		angle: 0.0,
		dx: 0.0,
		dy: 0.0,
		zoom: 1.0,
		flip: false,
	};

	/// Warps `image` about its centre. Points that land outside the source are
	/// clamped to the border, so the gaps are filled with the nearest edge pixel.
	pub fn apply(&self, image: &RgbImage) -> RgbImage {
		let (width, height) = image.dimensions();
		if width == 0 || height == 0 {
			return image.clone();
		}

		let max_x = (width - 1) as f32;
		let max_y = (height - 1) as f32;
		let (cx, cy) = (max_x / 2.0, max_y / 2.0);
		let (sin, cos) = self.angle.sin_cos();
		let shift_x = self.dx * width as f32;
		let shift_y = self.dy * height as f32;
		let Transform { zoom, flip, .. } = *self;

		let mapping = move |x: f32, y: f32| {
			let u = x - cx - shift_x;
			let v = y - cy - shift_y;
			let su = (cos * u + sin * v) * zoom;
			let sv = (cos * v - sin * u) * zoom;
			let sx = if flip { cx - su } else { cx + su };

			(sx.clamp(0.0, max_x), (cy + sv).clamp(0.0, max_y))
		};

		warp_with(image, mapping, Interpolation::Nearest, Rgb([0, 0, 0]))
	}
}
