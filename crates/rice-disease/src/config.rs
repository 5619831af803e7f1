use burn::config::Config;
use std::path::PathBuf;

use crate::train::{LABELS_FILE, MODEL_FILE};

#[derive(Config, Debug)]
pub struct ServeConfig {
	#[config(default = "String::from(\"127.0.0.1:5000\")")]
	pub addr: String,
	#[config(default = "PathBuf::from(\"models\")")]
	pub models_dir: PathBuf,
	/// Uploaded files are written here before classification.
	#[config(default = "PathBuf::from(\"uploads\")")]
	pub upload_dir: PathBuf,
	/// Served under `/static`; Grad-CAM overlays land here.
	#[config(default = "PathBuf::from(\"static\")")]
	pub static_dir: PathBuf,
	#[config(default = 224)]
	pub image_size: u32,
	#[config(default = 30)]
	pub inference_timeout_secs: u64,
	/// Render a Grad-CAM overlay for every upload, not only on request.
	#[config(default = false)]
	pub gradcam: bool,
	#[config(default = 16777216)]
	pub max_upload_bytes: usize,
}

impl ServeConfig {
	pub fn model_path(&self) -> PathBuf {
		self.models_dir.join(MODEL_FILE)
	}

	pub fn labels_path(&self) -> PathBuf {
		self.models_dir.join(LABELS_FILE)
	}
}
