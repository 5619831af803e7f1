use burn::data::network::downloader;
use std::fs::{create_dir_all, File};
use std::io::{self, Write};
use std::path::PathBuf;

const CACHE_NAMESPACE: &str = "rice-disease";

pub struct Weights {
	pub url: &'static str,
}

impl Weights {
	/// Download the pre-trained weights to the local cache directory, unless
	/// a previous run already did.
	pub fn download(&self) -> Result<PathBuf, io::Error> {
		let model_dir = dirs::home_dir()
			.ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no home directory to cache weights in"))?
			.join(".cache")
			.join(CACHE_NAMESPACE);

		if !model_dir.exists() {
			create_dir_all(&model_dir)?;
		}

		let file_base_name = self
			.url
			.rsplit_once('/')
			.map(|(_, name)| name)
			.unwrap_or(self.url);
		let file_name = model_dir.join(file_base_name);

		if !file_name.exists() {
			log::info!("Downloading {} to {}", self.url, file_name.display());
			let bytes = downloader::download_file_as_bytes(self.url, file_base_name);

			// Write to a sibling first so an interrupted download never looks complete
			let partial = file_name.with_extension("part");
			File::create(&partial)?.write_all(&bytes)?;
			std::fs::rename(&partial, &file_name)?;
		}

		Ok(file_name)
	}
}

#[derive(Debug, Clone, Copy, Default)]
pub enum ResNet18 {
	/// These weights reproduce closely the results of the original paper.
	/// Top-1 accuracy: 69.758%.
	/// Top-5 accuracy: 89.078%.
	#[default]
	ImageNet1kV1,
}

impl ResNet18 {
	pub fn weights(&self) -> Weights {
		match self {
			ResNet18::ImageNet1kV1 => Weights {
				url: "https://download.pytorch.org/models/resnet18-f37072fd.pth",
			},
		}
	}
}
