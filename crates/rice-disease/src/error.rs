use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RiceError {
	#[error("Could not decode image {source_name}: {reason}")]
	ImageDecode { source_name: String, reason: String },
	#[error("Image path invalid or missing: {0}")]
	ImageNotFound(PathBuf),
	#[error("Label index {path} unusable: {reason}")]
	IndexFile { path: PathBuf, reason: String },
	#[error("Could not load model {path}: {reason}")]
	ModelLoad { path: PathBuf, reason: String },
	#[error("Layer {0} not found in model")]
	LayerNotFound(String),
	#[error("Layer {0} has no spatial output")]
	LayerNotSpatial(String),
	#[error("{0}")]
	InvalidRequest(&'static str),
	#[error("Inference exceeded {0} seconds")]
	InferenceTimeout(u64),
	#[error("Checkpoint error: {0}")]
	Checkpoint(String),
	#[error("Template error")]
	Template(#[from] minijinja::Error),
	#[error("Std IO error")]
	StdIoError(#[from] std::io::Error),
}

impl RiceError {
	pub(crate) fn decode(source_name: impl Into<String>, reason: impl ToString) -> Self {
		RiceError::ImageDecode {
			source_name: source_name.into(),
			reason: reason.to_string(),
		}
	}

	pub(crate) fn index_file(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
		RiceError::IndexFile {
			path: path.into(),
			reason: reason.to_string(),
		}
	}

	pub(crate) fn model_load(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
		RiceError::ModelLoad {
			path: path.into(),
			reason: reason.to_string(),
		}
	}
}
