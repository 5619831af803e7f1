//! Rice leaf disease classification: transfer learning on a frozen ResNet-18,
//! offline and web inference, Grad-CAM overlays and per-disease advice.

pub mod advisory;
pub mod augment;
pub mod config;
pub mod data;
pub mod error;
pub mod gradcam;
pub mod infer;
pub mod labels;
pub mod model;
pub mod preprocess;
pub mod train;
pub mod web;

pub use error::RiceError;
pub use labels::LabelIndex;
pub use model::{RiceClassifier, RiceClassifierConfig};
