//! Frozen ResNet-18 feature extractor used as the transfer-learning backbone.
//!
//! Pretrained ImageNet weights are imported from the PyTorch model zoo. Every
//! stage is addressable by name so callers can capture intermediate
//! activations (see [STAGES]).

mod backbone;
mod block;
mod norm;
mod weights;

pub use backbone::{Backbone, BackboneRecord, FEATURE_CHANNELS, IMAGENET_MEAN, IMAGENET_STD, STAGES};
pub use block::{BasicBlock, Downsample, LayerBlock, LayerBlockConfig};
pub use norm::FrozenBatchNorm;
pub use weights::{ResNet18, Weights};
