use burn::config::Config;
use burn::data::dataloader::{DataLoader, DataLoaderBuilder};
use burn::data::dataset::Dataset;
use burn::module::AutodiffModule;
use burn::optim::{AdamConfig, GradientsParams, Optimizer};
use burn::prelude::{Backend, ElementConversion};
use burn::record::{CompactRecorder, Recorder};
use burn::tensor::backend::AutodiffBackend;
use burn::train::ClassificationOutput;
use rice_backbone::ResNet18;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::augment::AugmentationConfig;
use crate::data::{LeafBatch, LeafBatcher, LeafDataset};
use crate::error::RiceError;
use crate::labels::LabelIndex;
use crate::model::{RiceClassifier, RiceClassifierConfig};

pub const MODEL_FILE: &str = "rice_model";
pub const LABELS_FILE: &str = "class_indices.json";
pub const CONFIG_FILE: &str = "config.json";
pub const CHECKPOINT_DIR: &str = "checkpoint";
const STATE_FILE: &str = "state.json";
const OPTIMIZER_FILE: &str = "optimizer";

#[derive(Config)]
pub struct TrainingConfig {
	pub optimizer: AdamConfig,
	pub augmentation: AugmentationConfig,
	#[config(default = 10)]
	pub num_epochs: usize,
	#[config(default = 16)]
	pub batch_size: usize,
	#[config(default = 224)]
	pub image_size: u32,
	#[config(default = 1e-4)]
	pub learning_rate: f64,
	#[config(default = 0.3)]
	pub dropout: f64,
	/// Start from ImageNet weights rather than a random backbone.
	#[config(default = true)]
	pub pretrained: bool,
	#[config(default = 4)]
	pub num_workers: usize,
	#[config(default = 42)]
	pub seed: u64,
	#[config(default = 3)]
	pub plateau_patience: usize,
	#[config(default = 0.5)]
	pub plateau_factor: f64,
	#[config(default = 1e-4)]
	pub plateau_min_delta: f64,
	#[config(default = 1e-7)]
	pub min_learning_rate: f64,
	#[config(default = 6)]
	pub early_stopping_patience: usize,
}

/// Multiplies the learning rate by `factor` once validation loss has failed to
/// beat its best by `min_delta` for `patience` epochs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlateauScheduler {
	lr: f64,
	best: Option<f64>,
	wait: usize,
	patience: usize,
	factor: f64,
	min_lr: f64,
	min_delta: f64,
}

impl PlateauScheduler {
	pub fn new(config: &TrainingConfig) -> Self {
		Self {
			lr: config.learning_rate,
			best: None,
			wait: 0,
			patience: config.plateau_patience,
			factor: config.plateau_factor,
			min_lr: config.min_learning_rate,
			min_delta: config.plateau_min_delta,
		}
	}

	pub fn lr(&self) -> f64 {
		self.lr
	}

	/// Records one epoch's validation loss and returns the rate for the next.
	pub fn observe(&mut self, loss: f64) -> f64 {
		let improved = match self.best {
			Some(best) => loss < best - self.min_delta,
			None => true,
		};

		if improved {
			self.best = Some(loss);
			self.wait = 0;
			return self.lr;
		}

		self.wait += 1;
		if self.wait >= self.patience {
			let reduced = (self.lr * self.factor).max(self.min_lr);
			if reduced < self.lr {
				log::info!("Validation loss plateaued, reducing learning rate to {reduced:e}");
			}
			self.lr = reduced;
			self.wait = 0;
		}

		self.lr
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
	Improved,
	Stalled,
	/// Patience ran out.
	Exhausted,
}

/// Tracks the best validation loss. Only a strictly lower loss counts as
/// progress; the same signal decides when the best checkpoint is rewritten.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EarlyStopping {
	best: Option<f64>,
	wait: usize,
	patience: usize,
}

impl EarlyStopping {
	pub fn new(patience: usize) -> Self {
		Self {
			best: None,
			wait: 0,
			patience,
		}
	}

	pub fn best(&self) -> Option<f64> {
		self.best
	}

	pub fn observe(&mut self, loss: f64) -> Progress {
		if self.best.map_or(true, |best| loss < best) {
			self.best = Some(loss);
			self.wait = 0;
			return Progress::Improved;
		}

		self.wait += 1;
		if self.wait >= self.patience {
			Progress::Exhausted
		} else {
			Progress::Stalled
		}
	}
}

/// Everything besides weights needed to continue an interrupted run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingState {
	/// Last fully completed epoch, 1-based. Zero before the first epoch ends.
	pub epoch: usize,
	pub scheduler: PlateauScheduler,
	pub stopping: EarlyStopping,
}

impl TrainingState {
	pub fn new(config: &TrainingConfig) -> Self {
		Self {
			epoch: 0,
			scheduler: PlateauScheduler::new(config),
			stopping: EarlyStopping::new(config.early_stopping_patience),
		}
	}

	/// Writes to a sibling temp file first so an interruption never leaves a
	/// half-written state behind.
	pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), RiceError> {
		let path = path.as_ref();
		let json = serde_json::to_string_pretty(self).map_err(|err| RiceError::Checkpoint(err.to_string()))?;
		let tmp = path.with_extension("json.tmp");

		fs::write(&tmp, json)?;
		fs::rename(&tmp, path)?;

		Ok(())
	}

	pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, RiceError> {
		let path = path.as_ref();
		let raw = fs::read_to_string(path)?;

		serde_json::from_str(&raw).map_err(|err| RiceError::Checkpoint(format!("{}: {err}", path.display())))
	}
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrainingReport {
	pub epochs_completed: usize,
	pub best_val_loss: Option<f64>,
	pub stopped_early: bool,
	pub interrupted: bool,
}

#[derive(Default)]
struct EpochMetrics {
	loss_sum: f64,
	correct: i64,
	count: usize,
}

impl EpochMetrics {
	fn record<B: Backend>(&mut self, output: &ClassificationOutput<B>) {
		let n = output.targets.dims()[0];
		let loss = output.loss.clone().into_scalar().elem::<f64>();
		let correct = output
			.output
			.clone()
			.argmax(1)
			.squeeze::<1>(1)
			.equal(output.targets.clone())
			.int()
			.sum()
			.into_scalar()
			.elem::<i64>();

		self.loss_sum += loss * n as f64;
		self.correct += correct;
		self.count += n;
	}

	fn loss(&self) -> f64 {
		if self.count == 0 {
			return 0.0;
		}
		self.loss_sum / self.count as f64
	}

	fn accuracy(&self) -> f64 {
		if self.count == 0 {
			return 0.0;
		}
		self.correct as f64 / self.count as f64
	}
}

/// Output locations under the models directory.
#[derive(Debug, Clone)]
pub struct Artifacts {
	root: PathBuf,
}

impl Artifacts {
	pub fn new<P: AsRef<Path>>(models_dir: P) -> Self {
		Self {
			root: models_dir.as_ref().to_path_buf(),
		}
	}

	pub fn model(&self) -> PathBuf {
		self.root.join(MODEL_FILE)
	}

	pub fn labels(&self) -> PathBuf {
		self.root.join(LABELS_FILE)
	}

	pub fn config(&self) -> PathBuf {
		self.root.join(CONFIG_FILE)
	}

	pub fn checkpoint_dir(&self) -> PathBuf {
		self.root.join(CHECKPOINT_DIR)
	}

	fn checkpoint_model(&self) -> PathBuf {
		self.checkpoint_dir().join(MODEL_FILE)
	}

	fn checkpoint_optimizer(&self) -> PathBuf {
		self.checkpoint_dir().join(OPTIMIZER_FILE)
	}

	fn checkpoint_state(&self) -> PathBuf {
		self.checkpoint_dir().join(STATE_FILE)
	}
}

fn create_artifact_dir(artifacts: &Artifacts, resume: bool) -> Result<(), RiceError> {
	// A fresh run must not pick up a previous run's resume point or best model
	if !resume {
		fs::remove_dir_all(artifacts.checkpoint_dir()).ok();
		fs::remove_file(artifacts.model().with_extension("mpk")).ok();
	}
	fs::create_dir_all(artifacts.checkpoint_dir())?;

	Ok(())
}

/// Fits the classifier on `<dataset_dir>/train`, validating on
/// `<dataset_dir>/val` after every epoch. `stop` is polled between epochs.
pub fn train<B: AutodiffBackend>(
	dataset_dir: &Path,
	models_dir: &Path,
	config: &TrainingConfig,
	resume: bool,
	stop: Arc<AtomicBool>,
	device: B::Device,
) -> Result<TrainingReport, RiceError> {
	let artifacts = Artifacts::new(models_dir);

	let train_dir = dataset_dir.join("train");
	let labels = LabelIndex::scan(&train_dir)?;
	if labels.is_empty() {
		return Err(RiceError::index_file(train_dir, "no class folders to train on"));
	}
	log::info!("Training on classes {:?}", labels.classes());

	let dataset_train = LeafDataset::from_dir(&train_dir, &labels, config.image_size, Some(config.augmentation.clone()))?;
	if dataset_train.is_empty() {
		return Err(RiceError::ImageNotFound(train_dir));
	}
	let val_dir = dataset_dir.join("val");
	let dataset_valid = LeafDataset::from_dir(&val_dir, &labels, config.image_size, None)?;
	if dataset_valid.is_empty() {
		return Err(RiceError::ImageNotFound(val_dir));
	}

	create_artifact_dir(&artifacts, resume)?;
	labels.save(artifacts.labels())?;
	config.save(artifacts.config())?;

	B::seed(config.seed);

	let batcher_train = LeafBatcher::<B>::new(device.clone(), config.image_size);
	let batcher_valid = LeafBatcher::<B::InnerBackend>::new(device.clone(), config.image_size);

	let dataloader_train = DataLoaderBuilder::new(batcher_train)
		.batch_size(config.batch_size)
		.shuffle(config.seed)
		.num_workers(config.num_workers)
		.build(dataset_train);

	let dataloader_valid = DataLoaderBuilder::new(batcher_valid)
		.batch_size(config.batch_size)
		.num_workers(config.num_workers)
		.build(dataset_valid);

	let model_config = RiceClassifierConfig::new(labels.len()).with_dropout(config.dropout);
	let mut optim = config.optimizer.init::<B, RiceClassifier<B>>();

	let resume_point = if resume { load_resume_point(&artifacts)? } else { None };

	let (mut model, mut state) = match resume_point {
		Some(state) => {
			let model = RiceClassifier::<B>::load(artifacts.checkpoint_model(), labels.len(), &device)?;
			let record = CompactRecorder::new()
				.load(artifacts.checkpoint_optimizer(), &device)
				.map_err(|err| RiceError::Checkpoint(format!("optimizer state: {err}")))?;
			optim = optim.load_record(record);
			log::info!("Resuming after epoch {}", state.epoch);
			(model, state)
		}
		None if config.pretrained => (
			model_config.init_pretrained::<B>(ResNet18::ImageNet1kV1, &device)?,
			TrainingState::new(config),
		),
		None => (model_config.init::<B>(&device), TrainingState::new(config)),
	};

	let mut report = TrainingReport {
		epochs_completed: state.epoch,
		best_val_loss: state.stopping.best(),
		stopped_early: false,
		interrupted: false,
	};
	let now = Instant::now();

	for epoch in (state.epoch + 1)..=config.num_epochs {
		if stop.load(Ordering::SeqCst) {
			log::warn!("Interrupted, stopping before epoch {epoch}");
			report.interrupted = true;
			break;
		}

		let lr = state.scheduler.lr();
		let mut train_metrics = EpochMetrics::default();
		for batch in dataloader_train.iter() {
			let LeafBatch { images, targets } = batch;
			let output = model.forward_classification(images, targets);
			train_metrics.record(&output);

			let grads = output.loss.backward();
			let grads = GradientsParams::from_grads(grads, &model);
			model = optim.step(lr, model, grads);
		}

		let model_valid = model.valid();
		let mut valid_metrics = EpochMetrics::default();
		for batch in dataloader_valid.iter() {
			let output = model_valid.forward_classification(batch.images, batch.targets);
			valid_metrics.record(&output);
		}

		let val_loss = valid_metrics.loss();
		log::info!(
			"Epoch {epoch}/{} - loss: {:.4} - accuracy: {:.4} - val_loss: {:.4} - val_accuracy: {:.4} - lr: {lr:e}",
			config.num_epochs,
			train_metrics.loss(),
			train_metrics.accuracy(),
			val_loss,
			valid_metrics.accuracy(),
		);

		state.scheduler.observe(val_loss);
		let progress = state.stopping.observe(val_loss);
		if progress == Progress::Improved {
			log::info!("val_loss improved to {val_loss:.4}, saving model to {}", artifacts.model().display());
			model.save(artifacts.model())?;
		}

		state.epoch = epoch;
		model.save(artifacts.checkpoint_model())?;
		CompactRecorder::new()
			.record(optim.to_record(), artifacts.checkpoint_optimizer())
			.map_err(|err| RiceError::Checkpoint(format!("optimizer state: {err}")))?;
		state.save(artifacts.checkpoint_state())?;

		report.epochs_completed = epoch;
		report.best_val_loss = state.stopping.best();

		if progress == Progress::Exhausted {
			log::info!("No improvement for {} epochs, stopping early", config.early_stopping_patience);
			report.stopped_early = true;
			break;
		}
	}

	let elapsed = now.elapsed().as_secs();
	log::info!("Training completed in {}m{}s", elapsed / 60, elapsed % 60);

	// The file on disk already holds the best epoch; reload it to confirm it
	// is usable with the saved label index.
	if report.best_val_loss.is_some() {
		RiceClassifier::<B::InnerBackend>::load(artifacts.model(), labels.len(), &device)?;
		log::info!("Restored best weights (val_loss {:.4})", report.best_val_loss.unwrap_or_default());
	}

	Ok(report)
}

fn load_resume_point(artifacts: &Artifacts) -> Result<Option<TrainingState>, RiceError> {
	let path = artifacts.checkpoint_state();
	if !path.exists() {
		log::warn!("No checkpoint in {}, starting from scratch", artifacts.checkpoint_dir().display());
		return Ok(None);
	}

	TrainingState::load(path).map(Some)
}

#[cfg(test)]
mod tests {
	use super::*;
	use burn::backend::{Autodiff, NdArray};
	use image::{Rgb, RgbImage};

	type TestBackend = Autodiff<NdArray<f32>>;

	fn config() -> TrainingConfig {
		TrainingConfig::new(AdamConfig::new(), AugmentationConfig::new())
	}

	#[test]
	fn plateau_halves_rate_after_patience() {
		let mut scheduler = PlateauScheduler::new(&config());

		assert_eq!(scheduler.observe(1.0), 1e-4);
		assert_eq!(scheduler.observe(0.99995), 1e-4);
		assert_eq!(scheduler.observe(1.2), 1e-4);
		assert_eq!(scheduler.observe(1.1), 5e-5);
		// Counter restarts after a reduction
		assert_eq!(scheduler.observe(1.1), 5e-5);
		assert_eq!(scheduler.observe(0.5), 5e-5);
	}

	#[test]
	fn plateau_rate_never_drops_below_floor() {
		let mut scheduler = PlateauScheduler::new(&config().with_learning_rate(1e-7).with_plateau_patience(1));

		scheduler.observe(1.0);
		for _ in 0..5 {
			scheduler.observe(2.0);
		}

		assert_eq!(scheduler.lr(), 1e-7);
	}

	#[test]
	fn early_stopping_waits_for_patience() {
		let mut stopping = EarlyStopping::new(2);

		assert_eq!(stopping.observe(0.8), Progress::Improved);
		assert_eq!(stopping.observe(0.8), Progress::Stalled);
		assert_eq!(stopping.observe(0.7), Progress::Improved);
		assert_eq!(stopping.observe(0.9), Progress::Stalled);
		assert_eq!(stopping.observe(0.75), Progress::Exhausted);
		assert_eq!(stopping.best(), Some(0.7));
	}

	#[test]
	fn best_checkpoint_never_follows_a_worse_epoch() {
		let losses = [0.9, 0.6, 0.7, 0.6, 0.4, 0.8, 0.5];
		let mut stopping = EarlyStopping::new(10);
		let mut saved = Vec::new();

		for loss in losses {
			if stopping.observe(loss) == Progress::Improved {
				saved.push(loss);
			}
		}

		assert_eq!(saved, vec![0.9, 0.6, 0.4]);
		assert_eq!(stopping.best(), Some(0.4));
	}

	#[test]
	fn training_state_survives_a_restart() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join(STATE_FILE);
		let mut state = TrainingState::new(&config());
		state.epoch = 4;
		state.scheduler.observe(0.3);
		state.stopping.observe(0.3);

		state.save(&path).unwrap();

		assert_eq!(TrainingState::load(&path).unwrap(), state);
		assert!(!path.with_extension("json.tmp").exists());
	}

	fn write_split(root: &Path, split: &str, per_class: usize) {
		for (class, colour) in [("brown_spot", [150, 90, 30]), ("healthy", [30, 170, 50])] {
			let dir = root.join(split).join(class);
			fs::create_dir_all(&dir).unwrap();
			for i in 0..per_class {
				RgbImage::from_pixel(20, 20, Rgb(colour))
					.save(dir.join(format!("{i}.png")))
					.unwrap();
			}
		}
	}

	#[test]
	fn train_writes_artifacts_and_resumes() {
		let dataset = tempfile::tempdir().unwrap();
		let models = tempfile::tempdir().unwrap();
		write_split(dataset.path(), "train", 2);
		write_split(dataset.path(), "val", 1);
		let config = config()
			.with_pretrained(false)
			.with_image_size(32)
			.with_batch_size(2)
			.with_num_workers(1)
			.with_num_epochs(1);
		let device = Default::default();
		let stop = Arc::new(AtomicBool::new(false));

		let report = train::<TestBackend>(dataset.path(), models.path(), &config, false, stop.clone(), device).unwrap();

		assert_eq!(report.epochs_completed, 1);
		assert!(report.best_val_loss.is_some());
		let artifacts = Artifacts::new(models.path());
		assert!(artifacts.model().with_extension("mpk").exists());
		assert_eq!(LabelIndex::load(artifacts.labels()).unwrap().classes(), &["brown_spot", "healthy"]);
		assert!(TrainingConfig::load(artifacts.config()).is_ok());

		let config = config.with_num_epochs(2);
		let report = train::<TestBackend>(dataset.path(), models.path(), &config, true, stop, Default::default()).unwrap();

		assert_eq!(report.epochs_completed, 2);
		assert_eq!(TrainingState::load(artifacts.checkpoint_state()).unwrap().epoch, 2);
	}

	#[test]
	fn stop_flag_prevents_further_epochs() {
		let dataset = tempfile::tempdir().unwrap();
		let models = tempfile::tempdir().unwrap();
		write_split(dataset.path(), "train", 1);
		write_split(dataset.path(), "val", 1);
		let config = config().with_pretrained(false).with_image_size(32).with_num_workers(1);
		let stop = Arc::new(AtomicBool::new(true));
		let stale = Artifacts::new(models.path()).model().with_extension("mpk");
		fs::write(&stale, b"previous run").unwrap();

		let report = train::<TestBackend>(dataset.path(), models.path(), &config, false, stop, Default::default()).unwrap();

		assert!(report.interrupted);
		assert_eq!(report.epochs_completed, 0);
		assert!(!stale.exists());
	}

	#[test]
	fn missing_validation_split_is_an_error() {
		let dataset = tempfile::tempdir().unwrap();
		let models = tempfile::tempdir().unwrap();
		write_split(dataset.path(), "train", 1);
		let config = config().with_pretrained(false).with_image_size(32).with_num_workers(1);
		let stop = Arc::new(AtomicBool::new(false));

		let result = train::<TestBackend>(dataset.path(), models.path(), &config, false, stop, Default::default());

		assert!(matches!(result, Err(RiceError::ImageNotFound(path)) if path.ends_with("val")));
		assert!(!Artifacts::new(models.path()).labels().exists());
	}

	#[test]
	fn class_folders_without_images_are_an_error() {
		let dataset = tempfile::tempdir().unwrap();
		let models = tempfile::tempdir().unwrap();
		fs::create_dir_all(dataset.path().join("train").join("healthy")).unwrap();
		write_split(dataset.path(), "val", 1);
		let config = config().with_pretrained(false).with_image_size(32).with_num_workers(1);
		let stop = Arc::new(AtomicBool::new(false));

		let result = train::<TestBackend>(dataset.path(), models.path(), &config, false, stop, Default::default());

		assert!(matches!(result, Err(RiceError::ImageNotFound(path)) if path.ends_with("train")));
	}

	#[test]
	fn best_model_survives_a_worse_epoch() {
		let dataset = tempfile::tempdir().unwrap();
		let models = tempfile::tempdir().unwrap();
		write_split(dataset.path(), "train", 2);
		write_split(dataset.path(), "val", 1);
		let config = config()
			.with_pretrained(false)
			.with_image_size(32)
			.with_batch_size(2)
			.with_num_workers(1)
			.with_learning_rate(1e-2)
			.with_num_epochs(1);
		let stop = Arc::new(AtomicBool::new(false));
		let artifacts = Artifacts::new(models.path());

		train::<TestBackend>(dataset.path(), models.path(), &config, false, stop.clone(), Default::default()).unwrap();
		let best = fs::read(artifacts.model().with_extension("mpk")).unwrap();

		// No real loss can beat a negative best, so the next epoch is worse
		let mut state = TrainingState::load(artifacts.checkpoint_state()).unwrap();
		state.stopping = EarlyStopping::new(config.early_stopping_patience);
		state.stopping.observe(-1.0);
		state.save(artifacts.checkpoint_state()).unwrap();

		let config = config.with_num_epochs(2);
		let report = train::<TestBackend>(dataset.path(), models.path(), &config, true, stop, Default::default()).unwrap();

		assert_eq!(report.epochs_completed, 2);
		assert_eq!(report.best_val_loss, Some(-1.0));
		assert_eq!(fs::read(artifacts.model().with_extension("mpk")).unwrap(), best);
		assert_ne!(fs::read(artifacts.checkpoint_model().with_extension("mpk")).unwrap(), best);
	}
}
