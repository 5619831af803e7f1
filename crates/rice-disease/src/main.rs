use anyhow::{anyhow, Context};
use burn::backend::Autodiff;
use burn::config::Config;
use burn::optim::AdamConfig;
use burn_tch::{LibTorch, LibTorchDevice};
use clap::{Args, Parser, Subcommand};
use log::LevelFilter;
use rand::thread_rng;
use rice_disease::augment::AugmentationConfig;
use rice_disease::config::ServeConfig;
use rice_disease::gradcam::{self, OVERLAY_ALPHA};
use rice_disease::infer::{ImageSource, InferenceSession};
use rice_disease::preprocess::open_image;
use rice_disease::train::{self, TrainingConfig};
use rice_disease::web::{self, AppState};
use rice_disease::LabelIndex;
use simple_logger::SimpleLogger;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

type Backend = Autodiff<LibTorch>;

#[derive(Parser)]
#[command(version, about = "Rice leaf disease detection")]
struct Cli {
	#[command(subcommand)]
	command: Command,
}

#[derive(Subcommand)]
enum Command {
	/// Fit the classifier on <data-dir>/train, validating on <data-dir>/val
	Train(TrainArgs),
	/// Print the top predictions for one image
	Infer(InferArgs),
	/// Write a Grad-CAM overlay for one image
	Gradcam(GradcamArgs),
	/// Run the upload web server
	Serve(ServeArgs),
}

#[derive(Args)]
struct TrainArgs {
	#[arg(long, default_value = "dataset")]
	data_dir: PathBuf,
	#[arg(long, default_value_t = 10)]
	epochs: usize,
	#[arg(long, default_value_t = 16)]
	batch_size: usize,
	#[arg(long, default_value_t = 224)]
	img_size: u32,
	#[arg(long, default_value_t = 1e-4)]
	lr: f64,
	#[arg(long, default_value = "models")]
	models_dir: PathBuf,
	/// Continue from the last completed epoch in <models-dir>/checkpoint
	#[arg(long)]
	resume: bool,
	#[arg(long, default_value_t = 4)]
	workers: usize,
}

#[derive(Args)]
struct ModelArgs {
	#[arg(long, default_value = "models/rice_model")]
	model_path: PathBuf,
	#[arg(long, default_value = "models/class_indices.json")]
	labels: PathBuf,
	#[arg(long, default_value_t = 224)]
	img_size: u32,
}

#[derive(Args)]
struct InferArgs {
	#[command(flatten)]
	model: ModelArgs,
	#[arg(long, required_unless_present = "random", conflicts_with = "random")]
	image: Option<PathBuf>,
	/// Pick a random image from --val-dir
	#[arg(long)]
	random: bool,
	#[arg(long, default_value = "dataset/val")]
	val_dir: PathBuf,
	#[arg(long, default_value_t = 3)]
	top_k: usize,
}

#[derive(Args)]
struct GradcamArgs {
	#[command(flatten)]
	model: ModelArgs,
	#[arg(long)]
	image: PathBuf,
	/// Defaults to layer4
	#[arg(long)]
	layer: Option<String>,
	/// Defaults to the predicted class
	#[arg(long)]
	class: Option<usize>,
	#[arg(long, default_value = "gradcam.png")]
	output: PathBuf,
}

#[derive(Args)]
struct ServeArgs {
	#[arg(long)]
	addr: Option<String>,
	/// JSON server config; flags override it
	#[arg(long)]
	config: Option<PathBuf>,
	#[arg(long)]
	models_dir: Option<PathBuf>,
	/// Render a Grad-CAM overlay for every upload
	#[arg(long)]
	gradcam: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	SimpleLogger::new().with_level(LevelFilter::Info).env().init()?;

	match Cli::parse().command {
		Command::Train(args) => train(args).await,
		Command::Infer(args) => infer(args),
		Command::Gradcam(args) => gradcam(args),
		Command::Serve(args) => serve(args).await,
	}
}

fn device() -> LibTorchDevice {
	if tch::utils::has_cuda() {
		LibTorchDevice::Cuda(0)
	} else {
		log::warn!("No CUDA device detected, running on CPU");
		LibTorchDevice::Cpu
	}
}

fn load_session(args: &ModelArgs) -> anyhow::Result<(LabelIndex, InferenceSession<Backend>)> {
	let labels = LabelIndex::load(&args.labels)?;
	let session = InferenceSession::load(&args.model_path, &labels, args.img_size, device())?;
	Ok((labels, session))
}

async fn train(args: TrainArgs) -> anyhow::Result<()> {
	let config = TrainingConfig::new(AdamConfig::new(), AugmentationConfig::new())
		.with_num_epochs(args.epochs)
		.with_batch_size(args.batch_size)
		.with_image_size(args.img_size)
		.with_learning_rate(args.lr)
		.with_num_workers(args.workers);

	let stop = Arc::new(AtomicBool::new(false));
	let flag = stop.clone();
	tokio::spawn(async move {
		if tokio::signal::ctrl_c().await.is_ok() {
			log::warn!("Ctrl-C received, stopping after the current epoch (press again to abort)");
			flag.store(true, Ordering::SeqCst);
		}
		if tokio::signal::ctrl_c().await.is_ok() {
			std::process::exit(130);
		}
	});

	let time = SystemTime::now();
	let report = tokio::task::spawn_blocking(move || {
		train::train::<Backend>(&args.data_dir, &args.models_dir, &config, args.resume, stop, device())
	})
	.await??;

	log::info!(
		"Finished after {} epochs (best val_loss {:?}, early stop: {}, interrupted: {}) in {:.1}s",
		report.epochs_completed,
		report.best_val_loss,
		report.stopped_early,
		report.interrupted,
		time.elapsed()?.as_secs_f64(),
	);
	Ok(())
}

fn infer(args: InferArgs) -> anyhow::Result<()> {
	let source = match args.image {
		Some(path) => ImageSource::Path(path),
		None => ImageSource::RandomFrom(args.val_dir),
	};
	let path = source.resolve(&mut thread_rng())?;
	if args.random {
		println!("Using random image: {}", path.display());
	}

	let (labels, session) = load_session(&args.model)?;
	let predictions = session.predict(&open_image(&path)?, &labels, args.top_k)?;

	println!("Top predictions:");
	for prediction in predictions {
		println!("{}: {:.4}", prediction.label, prediction.confidence);
	}
	Ok(())
}

fn gradcam(args: GradcamArgs) -> anyhow::Result<()> {
	let path = ImageSource::Path(args.image).resolve(&mut thread_rng())?;
	let (labels, session) = load_session(&args.model)?;
	let image = open_image(&path)?;

	let heatmap = session.gradcam(&image, args.layer.as_deref(), args.class)?;
	gradcam::overlay(&heatmap, &image.to_rgb8(), OVERLAY_ALPHA)
		.save(&args.output)
		.with_context(|| format!("writing {}", args.output.display()))?;

	let class = args
		.class
		.and_then(|class| labels.label(class))
		.map(str::to_string)
		.or_else(|| session.predict(&image, &labels, 1).ok()?.into_iter().next().map(|p| p.label));
	log::info!("Saved Grad-CAM for {} to {}", class.unwrap_or_default(), args.output.display());
	Ok(())
}

async fn serve(args: ServeArgs) -> anyhow::Result<()> {
	let mut config = match &args.config {
		Some(path) => ServeConfig::load(path).map_err(|err| anyhow!("server config {}: {err:?}", path.display()))?,
		None => ServeConfig::new(),
	};
	if let Some(addr) = args.addr {
		config.addr = addr;
	}
	if let Some(models_dir) = args.models_dir {
		config.models_dir = models_dir;
	}
	config.gradcam |= args.gradcam;

	let labels = LabelIndex::load(config.labels_path())?;
	let session = InferenceSession::<Backend>::load(config.model_path(), &labels, config.image_size, device())?;
	let addr = config.addr.clone();
	let state = AppState::new(Arc::new(session), labels, config)?;

	let listener = tokio::net::TcpListener::bind(&addr).await?;
	log::info!("Listening on http://{addr}");
	axum::serve(listener, web::router(state))
		.with_graceful_shutdown(async {
			tokio::signal::ctrl_c().await.ok();
		})
		.await?;

	Ok(())
}
