use axum::body::Bytes;
use axum::extract::multipart::{MultipartError, MultipartRejection};
use axum::extract::{DefaultBodyLimit, Multipart, Query, State};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use image::RgbImage;
use minijinja::{context, Environment};
use serde::Deserialize;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tower_http::services::ServeDir;

use crate::advisory;
use crate::config::ServeConfig;
use crate::error::RiceError;
use crate::infer::LeafClassifier;
use crate::labels::LabelIndex;
use crate::preprocess::decode_image;

const INDEX_TEMPLATE: &str = "index.html";
const RESULT_TEMPLATE: &str = "result.html";

pub fn templates() -> Result<Environment<'static>, RiceError> {
	let mut env = Environment::new();
	env.add_template(INDEX_TEMPLATE, include_str!("../templates/index.html"))?;
	env.add_template(RESULT_TEMPLATE, include_str!("../templates/result.html"))?;
	Ok(env)
}

/// Loaded once at start-up and shared by every request.
#[derive(Clone)]
pub struct AppState {
	classifier: Arc<dyn LeafClassifier>,
	labels: Arc<LabelIndex>,
	config: Arc<ServeConfig>,
	templates: Arc<Environment<'static>>,
}

impl AppState {
	pub fn new(classifier: Arc<dyn LeafClassifier>, labels: LabelIndex, config: ServeConfig) -> Result<Self, RiceError> {
		Ok(Self {
			classifier,
			labels: Arc::new(labels),
			config: Arc::new(config),
			templates: Arc::new(templates()?),
		})
	}
}

pub fn router(state: AppState) -> Router {
	Router::new()
		.route("/", get(index))
		.route("/upload", post(upload))
		.nest_service("/static", ServeDir::new(&state.config.static_dir))
		.layer(DefaultBodyLimit::max(state.config.max_upload_bytes))
		.with_state(state)
}

#[derive(Debug)]
pub enum WebError {
	Core(RiceError),
	Multipart(MultipartError),
}

impl From<RiceError> for WebError {
	fn from(err: RiceError) -> Self {
		WebError::Core(err)
	}
}

impl From<MultipartError> for WebError {
	fn from(err: MultipartError) -> Self {
		WebError::Multipart(err)
	}
}

impl From<io::Error> for WebError {
	fn from(err: io::Error) -> Self {
		WebError::Core(err.into())
	}
}

impl IntoResponse for WebError {
	fn into_response(self) -> Response {
		match self {
			WebError::Core(RiceError::InvalidRequest(message)) => {
				log::warn!("Rejected upload: {message}");
				(StatusCode::BAD_REQUEST, message).into_response()
			}
			WebError::Core(RiceError::InferenceTimeout(secs)) => {
				log::error!("Inference took longer than {secs}s");
				(StatusCode::GATEWAY_TIMEOUT, "Prediction timed out").into_response()
			}
			WebError::Core(err) => {
				log::error!("Upload failed: {err}");
				(StatusCode::INTERNAL_SERVER_ERROR, "Prediction failed").into_response()
			}
			WebError::Multipart(err) => {
				log::warn!("Bad multipart body: {err}");
				err.into_response()
			}
		}
	}
}

/// Reduces a client-supplied name to `[A-Za-z0-9._-]`, with path separators
/// and whitespace runs turned into `_` and leading/trailing dots and
/// underscores stripped, so it can never leave the upload directory.
pub fn sanitize_filename(name: &str) -> String {
	let name = name.replace(['/', '\\'], " ");
	let joined = name.split_whitespace().collect::<Vec<_>>().join("_");
	let kept: String = joined
		.chars()
		.filter(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
		.collect();
	let trimmed = kept.trim_matches(|c| c == '.' || c == '_');

	if trimmed.is_empty() {
		"upload".to_string()
	} else {
		trimmed.to_string()
	}
}

/// Appends a random token to the stem so concurrent uploads of the same
/// file never share an upload path or an overlay.
fn unique_name(filename: &str) -> String {
	let path = Path::new(filename);
	let stem = path.file_stem().and_then(|stem| stem.to_str()).unwrap_or("upload");
	let token = rand::random::<u32>();

	match path.extension().and_then(|ext| ext.to_str()) {
		Some(ext) => format!("{stem}-{token:08x}.{ext}"),
		None => format!("{stem}-{token:08x}"),
	}
}

fn overlay_name(filename: &str) -> String {
	let stem = Path::new(filename)
		.file_stem()
		.and_then(|stem| stem.to_str())
		.unwrap_or("upload");
	format!("gradcam_{stem}.png")
}

async fn index(State(state): State<AppState>) -> Result<Html<String>, WebError> {
	let page = state.templates.get_template(INDEX_TEMPLATE).map_err(RiceError::from)?;
	Ok(Html(page.render(context! {}).map_err(RiceError::from)?))
}

#[derive(Debug, Default, Deserialize)]
pub struct UploadQuery {
	#[serde(default)]
	gradcam: bool,
}

struct Classified {
	probabilities: Vec<f32>,
	overlay: Option<String>,
}

async fn upload(
	State(state): State<AppState>,
	Query(query): Query<UploadQuery>,
	multipart: Result<Multipart, MultipartRejection>,
) -> Result<Html<String>, WebError> {
	let mut multipart = multipart.map_err(|rejection| {
		log::warn!("Upload without a multipart body: {rejection}");
		RiceError::InvalidRequest("No file part")
	})?;

	let mut upload = None;
	while let Some(field) = multipart.next_field().await? {
		if field.name() != Some("file") {
			continue;
		}
		// A part without a filename is a plain form field, not a file
		let Some(filename) = field.file_name().map(str::to_string) else {
			continue;
		};
		let bytes = field.bytes().await?;
		upload = Some((filename, bytes));
		break;
	}

	let (filename, bytes) = upload.ok_or(RiceError::InvalidRequest("No file part"))?;
	if filename.is_empty() {
		return Err(RiceError::InvalidRequest("No selected file").into());
	}

	let filename = unique_name(&sanitize_filename(&filename));
	tokio::fs::create_dir_all(&state.config.upload_dir).await?;
	tokio::fs::write(state.config.upload_dir.join(&filename), &bytes).await?;
	log::info!("Saved upload {filename} ({} bytes)", bytes.len());

	let overlay_path = (query.gradcam || state.config.gradcam).then(|| state.config.static_dir.join(overlay_name(&filename)));
	let classified = classify(&state, bytes, overlay_path).await?;

	let (index, score) = classified
		.probabilities
		.iter()
		.copied()
		.enumerate()
		.max_by(|a, b| a.1.total_cmp(&b.1))
		.ok_or_else(|| RiceError::index_file(state.config.labels_path(), "model returned no scores"))?;
	let label = state
		.labels
		.label(index)
		.ok_or_else(|| RiceError::index_file(state.config.labels_path(), format!("no label for class {index}")))?;
	log::info!("{filename}: {label} ({score:.4})");

	let page = state.templates.get_template(RESULT_TEMPLATE).map_err(RiceError::from)?;
	let html = page
		.render(context! {
			label => label,
			confidence => format!("{:.2}%", score * 100.0),
			advisory => advisory::lookup(label),
			gradcam_url => classified.overlay,
		})
		.map_err(RiceError::from)?;

	Ok(Html(html))
}

/// Runs decode, forward pass and the optional overlay on the blocking pool,
/// bounded by the configured timeout.
async fn classify(state: &AppState, bytes: Bytes, overlay_path: Option<PathBuf>) -> Result<Classified, RiceError> {
	let classifier = state.classifier.clone();
	let secs = state.config.inference_timeout_secs;

	let task = tokio::task::spawn_blocking(move || -> Result<Classified, RiceError> {
		let image = decode_image(&bytes)?;
		let probabilities = classifier.probabilities(&image)?;

		let overlay = match overlay_path {
			Some(path) => {
				let class = probabilities
					.iter()
					.enumerate()
					.max_by(|a, b| a.1.total_cmp(b.1))
					.map_or(0, |(index, _)| index);
				save_overlay(&classifier.gradcam_overlay(&image, class)?, &path)?;
				path.file_name().and_then(|name| name.to_str()).map(|name| format!("/static/{name}"))
			}
			None => None,
		};

		Ok(Classified { probabilities, overlay })
	});

	tokio::time::timeout(Duration::from_secs(secs), task)
		.await
		.map_err(|_| RiceError::InferenceTimeout(secs))?
		.map_err(io::Error::other)?
}

fn save_overlay(overlay: &RgbImage, path: &Path) -> Result<(), RiceError> {
	if let Some(dir) = path.parent() {
		std::fs::create_dir_all(dir)?;
	}
	overlay.save(path).map_err(io::Error::other)?;
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;
	use axum::body::{to_bytes, Body};
	use axum::http::Request;
	use image::{DynamicImage, ImageFormat, Rgb};
	use std::io::Cursor;
	use tower::ServiceExt;

	const BOUNDARY: &str = "leaf-boundary";

	struct StubClassifier {
		scores: Vec<f32>,
		delay: Duration,
		fail: bool,
	}

	impl StubClassifier {
		fn new() -> Self {
			Self {
				scores: vec![0.1, 0.1, 0.7, 0.1],
				delay: Duration::ZERO,
				fail: false,
			}
		}
	}

	impl LeafClassifier for StubClassifier {
		fn probabilities(&self, _image: &image::DynamicImage) -> Result<Vec<f32>, RiceError> {
			std::thread::sleep(self.delay);
			if self.fail {
				return Err(RiceError::model_load("models/rice_model", "corrupt record"));
			}
			Ok(self.scores.clone())
		}

		fn gradcam_overlay(&self, image: &image::DynamicImage, _class: usize) -> Result<RgbImage, RiceError> {
			Ok(image.to_rgb8())
		}
	}

	fn app(classifier: StubClassifier, dir: &Path) -> Router {
		let labels = LabelIndex::build(["bacterial_blight", "brown_spot", "rice_blast", "sheath_blight"]);
		let config = ServeConfig::new()
			.with_upload_dir(dir.join("uploads"))
			.with_static_dir(dir.join("static"))
			.with_inference_timeout_secs(if classifier.delay.is_zero() { 30 } else { 0 });

		router(AppState::new(Arc::new(classifier), labels, config).unwrap())
	}

	fn jpeg() -> Vec<u8> {
		let mut bytes = Vec::new();
		DynamicImage::ImageRgb8(RgbImage::from_pixel(16, 16, Rgb([40, 150, 40])))
			.write_to(&mut Cursor::new(&mut bytes), ImageFormat::Jpeg)
			.unwrap();
		bytes
	}

	fn multipart(field: &str, filename: &str, content: &[u8]) -> Body {
		part(&format!("name=\"{field}\"; filename=\"{filename}\""), content)
	}

	fn part(disposition: &str, content: &[u8]) -> Body {
		let mut body = format!(
			"--{BOUNDARY}\r\nContent-Disposition: form-data; {disposition}\r\nContent-Type: image/jpeg\r\n\r\n"
		)
		.into_bytes();
		body.extend_from_slice(content);
		body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());
		Body::from(body)
	}

	fn saved_files(dir: &Path) -> Vec<String> {
		let mut names: Vec<String> = std::fs::read_dir(dir)
			.unwrap()
			.map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
			.collect();
		names.sort();
		names
	}

	async fn post_upload(app: Router, uri: &str, body: Body) -> (StatusCode, String) {
		let request = Request::post(uri)
			.header("content-type", format!("multipart/form-data; boundary={BOUNDARY}"))
			.body(body)
			.unwrap();

		let response = app.oneshot(request).await.unwrap();
		let status = response.status();
		let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
		(status, String::from_utf8(bytes.to_vec()).unwrap())
	}

	#[tokio::test]
	async fn index_serves_upload_form() {
		let dir = tempfile::tempdir().unwrap();

		let response = app(StubClassifier::new(), dir.path())
			.oneshot(Request::get("/").body(Body::empty()).unwrap())
			.await
			.unwrap();

		assert_eq!(response.status(), StatusCode::OK);
		let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
		assert!(String::from_utf8_lossy(&body).contains("name=\"file\""));
	}

	#[tokio::test]
	async fn missing_file_part_is_rejected() {
		let dir = tempfile::tempdir().unwrap();

		let (status, body) = post_upload(app(StubClassifier::new(), dir.path()), "/upload", multipart("photo", "leaf.jpg", &jpeg())).await;

		assert_eq!(status, StatusCode::BAD_REQUEST);
		assert_eq!(body, "No file part");
	}

	#[tokio::test]
	async fn body_that_is_not_multipart_is_rejected() {
		let dir = tempfile::tempdir().unwrap();
		let request = Request::post("/upload").body(Body::empty()).unwrap();

		let response = app(StubClassifier::new(), dir.path()).oneshot(request).await.unwrap();

		assert_eq!(response.status(), StatusCode::BAD_REQUEST);
		let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
		assert_eq!(&body[..], b"No file part");
	}

	#[tokio::test]
	async fn file_field_without_filename_is_not_a_file_part() {
		let dir = tempfile::tempdir().unwrap();

		let (status, body) = post_upload(app(StubClassifier::new(), dir.path()), "/upload", part("name=\"file\"", &jpeg())).await;

		assert_eq!(status, StatusCode::BAD_REQUEST);
		assert_eq!(body, "No file part");
	}

	#[tokio::test]
	async fn empty_filename_is_rejected() {
		let dir = tempfile::tempdir().unwrap();

		let (status, body) = post_upload(app(StubClassifier::new(), dir.path()), "/upload", multipart("file", "", b"")).await;

		assert_eq!(status, StatusCode::BAD_REQUEST);
		assert_eq!(body, "No selected file");
	}

	#[tokio::test]
	async fn upload_renders_prediction_and_advice() {
		let dir = tempfile::tempdir().unwrap();

		let (status, body) = post_upload(app(StubClassifier::new(), dir.path()), "/upload", multipart("file", "leaf.jpg", &jpeg())).await;

		assert_eq!(status, StatusCode::OK);
		assert!(body.contains("Rice Blast Disease"));
		assert!(body.contains("70.00%"));
		assert!(body.contains("Tricyclazole"));
		assert!(!body.contains("<img"));
		let saved = saved_files(&dir.path().join("uploads"));
		assert_eq!(saved.len(), 1);
		assert!(saved[0].starts_with("leaf-") && saved[0].ends_with(".jpg"));
	}

	#[tokio::test]
	async fn gradcam_overlay_is_opt_in() {
		let dir = tempfile::tempdir().unwrap();

		let (status, body) = post_upload(
			app(StubClassifier::new(), dir.path()),
			"/upload?gradcam=true",
			multipart("file", "../../my leaf.jpg", &jpeg()),
		)
		.await;

		assert_eq!(status, StatusCode::OK);
		let overlays = saved_files(&dir.path().join("static"));
		assert_eq!(overlays.len(), 1);
		assert!(overlays[0].starts_with("gradcam_my_leaf-") && overlays[0].ends_with(".png"));
		assert!(body.contains(overlays[0].as_str()));
		assert!(saved_files(&dir.path().join("uploads"))[0].starts_with("my_leaf-"));
	}

	#[tokio::test]
	async fn same_filename_uploads_do_not_collide() {
		let dir = tempfile::tempdir().unwrap();
		let app = app(StubClassifier::new(), dir.path());

		let (first, _) = post_upload(app.clone(), "/upload?gradcam=true", multipart("file", "leaf.jpg", &jpeg())).await;
		let (second, _) = post_upload(app, "/upload?gradcam=true", multipart("file", "leaf.jpg", &jpeg())).await;

		assert_eq!((first, second), (StatusCode::OK, StatusCode::OK));
		assert_eq!(saved_files(&dir.path().join("uploads")).len(), 2);
		assert_eq!(saved_files(&dir.path().join("static")).len(), 2);
	}

	#[test]
	fn unique_names_keep_stem_and_extension() {
		let name = unique_name("leaf.JPG");

		assert!(name.starts_with("leaf-"));
		assert!(name.ends_with(".JPG"));
		assert_eq!(name.len(), "leaf-".len() + 8 + ".JPG".len());
		assert_ne!(unique_name("leaf.JPG"), unique_name("leaf.JPG"));
	}

	#[tokio::test]
	async fn core_failures_become_generic_500() {
		let dir = tempfile::tempdir().unwrap();
		let failing = StubClassifier {
			fail: true,
			..StubClassifier::new()
		};

		let (status, body) = post_upload(app(failing, dir.path()), "/upload", multipart("file", "leaf.jpg", &jpeg())).await;

		assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
		assert_eq!(body, "Prediction failed");
	}

	#[tokio::test]
	async fn undecodable_upload_is_a_server_error() {
		let dir = tempfile::tempdir().unwrap();

		let (status, _) = post_upload(app(StubClassifier::new(), dir.path()), "/upload", multipart("file", "leaf.jpg", b"not an image")).await;

		assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
	}

	#[tokio::test]
	async fn slow_inference_times_out() {
		let dir = tempfile::tempdir().unwrap();
		let slow = StubClassifier {
			delay: Duration::from_millis(300),
			..StubClassifier::new()
		};

		let (status, _) = post_upload(app(slow, dir.path()), "/upload", multipart("file", "leaf.jpg", &jpeg())).await;

		assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
	}

	#[test]
	fn filenames_are_sanitized() {
		assert_eq!(sanitize_filename("../../etc/passwd"), "etc_passwd");
		assert_eq!(sanitize_filename("my leaf (1).JPG"), "my_leaf_1.JPG");
		assert_eq!(sanitize_filename("..\\..\\win.png"), "win.png");
		assert_eq!(sanitize_filename("///"), "upload");
	}
}
