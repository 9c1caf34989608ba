use std::sync::Arc;

use axum::Json;
use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use base64::Engine;
use serde::{Deserialize, Serialize};
use tokio_util::io::ReaderStream;

use screener::Artifact;

use crate::server::AppState;

/// Maps pipeline error kinds onto HTTP statuses.
pub struct ApiError(screener::Error);

impl From<screener::Error> for ApiError {
	fn from(err: screener::Error) -> Self {
		Self(err)
	}
}

impl IntoResponse for ApiError {
	fn into_response(self) -> Response {
		let status = match &self.0 {
			screener::Error::NotFound => StatusCode::NOT_FOUND,
			screener::Error::Credentials => StatusCode::UNAUTHORIZED,
			screener::Error::InvalidRequest(_) => StatusCode::BAD_REQUEST,
			_ => StatusCode::INTERNAL_SERVER_ERROR,
		};

		if status.is_server_error() {
			tracing::warn!(err = %self.0, "request failed");
		}

		(status, Json(serde_json::json!({ "error": self.0.to_string() }))).into_response()
	}
}

type ApiResult<T> = Result<T, ApiError>;

#[derive(Deserialize)]
pub struct ListQuery {
	prefix: Option<String>,
}

pub async fn list(
	State(state): State<Arc<AppState>>,
	Query(query): Query<ListQuery>,
) -> ApiResult<Response> {
	let entries = state.controller.list(query.prefix.as_deref()).await?;
	Ok(Json(entries).into_response())
}

pub async fn info(
	State(state): State<Arc<AppState>>,
	Path(key): Path<String>,
) -> ApiResult<Response> {
	let record = state.controller.info(&key).await?;
	Ok(Json((*record).clone()).into_response())
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaylistQuery {
	segment_duration: Option<u32>,
	goniometer: Option<String>,
	ebu_r128: Option<String>,
}

pub async fn playlist(
	State(state): State<Arc<AppState>>,
	Path(key): Path<String>,
	Query(query): Query<PlaylistQuery>,
) -> ApiResult<Response> {
	let mut options = state.controller.default_options();
	if let Some(segment_duration) = query.segment_duration {
		options.segment_duration = segment_duration.max(1);
	}
	options.goniometer = flag(&query.goniometer);
	options.loudness_overlay = flag(&query.ebu_r128);

	let bytes = state.controller.playlist(&key, options).await?;

	Ok((
		[
			(header::CONTENT_TYPE, "application/vnd.apple.mpegurl"),
			(header::CACHE_CONTROL, "no-cache"),
		],
		bytes,
	)
		.into_response())
}

/// `segment<NNN>.ts` and `thumb<NNN>.jpg`, streamed from the session's
/// working directory. A dropped client cancels the file read with the body.
pub async fn artifact(
	State(state): State<Arc<AppState>>,
	Path((key, name)): Path<(String, String)>,
) -> ApiResult<Response> {
	match state.controller.artifact(&key, &name)? {
		Artifact::Segment(path) => serve_file(&path, "video/mp2t").await,
		Artifact::Thumbnail(path) => serve_file(&path, "image/jpeg").await,
	}
}

async fn serve_file(path: &std::path::Path, content_type: &'static str) -> ApiResult<Response> {
	let file = tokio::fs::File::open(path)
		.await
		.map_err(|_| screener::Error::NotFound)?;

	let body = Body::from_stream(ReaderStream::new(file));

	Ok((
		[
			(header::CONTENT_TYPE, content_type),
			(header::CACHE_CONTROL, "public, max-age=3600"),
		],
		body,
	)
		.into_response())
}

// `data` stays in the JSON as null for thumbnails the transcoder has not
// written yet; clients key their placeholders off it.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ThumbnailEntry {
	segment_index: usize,
	time: f64,
	data: Option<String>,
	source: &'static str,
}

pub async fn thumbnails(
	State(state): State<Arc<AppState>>,
	Path(key): Path<String>,
) -> ApiResult<Response> {
	let thumbnails = state.controller.thumbnails(&key).await?;

	let entries: Vec<ThumbnailEntry> = thumbnails
		.into_iter()
		.map(|thumb| {
			let data = thumb.bytes.map(|bytes| {
				format!(
					"data:image/jpeg;base64,{}",
					base64::engine::general_purpose::STANDARD.encode(&bytes)
				)
			});

			ThumbnailEntry {
				segment_index: thumb.index,
				time: thumb.time,
				source: if data.is_some() { "hls" } else { "pending" },
				data,
			}
		})
		.collect();

	Ok(Json(entries).into_response())
}

#[derive(Deserialize)]
pub struct WaveformQuery {
	samples: Option<usize>,
}

pub async fn waveform(
	State(state): State<Arc<AppState>>,
	Path(key): Path<String>,
	Query(query): Query<WaveformQuery>,
) -> ApiResult<Response> {
	let buckets = query.samples.unwrap_or(1000).clamp(1, 100_000);
	let waveform = state.controller.waveform(&key, buckets).await?;
	Ok(Json((*waveform).clone()).into_response())
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoudnessQuery {
	start_time: Option<f64>,
	duration: Option<f64>,
}

pub async fn ebu_r128(
	State(state): State<Arc<AppState>>,
	Path(key): Path<String>,
	Query(query): Query<LoudnessQuery>,
) -> ApiResult<Response> {
	let start = query.start_time.unwrap_or(0.0).max(0.0);
	let duration = query.duration.unwrap_or(10.0).max(0.1);

	let window = state.controller.loudness(&key, start, duration).await?;
	Ok(Json(window).into_response())
}

pub async fn progress(
	State(state): State<Arc<AppState>>,
	Path(key): Path<String>,
) -> ApiResult<Response> {
	let progress = state.controller.progress(&key).await;
	Ok(Json(progress).into_response())
}

#[derive(Deserialize)]
pub struct StreamQuery {
	t: Option<f64>,
	d: Option<f64>,
}

pub async fn stream(
	State(state): State<Arc<AppState>>,
	Path(key): Path<String>,
	Query(query): Query<StreamQuery>,
) -> ApiResult<Response> {
	let start = query.t.unwrap_or(0.0).max(0.0);
	let duration = query.d.unwrap_or(10.0).clamp(0.1, 60.0);

	let bytes = state.controller.stream(&key, start, duration).await?;

	Ok((
		[
			(header::CONTENT_TYPE, "video/mp4"),
			(header::CACHE_CONTROL, "no-cache"),
		],
		Body::from(bytes),
	)
		.into_response())
}

pub async fn abort(
	State(state): State<Arc<AppState>>,
	Path(key): Path<String>,
) -> ApiResult<Response> {
	state.controller.abort(&key).await;
	Ok(Json(serde_json::json!({ "aborted": true })).into_response())
}

pub async fn abort_all(State(state): State<Arc<AppState>>) -> ApiResult<Response> {
	let count = state.controller.abort_all().await;
	Ok(Json(serde_json::json!({ "abortedCount": count })).into_response())
}

fn flag(value: &Option<String>) -> bool {
	matches!(value.as_deref(), Some("true") | Some("1"))
}
