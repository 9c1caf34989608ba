use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use serde::Serialize;

use crate::analysis::{self, AnalysisCache, LoudnessWindow, Waveform};
use crate::transcode::{
	self, Session, SessionRegistry, Supervisor, TranscodeOptions, readiness, thumbnail_cap,
};
use crate::{
	Binaries, Config, Error, ObjectStore, Prober, Result, SourceCache, StoreConfig,
};

/// One artifact inside a session's working directory.
pub enum Artifact {
	Segment(PathBuf),
	Thumbnail(PathBuf),
}

/// One thumbnail slot; `bytes` is absent until the transcoder has written it.
pub struct Thumbnail {
	pub index: usize,
	pub time: f64,
	pub bytes: Option<Bytes>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgressStatus {
	Initializing,
	Starting,
	Downloading,
	Downloaded,
	Processing,
	Ready,
	Error,
}

/// Aggregate pipeline progress for one asset.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Progress {
	pub status: ProgressStatus,
	pub message: String,
	pub download_progress: f64,
	pub processing_progress: f64,
	pub overall_progress: u32,
	pub estimated_time_remaining: Option<f64>,
	pub ready: bool,
}

/// The media pipeline controller.
///
/// Owns the singleton "currently loaded" key and composes the object store,
/// source cache, prober, transcoder supervisor and analysis workers on
/// behalf of the HTTP handlers. Switching keys tears the previous asset's
/// sessions and downloads down.
pub struct Controller {
	config: Config,
	binaries: Binaries,
	store: Arc<ObjectStore>,
	prober: Arc<Prober>,
	cache: SourceCache,
	registry: SessionRegistry,
	supervisor: Supervisor,
	analyses: AnalysisCache,

	/// `None` is idle; `Some(key)` is the asset resources are committed to.
	loaded: tokio::sync::Mutex<Option<String>>,
}

impl Controller {
	pub async fn new(config: Config, store_config: StoreConfig) -> Result<Self> {
		let store = Arc::new(ObjectStore::connect(&store_config).await?);
		let binaries = config.binaries();
		let prober = Arc::new(Prober::new(binaries.clone(), store.clone()));
		let registry = SessionRegistry::default();
		let cache = SourceCache::new(&config, store.clone(), prober.clone(), registry.clone());
		let supervisor = Supervisor::new(
			&config,
			store.clone(),
			prober.clone(),
			cache.clone(),
			registry.clone(),
		);

		tokio::fs::create_dir_all(&config.cache_dir).await?;

		Ok(Self {
			config,
			binaries,
			store,
			prober,
			cache,
			registry,
			supervisor,
			analyses: AnalysisCache::default(),
			loaded: tokio::sync::Mutex::new(None),
		})
	}

	/// Remove artifacts from a previous process. Nothing under the cache
	/// directory survives a restart; downloads and sessions rebuild on demand.
	pub async fn clean_workspace(&self) {
		let _ = tokio::fs::remove_dir_all(self.config.cache_dir.join("live-hls")).await;

		if let Ok(mut dir) = tokio::fs::read_dir(&self.config.cache_dir).await {
			while let Ok(Some(entry)) = dir.next_entry().await {
				if entry.file_type().await.map(|t| t.is_file()).unwrap_or(false) {
					let _ = tokio::fs::remove_file(entry.path()).await;
				}
			}
		}
	}

	/// Transcode options for a playlist request, seeded with the configured
	/// default segment duration.
	pub fn default_options(&self) -> TranscodeOptions {
		TranscodeOptions {
			segment_duration: self.config.segment_duration,
			..Default::default()
		}
	}

	/// Commit the service to one asset. A different previous key is fully
	/// aborted; the same key just gets a liveness check on its child.
	pub async fn load(&self, key: &str) -> Result<()> {
		let mut loaded = self.loaded.lock().await;

		match loaded.as_deref() {
			Some(current) if current == key => {
				if let Some(session) = self.registry.get(key) {
					if session.is_exited() {
						// Dead child; reclaim so the next playlist restarts it.
						self.supervisor.stop(&session).await;
					}
				}
			}
			Some(previous) => {
				let previous = previous.to_string();
				tracing::info!(from = %previous, to = %key, "switching loaded asset");
				*loaded = Some(key.to_string());
				drop(loaded);
				self.abort_key(&previous).await;
			}
			None => {
				tracing::info!(%key, "loading asset");
				*loaded = Some(key.to_string());
			}
		}

		Ok(())
	}

	/// Probe the asset. Side effect: the asset becomes the loaded one.
	pub async fn info(&self, key: &str) -> Result<Arc<crate::ProbeRecord>> {
		self.load(key).await?;
		self.probe(key).await
	}

	pub async fn probe(&self, key: &str) -> Result<Arc<crate::ProbeRecord>> {
		self.prober.probe(key, self.cache.complete_local(key)).await
	}

	/// Current playlist bytes for the asset, creating the session if needed
	/// and gating on initial segments.
	pub async fn playlist(&self, key: &str, options: TranscodeOptions) -> Result<Vec<u8>> {
		self.load(key).await?;

		let session = self.supervisor.start(key, options).await?;
		session.wait_ready().await;

		read_playlist(&session.workdir).await
	}

	/// Resolve `segment<NNN>.ts` / `thumb<NNN>.jpg` to a path inside the
	/// session's working directory.
	pub fn artifact(&self, key: &str, name: &str) -> Result<Artifact> {
		if let Some(index) = transcode::parse_segment_name(name) {
			return Ok(Artifact::Segment(self.session(key)?.segment_path(index)));
		}
		if let Some(index) = transcode::parse_thumb_name(name) {
			return Ok(Artifact::Thumbnail(self.session(key)?.thumb_path(index)));
		}

		Err(Error::InvalidRequest(format!("bad artifact name: {name}")))
	}

	/// All thumbnail slots for the asset, with bytes for the ones already on
	/// disk. Without a session every slot is still listed, data pending.
	pub async fn thumbnails(&self, key: &str) -> Result<Vec<Thumbnail>> {
		let probe = self.probe(key).await?;
		let session = self.registry.get(key);

		let seg = session
			.as_ref()
			.map(|session| session.options.segment_duration)
			.unwrap_or(self.config.segment_duration)
			.max(1);
		let expected = thumbnail_cap(probe.duration, seg).unwrap_or(0) as usize;

		let mut thumbnails = Vec::with_capacity(expected);
		for index in 0..expected {
			let bytes = match &session {
				Some(session) => tokio::fs::read(session.thumb_path(index)).await.ok(),
				None => None,
			};

			thumbnails.push(Thumbnail {
				index,
				time: index as f64 * seg as f64 + seg as f64 / 2.0,
				bytes: bytes.map(Bytes::from),
			});
		}

		Ok(thumbnails)
	}

	/// RMS waveform, memoized per (key, buckets, merged-pair).
	pub async fn waveform(&self, key: &str, buckets: usize) -> Result<Arc<Waveform>> {
		let probe = self.probe(key).await?;
		let combined = probe
			.stereo_pair
			.as_ref()
			.map(|pair| pair.compatible)
			.unwrap_or(false);

		if let Some(hit) = self.analyses.waveform(key, buckets, combined) {
			return Ok(hit);
		}

		let input = self.analysis_input(key).await?;
		let waveform =
			Arc::new(analysis::extract_waveform(&self.binaries, &input, &probe, buckets).await?);

		self.analyses.store_waveform(key, buckets, combined, waveform.clone());
		Ok(waveform)
	}

	/// EBU R128 loudness over a window, memoized per (key, start, duration).
	pub async fn loudness(&self, key: &str, start: f64, duration: f64) -> Result<LoudnessWindow> {
		if let Some(hit) = self.analyses.loudness(key, start, duration) {
			return Ok(hit);
		}

		let probe = self.probe(key).await?;
		let input = self.analysis_input(key).await?;
		let window =
			analysis::extract_loudness(&self.binaries, &input, &probe, start, duration).await?;

		self.analyses.store_loudness(key, start, duration, window);
		Ok(window)
	}

	/// One chunk of the source as a fragmented MP4 with burned-in timecode.
	pub async fn stream(&self, key: &str, start: f64, duration: f64) -> Result<Bytes> {
		let input = if self.cache.enabled() {
			let path = self.cache.ensure(key, Some(start + duration)).await?;
			path.to_string_lossy().into_owned()
		} else {
			self.store.signed_url(key).await?
		};

		transcode::mp4_fragment(&self.binaries, self.config.encoder, &input, start, duration).await
	}

	/// Aggregate progress for the asset's pipeline.
	pub async fn progress(&self, key: &str) -> Progress {
		let session = self.registry.get(key);
		let fetch = self.cache.progress(key);

		if let Some(session) = &session {
			// A session that reached readiness stays ready even after its
			// child finished; the artifacts are what matters.
			if session.is_ready() {
				return Progress {
					status: ProgressStatus::Ready,
					message: "stream ready".to_string(),
					download_progress: 100.0,
					processing_progress: 100.0,
					overall_progress: 100,
					estimated_time_remaining: Some(0.0),
					ready: true,
				};
			}

			if session.is_exited() {
				return Progress {
					status: ProgressStatus::Error,
					message: "transcoder exited before readiness".to_string(),
					download_progress: 0.0,
					processing_progress: 0.0,
					overall_progress: 0,
					estimated_time_remaining: None,
					ready: false,
				};
			}

			let (processing, remaining) = self.processing_progress(session).await;
			return Progress {
				status: ProgressStatus::Processing,
				message: "transcoding preview".to_string(),
				download_progress: 100.0,
				processing_progress: processing,
				overall_progress: overall(ProgressStatus::Processing, 100.0, processing),
				estimated_time_remaining: remaining,
				ready: false,
			};
		}

		if let Some(fetch) = fetch {
			if !fetch.complete {
				let download = fetch
					.total
					.filter(|total| *total > 0)
					.map(|total| fetch.bytes as f64 * 100.0 / total as f64)
					.unwrap_or(0.0);

				let remaining = fetch.total.and_then(|total| {
					let elapsed = fetch.started_at.elapsed().ok()?.as_secs_f64();
					if fetch.bytes == 0 || elapsed <= 0.0 {
						return None;
					}
					let rate = fetch.bytes as f64 / elapsed;
					Some((total.saturating_sub(fetch.bytes)) as f64 / rate)
				});

				return Progress {
					status: ProgressStatus::Downloading,
					message: "downloading source".to_string(),
					download_progress: download,
					processing_progress: 0.0,
					overall_progress: overall(ProgressStatus::Downloading, download, 0.0),
					estimated_time_remaining: remaining,
					ready: false,
				};
			}

			return Progress {
				status: ProgressStatus::Downloaded,
				message: "source cached".to_string(),
				download_progress: 100.0,
				processing_progress: 0.0,
				overall_progress: 50,
				estimated_time_remaining: None,
				ready: false,
			};
		}

		let status = if self.loaded.lock().await.as_deref() == Some(key) {
			ProgressStatus::Starting
		} else {
			ProgressStatus::Initializing
		};

		Progress {
			status,
			message: "no pipeline activity yet".to_string(),
			download_progress: 0.0,
			processing_progress: 0.0,
			overall_progress: 0,
			estimated_time_remaining: None,
			ready: false,
		}
	}

	/// Abort one key's transcoder and download; the loaded key is untouched
	/// so a subsequent playlist request restarts cleanly.
	pub async fn abort(&self, key: &str) {
		self.abort_key(key).await;
	}

	/// Abort everything and return to idle.
	pub async fn abort_all(&self) -> usize {
		let mut loaded = self.loaded.lock().await;
		*loaded = None;
		drop(loaded);

		let sessions = self.registry.list();
		let mut count = sessions.len();

		for session in &sessions {
			self.supervisor.stop(session).await;
			self.analyses.purge(&session.key);
		}

		count += self.cache.abort_all();
		tracing::info!(count, "aborted all pipelines");
		count
	}

	/// Object listing for the review UI.
	pub async fn list(&self, prefix: Option<&str>) -> Result<Vec<crate::ObjectEntry>> {
		self.store.list(prefix).await
	}

	async fn abort_key(&self, key: &str) {
		if let Some(session) = self.registry.get(key) {
			self.supervisor.stop(&session).await;
		}

		self.cache.abort(key);
		self.analyses.purge(key);
	}

	fn session(&self, key: &str) -> Result<Arc<Session>> {
		self.registry.get(key).ok_or(Error::NotFound)
	}

	async fn analysis_input(&self, key: &str) -> Result<String> {
		if let Some(path) = self.cache.complete_local(key) {
			return Ok(path.to_string_lossy().into_owned());
		}

		self.store.signed_url(key).await
	}

	/// Processing percentage from the playlist on disk against the expected
	/// segment count.
	async fn processing_progress(&self, session: &Arc<Session>) -> (f64, Option<f64>) {
		let expected = match self.prober.probe(&session.key, self.cache.complete_local(&session.key)).await {
			Ok(probe) => thumbnail_cap(probe.duration, session.options.segment_duration.max(1)),
			Err(_) => None,
		};

		let Some(expected) = expected.filter(|expected| *expected > 0) else {
			return (0.0, None);
		};

		let done = match read_playlist(&session.workdir).await {
			Ok(bytes) if !bytes.is_empty() => match m3u8_rs::parse_media_playlist(&bytes) {
				Ok((_, playlist)) => playlist.segments.len() as u64,
				Err(_) => readiness::contiguous_segments(&session.workdir).await as u64,
			},
			_ => 0,
		};

		let percent = (done as f64 * 100.0 / expected as f64).min(100.0);

		let remaining = if done > 0 {
			let elapsed = session.started_at.elapsed().as_secs_f64();
			Some(elapsed / done as f64 * expected.saturating_sub(done) as f64)
		} else {
			None
		};

		(percent, remaining)
	}
}

/// Read the playlist, preferring the atomic-rename temp name when the
/// transcoder is mid-rewrite. An absent playlist serves as empty; event
/// playlist clients poll again.
async fn read_playlist(workdir: &Path) -> Result<Vec<u8>> {
	if let Ok(bytes) = tokio::fs::read(workdir.join("playlist.m3u8.tmp")).await {
		return Ok(bytes);
	}

	match tokio::fs::read(workdir.join("playlist.m3u8")).await {
		Ok(bytes) => Ok(bytes),
		Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
		Err(err) => Err(err.into()),
	}
}

/// Overall percentage: the download owns the first half, the transcode the
/// second.
fn overall(status: ProgressStatus, download: f64, processing: f64) -> u32 {
	match status {
		ProgressStatus::Downloading => (download * 0.5).round() as u32,
		ProgressStatus::Downloaded => 50,
		ProgressStatus::Processing => (50.0 + processing * 0.5).round() as u32,
		ProgressStatus::Ready => 100,
		_ => 0,
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn overall_progress_halves() {
		assert_eq!(overall(ProgressStatus::Downloading, 0.0, 0.0), 0);
		assert_eq!(overall(ProgressStatus::Downloading, 60.0, 0.0), 30);
		assert_eq!(overall(ProgressStatus::Downloaded, 100.0, 0.0), 50);
		assert_eq!(overall(ProgressStatus::Processing, 100.0, 40.0), 70);
		assert_eq!(overall(ProgressStatus::Ready, 100.0, 100.0), 100);
		assert_eq!(overall(ProgressStatus::Initializing, 0.0, 0.0), 0);
	}

	#[tokio::test]
	async fn missing_playlist_serves_empty() {
		let dir = tempfile::tempdir().unwrap();
		let bytes = read_playlist(dir.path()).await.unwrap();
		assert!(bytes.is_empty());
	}

	#[tokio::test]
	async fn tmp_playlist_preferred_over_final() {
		let dir = tempfile::tempdir().unwrap();
		std::fs::write(dir.path().join("playlist.m3u8"), b"#old").unwrap();
		std::fs::write(dir.path().join("playlist.m3u8.tmp"), b"#new").unwrap();

		let bytes = read_playlist(dir.path()).await.unwrap();
		assert_eq!(bytes, b"#new");
	}
}
