use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};

use futures::StreamExt;
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;

use crate::{Config, Error, ObjectStore, Prober, Result, SessionRegistry};

/// Waiters are woken once this many new bytes have landed on disk.
const SIGNAL_BYTES: u64 = 1024 * 1024;

/// How long a progressive waiter polls the signal before falling back to
/// waiting for full completion.
const PROGRESSIVE_WAIT: Duration = Duration::from_secs(30);

/// A download making no progress for this long is dead.
const STALL_TIMEOUT: Duration = Duration::from_secs(300);

/// Safety buffer applied to the `need_secs → bytes` conversion, covering
/// decoder lookahead and bitrate variance. Fixed, not tunable.
const NEED_SECS_BUFFER: f64 = 2.0;

/// Eviction drains to this fraction of the budget so each pass buys headroom.
const EVICT_LOW_WATER: f64 = 0.8;

/// A "complete" file may differ from the reported total by this much.
const SIZE_TOLERANCE: u64 = 1024;

/// Consecutive disk failures after which local caching is disabled for the
/// rest of the process; signed URLs carry everything from then on.
const DISK_FAILURE_LIMIT: u32 = 3;

/// One source file resident on disk.
#[derive(Clone, Debug)]
pub struct CacheEntry {
	pub path: PathBuf,
	pub size: u64,
	pub total: Option<u64>,
	pub partial: bool,
	pub started_at: SystemTime,
	pub last_access: Instant,
}

/// Progress of a source download, complete or in flight.
#[derive(Clone, Debug)]
pub struct FetchProgress {
	pub bytes: u64,
	pub total: Option<u64>,
	pub complete: bool,
	pub started_at: SystemTime,
}

#[derive(Clone, Debug, Default)]
struct DownloadState {
	bytes: u64,
	total: Option<u64>,
	finished: Option<Result<()>>,
}

struct Download {
	state: Arc<watch::Sender<DownloadState>>,
	task: tokio::task::JoinHandle<()>,
	started_at: SystemTime,
}

/// Progressive local cache of source objects.
///
/// At most one download task runs per key. Waiters subscribe to the task's
/// watch channel and resolve as soon as enough bytes exist for their
/// playback window; the task keeps running to EOF behind them.
#[derive(Clone)]
pub struct SourceCache {
	inner: Arc<CacheInner>,
}

struct CacheInner {
	dir: PathBuf,
	budget: u64,
	enabled: AtomicBool,
	disk_failures: AtomicU32,
	store: Arc<ObjectStore>,
	prober: Arc<Prober>,
	registry: SessionRegistry,

	// Lock order: registry → entries → downloads.
	entries: Mutex<HashMap<String, CacheEntry>>,
	downloads: Mutex<HashMap<String, Download>>,

	/// Single-flight guard: eviction passes never run concurrently.
	evicting: tokio::sync::Mutex<()>,
}

impl SourceCache {
	pub fn new(
		config: &Config,
		store: Arc<ObjectStore>,
		prober: Arc<Prober>,
		registry: SessionRegistry,
	) -> Self {
		Self {
			inner: Arc::new(CacheInner {
				dir: config.cache_dir.clone(),
				budget: config.cache_budget,
				enabled: AtomicBool::new(!config.no_local_cache),
				disk_failures: AtomicU32::new(0),
				store,
				prober,
				registry,
				entries: Mutex::new(HashMap::new()),
				downloads: Mutex::new(HashMap::new()),
				evicting: tokio::sync::Mutex::new(()),
			}),
		}
	}

	pub fn enabled(&self) -> bool {
		self.inner.enabled.load(Ordering::Relaxed)
	}

	/// Deterministic local path for a key: sha256 of the key plus the
	/// original extension, flat in the cache directory.
	pub fn local_path(&self, key: &str) -> PathBuf {
		let digest = Sha256::digest(key.as_bytes());
		self.inner
			.dir
			.join(format!("{}{}", hex::encode(digest), extension(key)))
	}

	/// Snapshot of the cache entry for a key, if any.
	pub fn entry(&self, key: &str) -> Option<CacheEntry> {
		self.inner.entries.lock().unwrap().get(key).cloned()
	}

	/// The local path when the file is fully downloaded.
	pub fn complete_local(&self, key: &str) -> Option<PathBuf> {
		self.entry(key)
			.filter(|entry| !entry.partial)
			.map(|entry| entry.path)
	}

	/// Return a local path holding at least `need_secs` of decodable content
	/// from the start of the source, or the complete file when `need_secs`
	/// is absent. Starts or joins the download task as needed.
	pub async fn ensure(&self, key: &str, need_secs: Option<f64>) -> Result<PathBuf> {
		let path = self.local_path(key);

		if let Some(entry) = self.entry(key) {
			if !entry.partial {
				self.touch(key);
				return Ok(entry.path);
			}
		}

		match need_secs {
			None => self.wait_complete(key, &path).await,
			Some(need) => self.wait_progressive(key, &path, need).await,
		}
	}

	/// Download progress for a key: the live task if one runs, the resident
	/// entry otherwise.
	pub fn progress(&self, key: &str) -> Option<FetchProgress> {
		let entry = self.entry(key);

		if let Some(entry) = &entry {
			if !entry.partial {
				return Some(FetchProgress {
					bytes: entry.size,
					total: entry.total.or(Some(entry.size)),
					complete: true,
					started_at: entry.started_at,
				});
			}
		}

		let downloads = self.inner.downloads.lock().unwrap();
		if let Some(download) = downloads.get(key) {
			let state = download.state.borrow();
			return Some(FetchProgress {
				bytes: state.bytes,
				total: state.total,
				complete: false,
				started_at: download.started_at,
			});
		}

		entry.map(|entry| FetchProgress {
			bytes: entry.size,
			total: entry.total,
			complete: false,
			started_at: entry.started_at,
		})
	}

	/// Cancel the download task for a key, waking its waiters.
	/// The partial file stays on disk; a later `ensure` resumes it.
	pub fn abort(&self, key: &str) -> bool {
		let download = self.inner.downloads.lock().unwrap().remove(key);
		let Some(download) = download else {
			return false;
		};

		let bytes = download.state.borrow().bytes;
		download.state.send_modify(|state| {
			if state.finished.is_none() {
				state.finished = Some(Err(Error::Cancelled));
			}
		});
		download.task.abort();

		// Record how far we got; a later ensure resumes from here.
		if let Some(entry) = self.inner.entries.lock().unwrap().get_mut(key) {
			if entry.partial {
				entry.size = entry.size.max(bytes);
			}
		}

		tracing::debug!(key, "download aborted");
		true
	}

	pub fn abort_all(&self) -> usize {
		let keys: Vec<String> = self.inner.downloads.lock().unwrap().keys().cloned().collect();
		keys.iter().filter(|key| self.abort(key)).count()
	}

	/// Bring total cached bytes back under the budget, deleting complete
	/// files in last-accessed order. Files that are partial or back an
	/// active session are never evicted.
	pub async fn evict(&self) -> u64 {
		let _flight = self.inner.evicting.lock().await;

		// Session keys are gathered before the cache lock; the registry
		// always comes first in the lock order.
		let protected: HashSet<String> = self.inner.registry.keys().into_iter().collect();

		let entries: Vec<(String, CacheEntry)> = {
			let entries = self.inner.entries.lock().unwrap();
			entries.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
		};
		let live: HashMap<String, u64> = {
			let downloads = self.inner.downloads.lock().unwrap();
			downloads
				.iter()
				.map(|(k, d)| (k.clone(), d.state.borrow().bytes))
				.collect()
		};

		let victims = plan_eviction(&entries, &live, &protected, self.inner.budget);
		let mut freed = 0;

		for key in victims {
			// Re-check under the lock; the entry may have changed since the plan.
			let removed = {
				let mut entries = self.inner.entries.lock().unwrap();
				match entries.get(&key) {
					Some(entry) if !entry.partial => entries.remove(&key),
					_ => None,
				}
			};

			if let Some(entry) = removed {
				if let Err(err) = tokio::fs::remove_file(&entry.path).await {
					tracing::warn!(key, %err, "failed to evict cached source");
					continue;
				}
				freed += entry.size;
				tracing::info!(key, bytes = entry.size, "evicted cached source");
			}
		}

		freed
	}

	/// Total bytes currently attributed to the cache.
	pub fn total_bytes(&self) -> u64 {
		let entries = self.inner.entries.lock().unwrap();
		entries.values().map(|entry| entry.size).sum()
	}

	fn touch(&self, key: &str) {
		if let Some(entry) = self.inner.entries.lock().unwrap().get_mut(key) {
			entry.last_access = Instant::now();
		}
	}

	async fn wait_complete(&self, key: &str, path: &Path) -> Result<PathBuf> {
		let mut state = self.subscribe_or_start(key, path);
		wait_finished(&mut state).await?;
		self.touch(key);
		Ok(path.to_path_buf())
	}

	async fn wait_progressive(&self, key: &str, path: &Path, need_secs: f64) -> Result<PathBuf> {
		let probe = self.inner.prober.probe(key, self.complete_local(key)).await?;
		let bitrate = probe.bitrate();

		let mut state = self.subscribe_or_start(key, path);

		let progressive = async {
			loop {
				let (bytes, total, finished) = {
					let state = state.borrow_and_update();
					(state.bytes, state.total, state.finished.clone())
				};

				if let Some(finished) = finished {
					return finished;
				}
				if bytes >= required_bytes(need_secs, bitrate, total) {
					return Ok(());
				}
				if state.changed().await.is_err() {
					return Err(Error::Cancelled);
				}
			}
		};

		match tokio::time::timeout(PROGRESSIVE_WAIT, progressive).await {
			Ok(result) => result?,
			Err(_) => {
				// Not enough bytes arrived in time; wait for the whole file.
				tracing::debug!(key, "progressive wait timed out, waiting for completion");
				wait_finished(&mut state).await?;
			}
		}

		self.touch(key);
		Ok(path.to_path_buf())
	}

	/// Subscribe to the download task for a key, spawning one if absent.
	fn subscribe_or_start(&self, key: &str, path: &Path) -> watch::Receiver<DownloadState> {
		{
			let mut entries = self.inner.entries.lock().unwrap();
			entries.entry(key.to_string()).or_insert_with(|| CacheEntry {
				path: path.to_path_buf(),
				size: 0,
				total: None,
				partial: true,
				started_at: SystemTime::now(),
				last_access: Instant::now(),
			});
		}

		let mut downloads = self.inner.downloads.lock().unwrap();
		if let Some(download) = downloads.get(key) {
			return download.state.subscribe();
		}

		let state = Arc::new(watch::Sender::new(DownloadState::default()));
		let receiver = state.subscribe();

		let task = tokio::spawn(
			self.clone()
				.run_download(key.to_string(), path.to_path_buf(), state.clone()),
		);

		downloads.insert(
			key.to_string(),
			Download {
				state,
				task,
				started_at: SystemTime::now(),
			},
		);

		tracing::info!(key, "download started");
		receiver
	}

	async fn run_download(self, key: String, path: PathBuf, state: Arc<watch::Sender<DownloadState>>) {
		let result = self.download(&key, &path, &state).await;

		match &result {
			Ok(size) => {
				let mut entries = self.inner.entries.lock().unwrap();
				if let Some(entry) = entries.get_mut(&key) {
					entry.size = *size;
					entry.total = entry.total.or(Some(*size));
					entry.partial = false;
					entry.last_access = Instant::now();
				}
				drop(entries);

				self.inner.disk_failures.store(0, Ordering::Relaxed);
				tracing::info!(key, bytes = size, "download complete");
			}
			Err(err) => {
				// A failed download leaves nothing usable behind.
				let _ = tokio::fs::remove_file(&path).await;
				self.inner.entries.lock().unwrap().remove(&key);

				if matches!(err, Error::Io(_)) {
					let failures = self.inner.disk_failures.fetch_add(1, Ordering::Relaxed) + 1;
					if failures >= DISK_FAILURE_LIMIT
						&& self.inner.enabled.swap(false, Ordering::Relaxed)
					{
						tracing::error!("disabling local cache after repeated disk failures");
					}
				}

				tracing::warn!(key, %err, "download failed");
			}
		}

		let finished = result.as_ref().map(|_| ()).map_err(Error::clone);
		state.send_modify(|state| {
			if state.finished.is_none() {
				state.finished = Some(finished);
			}
		});

		self.inner.downloads.lock().unwrap().remove(&key);

		if result.is_ok() {
			self.evict().await;
		}
	}

	async fn download(
		&self,
		key: &str,
		path: &Path,
		state: &watch::Sender<DownloadState>,
	) -> Result<u64> {
		let url = self.inner.store.signed_url(key).await?;
		let offset = tokio::fs::metadata(path).await.map(|meta| meta.len()).unwrap_or(0);

		let response = self.inner.store.fetch(&url, offset).await?;
		let resumed = offset > 0 && response.status().as_u16() == 206;

		let total = response
			.content_length()
			.map(|len| if resumed { offset + len } else { len });

		let mut have = if resumed { offset } else { 0 };

		state.send_modify(|state| {
			state.bytes = have;
			state.total = total;
		});
		if let Some(total) = total {
			if let Some(entry) = self.inner.entries.lock().unwrap().get_mut(key) {
				entry.total = Some(total);
			}
		}

		let mut file = if resumed {
			tokio::fs::OpenOptions::new().append(true).open(path).await?
		} else {
			if let Some(parent) = path.parent() {
				tokio::fs::create_dir_all(parent).await?;
			}
			tokio::fs::File::create(path).await?
		};

		let mut stream = response.bytes_stream();
		let mut last_signal = have;

		loop {
			let next = tokio::time::timeout(STALL_TIMEOUT, stream.next())
				.await
				.map_err(|_| Error::Timeout)?;

			let Some(chunk) = next else { break };
			let chunk = chunk?;

			file.write_all(&chunk).await?;
			have += chunk.len() as u64;

			if have - last_signal >= SIGNAL_BYTES {
				last_signal = have;
				state.send_modify(|state| state.bytes = have);
			}
		}

		file.flush().await?;

		if let Some(total) = total {
			if have + SIZE_TOLERANCE < total {
				return Err(Error::SourceUnavailable(format!(
					"short read: {have} of {total} bytes"
				)));
			}
		}

		state.send_modify(|state| state.bytes = have);
		Ok(have)
	}
}

async fn wait_finished(state: &mut watch::Receiver<DownloadState>) -> Result<()> {
	loop {
		if let Some(finished) = state.borrow_and_update().finished.clone() {
			return finished;
		}
		if state.changed().await.is_err() {
			return Err(Error::Cancelled);
		}
	}
}

/// Bytes required on disk before `need_secs` of content can be decoded.
fn required_bytes(need_secs: f64, bitrate: u64, total: Option<u64>) -> u64 {
	let needed = (need_secs * bitrate as f64 / 8.0 * NEED_SECS_BUFFER) as u64;
	match total {
		Some(total) => needed.min(total),
		None => needed,
	}
}

/// Decide which keys to delete, in last-accessed order, to get back under
/// the budget.
fn plan_eviction(
	entries: &[(String, CacheEntry)],
	live: &HashMap<String, u64>,
	protected: &HashSet<String>,
	budget: u64,
) -> Vec<String> {
	let mut total: u64 = entries
		.iter()
		.map(|(key, entry)| {
			if entry.partial {
				live.get(key).copied().unwrap_or(entry.size)
			} else {
				entry.size
			}
		})
		.sum();

	if total <= budget {
		return Vec::new();
	}

	let target = (budget as f64 * EVICT_LOW_WATER) as u64;

	let mut candidates: Vec<&(String, CacheEntry)> = entries
		.iter()
		.filter(|(key, entry)| !entry.partial && !protected.contains(key))
		.collect();
	candidates.sort_by_key(|(_, entry)| entry.last_access);

	let mut victims = Vec::new();
	for (key, entry) in candidates {
		if total <= target {
			break;
		}
		total = total.saturating_sub(entry.size);
		victims.push(key.clone());
	}

	victims
}

fn extension(key: &str) -> String {
	Path::new(key)
		.extension()
		.and_then(|ext| ext.to_str())
		.map(|ext| format!(".{ext}"))
		.unwrap_or_default()
}

#[cfg(test)]
mod tests {
	use super::*;

	const MIB: u64 = 1024 * 1024;

	fn entry(size: u64, partial: bool, age: Duration) -> CacheEntry {
		CacheEntry {
			path: "/tmp/unused".into(),
			size,
			total: Some(size),
			partial,
			started_at: SystemTime::now(),
			last_access: Instant::now().checked_sub(age).unwrap(),
		}
	}

	#[test]
	fn extension_is_preserved() {
		assert_eq!(extension("folder/tape.mxf"), ".mxf");
		assert_eq!(extension("clip.MP4"), ".MP4");
		assert_eq!(extension("no-extension"), "");
	}

	#[test]
	fn required_bytes_applies_fixed_buffer() {
		// 10 s at 8 Mbit/s is 10 MB; doubled by the safety buffer.
		assert_eq!(required_bytes(10.0, 8_000_000, None), 20_000_000);
	}

	#[test]
	fn required_bytes_caps_at_total() {
		assert_eq!(required_bytes(10.0, 8_000_000, Some(15_000_000)), 15_000_000);
	}

	#[test]
	fn eviction_noop_under_budget() {
		let entries = vec![("a".to_string(), entry(40 * MIB, false, Duration::ZERO))];
		let victims = plan_eviction(&entries, &HashMap::new(), &HashSet::new(), 100 * MIB);
		assert!(victims.is_empty());
	}

	#[test]
	fn eviction_removes_least_recently_accessed_first() {
		// Two complete 60 MiB files plus a fresh 60 MiB download blow a
		// 100 MiB budget; the stalest file goes, leaving ≤ 80 MiB.
		let entries = vec![
			("old".to_string(), entry(60 * MIB, false, Duration::from_secs(600))),
			("new".to_string(), entry(60 * MIB, false, Duration::from_secs(10))),
			("incoming".to_string(), entry(60 * MIB, true, Duration::ZERO)),
		];

		let live = HashMap::from([("incoming".to_string(), 20 * MIB)]);
		let victims = plan_eviction(&entries, &live, &HashSet::new(), 100 * MIB);

		// 140 MiB resident; evicting the stalest file reaches the 80 MiB
		// low-water mark, so the fresher file survives.
		assert_eq!(victims, vec!["old".to_string()]);
	}

	#[test]
	fn eviction_spares_partial_and_session_backed() {
		let entries = vec![
			("downloading".to_string(), entry(90 * MIB, true, Duration::from_secs(900))),
			("playing".to_string(), entry(60 * MIB, false, Duration::from_secs(600))),
			("idle".to_string(), entry(60 * MIB, false, Duration::from_secs(60))),
		];

		let protected = HashSet::from(["playing".to_string()]);
		let victims = plan_eviction(&entries, &HashMap::new(), &protected, 100 * MIB);

		assert_eq!(victims, vec!["idle".to_string()]);
	}

	#[test]
	fn eviction_stops_at_low_water() {
		let entries = vec![
			("a".to_string(), entry(30 * MIB, false, Duration::from_secs(300))),
			("b".to_string(), entry(30 * MIB, false, Duration::from_secs(200))),
			("c".to_string(), entry(30 * MIB, false, Duration::from_secs(100))),
			("d".to_string(), entry(30 * MIB, false, Duration::from_secs(50))),
		];

		// 120 MiB resident, 100 MiB budget: one eviction reaches 90 ≥ 80,
		// a second reaches 60 ≤ 80 and stops.
		let victims = plan_eviction(&entries, &HashMap::new(), &HashSet::new(), 100 * MIB);
		assert_eq!(victims, vec!["a".to_string(), "b".to_string()]);
	}
}
