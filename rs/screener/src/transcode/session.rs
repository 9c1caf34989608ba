use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::sync::watch;

use super::TranscodeOptions;

/// Lifecycle flags for one live transcode.
#[derive(Clone, Copy, Debug, Default)]
pub struct SessionState {
	/// Enough initial segments exist to start playback.
	pub ready: bool,

	/// The child process has been reaped.
	pub exited: bool,
}

/// One asset currently being transcoded.
///
/// The session does not own the local cache entry for its key; it must
/// tolerate the source file being absent or only partially downloaded.
pub struct Session {
	pub key: String,
	pub workdir: PathBuf,
	pub options: TranscodeOptions,
	pub started_at: Instant,

	state: watch::Sender<SessionState>,
	abort: watch::Sender<bool>,
	deletion_pending: AtomicBool,
}

impl Session {
	pub fn new(key: &str, workdir: PathBuf, options: TranscodeOptions) -> Arc<Self> {
		Arc::new(Self {
			key: key.to_string(),
			workdir,
			options,
			started_at: Instant::now(),
			state: watch::Sender::new(SessionState::default()),
			abort: watch::Sender::new(false),
			deletion_pending: AtomicBool::new(false),
		})
	}

	pub fn playlist_path(&self) -> PathBuf {
		self.workdir.join("playlist.m3u8")
	}

	pub fn segment_path(&self, index: usize) -> PathBuf {
		self.workdir.join(segment_name(index))
	}

	pub fn thumb_path(&self, index: usize) -> PathBuf {
		self.workdir.join(thumb_name(index))
	}

	/// Resolves once the readiness gate has fired, including on its timeout.
	pub async fn wait_ready(&self) {
		let mut state = self.state.subscribe();
		while !state.borrow_and_update().ready {
			if state.changed().await.is_err() {
				return;
			}
		}
	}

	/// Wait for the child process to be reaped.
	pub async fn wait_exit(&self) {
		let mut state = self.state.subscribe();
		while !state.borrow_and_update().exited {
			if state.changed().await.is_err() {
				return;
			}
		}
	}

	pub fn is_ready(&self) -> bool {
		self.state.borrow().ready
	}

	pub fn is_exited(&self) -> bool {
		self.state.borrow().exited
	}

	pub(crate) fn set_ready(&self) {
		self.state.send_modify(|state| state.ready = true);
	}

	pub(crate) fn set_exited(&self) {
		self.state.send_modify(|state| state.exited = true);
	}

	/// Ask the supervisor task to stop the child.
	pub fn request_abort(&self) {
		self.abort.send_replace(true);
	}

	pub(crate) fn abort_signal(&self) -> watch::Receiver<bool> {
		self.abort.subscribe()
	}

	/// Workdir removal was skipped because the child still held handles;
	/// the next abort retries it.
	pub(crate) fn set_deletion_pending(&self, pending: bool) {
		self.deletion_pending.store(pending, Ordering::Relaxed);
	}

	pub(crate) fn deletion_pending(&self) -> bool {
		self.deletion_pending.load(Ordering::Relaxed)
	}
}

/// The authoritative map of keys with playable artifacts on disk.
#[derive(Clone, Default)]
pub struct SessionRegistry {
	sessions: Arc<Mutex<HashMap<String, Arc<Session>>>>,
}

impl SessionRegistry {
	pub fn get(&self, key: &str) -> Option<Arc<Session>> {
		self.sessions.lock().unwrap().get(key).cloned()
	}

	pub fn put(&self, session: Arc<Session>) -> Option<Arc<Session>> {
		self.sessions
			.lock()
			.unwrap()
			.insert(session.key.clone(), session)
	}

	/// Remove the session for a key. The caller owns teardown.
	pub fn evict(&self, key: &str) -> Option<Arc<Session>> {
		self.sessions.lock().unwrap().remove(key)
	}

	/// Remove a key only if it still maps to this exact session.
	pub fn evict_if(&self, session: &Arc<Session>) -> bool {
		let mut sessions = self.sessions.lock().unwrap();
		match sessions.get(&session.key) {
			Some(current) if Arc::ptr_eq(current, session) => {
				sessions.remove(&session.key);
				true
			}
			_ => false,
		}
	}

	pub fn list(&self) -> Vec<Arc<Session>> {
		self.sessions.lock().unwrap().values().cloned().collect()
	}

	pub fn keys(&self) -> Vec<String> {
		self.sessions.lock().unwrap().keys().cloned().collect()
	}
}

/// Per-key working directory under the cache root.
pub fn workdir(cache_dir: &Path, key: &str) -> PathBuf {
	cache_dir.join("live-hls").join(sanitize(key))
}

/// Replace anything outside `[A-Za-z0-9._-]` with `_`, collapsing runs.
pub fn sanitize(key: &str) -> String {
	let mut out = String::with_capacity(key.len());
	let mut last_underscore = false;

	for c in key.chars() {
		let c = if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
			c
		} else {
			'_'
		};

		if c == '_' {
			if last_underscore {
				continue;
			}
			last_underscore = true;
		} else {
			last_underscore = false;
		}

		out.push(c);
	}

	out
}

pub fn segment_name(index: usize) -> String {
	format!("segment{index:03}.ts")
}

pub fn thumb_name(index: usize) -> String {
	format!("thumb{index:03}.jpg")
}

/// Parse `segment<NNN>.ts`, rejecting anything malformed.
pub fn parse_segment_name(name: &str) -> Option<usize> {
	parse_indexed(name, "segment", ".ts")
}

/// Parse `thumb<NNN>.jpg`, rejecting anything malformed.
pub fn parse_thumb_name(name: &str) -> Option<usize> {
	parse_indexed(name, "thumb", ".jpg")
}

fn parse_indexed(name: &str, prefix: &str, suffix: &str) -> Option<usize> {
	let digits = name.strip_prefix(prefix)?.strip_suffix(suffix)?;
	if digits.len() < 3 || !digits.bytes().all(|b| b.is_ascii_digit()) {
		return None;
	}
	digits.parse().ok()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn sanitize_replaces_and_collapses() {
		assert_eq!(sanitize("folder/My Tape #4.mxf"), "folder_My_Tape_4.mxf");
		assert_eq!(sanitize("a//b"), "a_b");
		assert_eq!(sanitize("clean-name_01.mp4"), "clean-name_01.mp4");
		assert_eq!(sanitize("å∂ß"), "_");
	}

	#[test]
	fn artifact_names_round_trip() {
		assert_eq!(segment_name(0), "segment000.ts");
		assert_eq!(segment_name(123), "segment123.ts");
		assert_eq!(parse_segment_name("segment007.ts"), Some(7));
		assert_eq!(parse_thumb_name("thumb042.jpg"), Some(42));

		assert_eq!(parse_segment_name("segment7.ts"), None);
		assert_eq!(parse_segment_name("segment00a.ts"), None);
		assert_eq!(parse_segment_name("thumb000.ts"), None);
		assert_eq!(parse_thumb_name("thumb000.jpeg"), None);
	}

	#[test]
	fn registry_round_trip() {
		let registry = SessionRegistry::default();
		let session = Session::new("tape.mxf", "/tmp/wd".into(), TranscodeOptions::default());

		assert!(registry.get("tape.mxf").is_none());
		registry.put(session.clone());
		assert!(registry.get("tape.mxf").is_some());
		assert_eq!(registry.keys(), vec!["tape.mxf".to_string()]);

		let evicted = registry.evict("tape.mxf").unwrap();
		assert!(Arc::ptr_eq(&evicted, &session));
		assert!(registry.get("tape.mxf").is_none());
	}

	#[test]
	fn evict_if_spares_replacements() {
		let registry = SessionRegistry::default();
		let old = Session::new("k", "/tmp/a".into(), TranscodeOptions::default());
		let new = Session::new("k", "/tmp/b".into(), TranscodeOptions::default());

		registry.put(old.clone());
		registry.put(new.clone());

		assert!(!registry.evict_if(&old));
		assert!(registry.get("k").is_some());
		assert!(registry.evict_if(&new));
		assert!(registry.get("k").is_none());
	}

	#[tokio::test]
	async fn ready_flag_wakes_waiters() {
		let session = Session::new("k", "/tmp/wd".into(), TranscodeOptions::default());

		let waiter = {
			let session = session.clone();
			tokio::spawn(async move { session.wait_ready().await })
		};

		session.set_ready();
		waiter.await.unwrap();
	}
}
