use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use regex::Regex;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};

use crate::{
	Binaries, Config, EncoderKind, Error, ObjectStore, Prober, Result, SourceCache,
};

use super::readiness;
use super::{
	Session, SessionRegistry, TranscodeInput, TranscodeOptions, hls_args, thumbnail_cap, workdir,
};

/// Segments that must exist before the playlist is exposed.
const READY_SEGMENTS: usize = 2;

/// Ceiling on the readiness wait.
const READY_TIMEOUT: Duration = Duration::from_secs(30);

/// Grace period between the quit request and SIGKILL.
const GRACEFUL_EXIT: Duration = Duration::from_secs(2);

/// Workdir removal after an abort waits for the child to release handles.
const WORKDIR_REMOVAL_DELAY: Duration = Duration::from_secs(5);

/// Finished sessions keep their artifacts around this long.
const SESSION_TTL: Duration = Duration::from_secs(3600);

/// Stderr lines retained for startup-failure diagnostics.
const STDERR_TAIL_LINES: usize = 40;

/// The download only has to be this far ahead before the transcoder starts;
/// enough for the readiness gate plus decoder lookahead.
const STARTUP_WINDOW_SEGMENTS: u32 = 3;

/// Owns the per-key transcoder children.
///
/// Each session is one logical task: the child process, its stderr parser
/// and the readiness poller live and die together.
pub struct Supervisor {
	cache_dir: PathBuf,
	binaries: Binaries,
	encoder: EncoderKind,
	store: Arc<ObjectStore>,
	prober: Arc<Prober>,
	cache: SourceCache,
	registry: SessionRegistry,

	/// Serializes session creation so one key never spawns two children.
	create: tokio::sync::Mutex<()>,
}

impl Supervisor {
	pub fn new(
		config: &Config,
		store: Arc<ObjectStore>,
		prober: Arc<Prober>,
		cache: SourceCache,
		registry: SessionRegistry,
	) -> Self {
		Self {
			cache_dir: config.cache_dir.clone(),
			binaries: config.binaries(),
			encoder: config.encoder,
			store,
			prober,
			cache,
			registry,
			create: tokio::sync::Mutex::new(()),
		}
	}

	pub fn registry(&self) -> &SessionRegistry {
		&self.registry
	}

	/// Return the live session for a key, spawning one when absent.
	///
	/// A session whose child died, or whose options differ from the request,
	/// is torn down and replaced.
	pub async fn start(&self, key: &str, options: TranscodeOptions) -> Result<Arc<Session>> {
		if let Some(session) = self.registry.get(key) {
			if session.options == options && !session.is_exited() {
				return Ok(session);
			}
		}

		let _create = self.create.lock().await;

		// Re-check: another request may have won the race.
		if let Some(session) = self.registry.get(key) {
			if session.options == options && !session.is_exited() {
				return Ok(session);
			}
			self.stop(&session).await;
		}

		self.spawn_session(key, options).await
	}

	/// Stop a session: graceful quit, SIGKILL escalation, deferred workdir
	/// removal. Already-exited sessions are reclaimed immediately.
	pub async fn stop(&self, session: &Arc<Session>) {
		if session.is_exited() {
			self.registry.evict_if(session);
			remove_workdir_if_stale(&self.registry, session).await;
			return;
		}

		session.request_abort();

		// The supervisor task performs the actual quit/kill sequence.
		let deadline = GRACEFUL_EXIT + Duration::from_secs(3);
		if tokio::time::timeout(deadline, session.wait_exit()).await.is_err() {
			tracing::warn!(key = %session.key, "transcoder did not exit in time");
		}
	}

	async fn spawn_session(&self, key: &str, options: TranscodeOptions) -> Result<Arc<Session>> {
		let workdir = workdir(&self.cache_dir, key);

		let _ = tokio::fs::remove_dir_all(&workdir).await;
		tokio::fs::create_dir_all(&workdir).await?;

		let input = self.select_input(key, &options).await?;
		let probe = self.prober.probe(key, self.cache.complete_local(key)).await?;

		if probe.video.is_none() {
			return Err(Error::TranscodeStartup("no video stream".to_string()));
		}

		let args = hls_args(&input, &probe, &options, self.encoder, &workdir);
		tracing::debug!(key, args = %args.join(" "), "spawning transcoder");

		let mut child = Command::new(&self.binaries.ffmpeg)
			.args(&args)
			.stdin(Stdio::piped())
			.stdout(Stdio::null())
			.stderr(Stdio::piped())
			.kill_on_drop(true)
			.spawn()
			.map_err(|err| Error::TranscodeStartup(format!("spawn: {err}")))?;

		let stdin = child.stdin.take();
		let stderr = child.stderr.take();

		let session = Session::new(key, workdir, options);
		let tail = Arc::new(Mutex::new(VecDeque::new()));

		// Install before readiness so concurrent requests join this child.
		self.registry.put(session.clone());

		let expected = thumbnail_cap(probe.duration, options.segment_duration.max(1));

		tokio::spawn(run_session(
			self.registry.clone(),
			session.clone(),
			child,
			stdin,
			stderr,
			tail.clone(),
			expected,
		));

		// Readiness, or an early death.
		tokio::select! {
			_ = session.wait_ready() => {}
			_ = session.wait_exit() => {}
		}

		if session.is_exited() && self.registry.get(key).is_none() {
			let tail = tail.lock().unwrap().iter().cloned().collect::<Vec<_>>().join("\n");
			return Err(Error::TranscodeStartup(tail));
		}

		Ok(session)
	}

	/// Pick the transcoder input: the local file when caching is enabled
	/// (growing files enter streaming mode), a signed URL otherwise.
	async fn select_input(&self, key: &str, options: &TranscodeOptions) -> Result<TranscodeInput> {
		if !self.cache.enabled() {
			return Ok(TranscodeInput::Remote(self.store.signed_url(key).await?));
		}

		let need = (STARTUP_WINDOW_SEGMENTS * options.segment_duration.max(1)) as f64;
		let path = self.cache.ensure(key, Some(need)).await?;

		match self.cache.entry(key) {
			Some(entry) if !entry.partial => Ok(TranscodeInput::Complete(path)),
			_ => Ok(TranscodeInput::Growing(path)),
		}
	}
}

/// The per-session supervisor task.
#[tracing::instrument("session", skip_all, fields(key = %session.key))]
async fn run_session(
	registry: SessionRegistry,
	session: Arc<Session>,
	mut child: Child,
	stdin: Option<ChildStdin>,
	stderr: Option<tokio::process::ChildStderr>,
	tail: Arc<Mutex<VecDeque<String>>>,
	expected_segments: Option<u64>,
) {
	let mut lines = stderr.map(|stderr| BufReader::new(stderr).lines());

	let gate = readiness::wait(
		&session.workdir,
		READY_SEGMENTS,
		READY_TIMEOUT,
		expected_segments,
	);
	tokio::pin!(gate);
	let mut gate_done = false;

	let mut abort = session.abort_signal();
	let mut aborted = false;

	let status = loop {
		tokio::select! {
			line = next_line(&mut lines) => {
				match line {
					Some(line) => scan_stderr(&line, &tail),
					None => lines = None,
				}
			}
			count = &mut gate, if !gate_done => {
				gate_done = true;
				session.set_ready();
				tracing::info!(segments = count, "session ready");
			}
			status = child.wait() => break status.ok(),
			_ = abort.changed(), if !aborted => {
				aborted = true;
				break stop_child(&mut child, stdin).await;
			}
		}
	};

	// Drain whatever stderr remains so the tail is complete.
	if let Some(lines) = &mut lines {
		while let Ok(Some(line)) = lines.next_line().await {
			scan_stderr(&line, &tail);
		}
	}

	let success = status.map(|status| status.success()).unwrap_or(false);

	// A short asset can finish the whole encode before the gate fires;
	// its segments are all on disk, so that is readiness too.
	if !gate_done && success {
		session.set_ready();
		gate_done = true;
	}

	if aborted {
		tracing::info!("transcoder aborted");
		session.set_exited();

		// Existing segments stay servable while the child releases its
		// handles; only then is the working directory reclaimed.
		tokio::time::sleep(WORKDIR_REMOVAL_DELAY).await;
		if registry.evict_if(&session) {
			remove_workdir_if_stale(&registry, &session).await;
		}
		return;
	}

	if !gate_done {
		// Died before producing anything; surface the failure to the caller.
		// Evicted before the exit flag flips so the caller observes the
		// final registry state when it wakes.
		tracing::warn!(?status, "transcoder exited before readiness");
		registry.evict_if(&session);
		session.set_exited();
		remove_workdir_if_stale(&registry, &session).await;
		return;
	}

	session.set_exited();

	if success {
		if let Ok(bytes) = tokio::fs::read(session.playlist_path()).await {
			if let Ok((_, playlist)) = m3u8_rs::parse_media_playlist(&bytes) {
				tracing::info!(segments = playlist.segments.len(), "transcode complete");
			}
		}
	} else {
		// Mid-run failure: keep what exists servable, never retry.
		tracing::warn!(?status, "transcoder failed mid-run; existing segments remain");
	}

	tokio::time::sleep(SESSION_TTL).await;
	if registry.evict_if(&session) {
		remove_workdir_if_stale(&registry, &session).await;
		tracing::debug!("session reclaimed after ttl");
	}
}

/// `q` asks ffmpeg to finish cleanly; SIGKILL after the grace period.
async fn stop_child(child: &mut Child, stdin: Option<ChildStdin>) -> Option<std::process::ExitStatus> {
	if let Some(mut stdin) = stdin {
		let _ = stdin.write_all(b"q").await;
		let _ = stdin.flush().await;
	}

	match tokio::time::timeout(GRACEFUL_EXIT, child.wait()).await {
		Ok(status) => status.ok(),
		Err(_) => {
			let _ = child.start_kill();
			child.wait().await.ok()
		}
	}
}

/// Remove the working directory unless a replacement session owns the key.
async fn remove_workdir_if_stale(registry: &SessionRegistry, session: &Arc<Session>) {
	if let Some(current) = registry.get(&session.key) {
		if !Arc::ptr_eq(&current, session) {
			return;
		}
	}

	match tokio::fs::remove_dir_all(&session.workdir).await {
		Ok(()) => session.set_deletion_pending(false),
		Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
			session.set_deletion_pending(false);
		}
		Err(err) => {
			tracing::warn!(workdir = %session.workdir.display(), %err, "workdir removal failed");
			session.set_deletion_pending(true);
		}
	}
}

async fn next_line(
	lines: &mut Option<tokio::io::Lines<BufReader<tokio::process::ChildStderr>>>,
) -> Option<String> {
	match lines {
		Some(lines) => lines.next_line().await.ok().flatten(),
		None => std::future::pending().await,
	}
}

/// Watch for the muxer's per-file open markers and keep a bounded tail.
fn scan_stderr(line: &str, tail: &Mutex<VecDeque<String>>) {
	if let Some(caps) = opening_marker().captures(line) {
		let file = &caps[1];
		if file.ends_with(".ts") {
			tracing::debug!(file, "segment opened");
		} else if file.ends_with(".jpg") {
			tracing::debug!(file, "thumbnail opened");
		} else if file.ends_with(".m3u8") || file.ends_with(".tmp") {
			tracing::debug!(file, "playlist rewritten");
		}
	}

	let mut tail = tail.lock().unwrap();
	if tail.len() == STDERR_TAIL_LINES {
		tail.pop_front();
	}
	tail.push_back(line.to_string());
}

fn opening_marker() -> &'static Regex {
	static MARKER: OnceLock<Regex> = OnceLock::new();
	MARKER.get_or_init(|| Regex::new(r"Opening '([^']+)' for writing").unwrap())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn stderr_marker_matches_muxer_output() {
		let line = "[hls @ 0x5555] Opening '/tmp/live-hls/k/segment003.ts' for writing";
		let caps = opening_marker().captures(line).unwrap();
		assert_eq!(&caps[1], "/tmp/live-hls/k/segment003.ts");

		assert!(opening_marker().captures("frame= 250 fps= 25").is_none());
	}

	#[test]
	fn stderr_tail_is_bounded() {
		let tail = Mutex::new(VecDeque::new());
		for i in 0..STDERR_TAIL_LINES + 10 {
			scan_stderr(&format!("line {i}"), &tail);
		}

		let tail = tail.lock().unwrap();
		assert_eq!(tail.len(), STDERR_TAIL_LINES);
		assert_eq!(tail.front().unwrap(), "line 10");
	}
}
