use std::path::Path;
use std::time::Duration;

use super::segment_name;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Short assets finish fast or not at all; don't make the reviewer wait.
const SHORT_ASSET_TIMEOUT: Duration = Duration::from_secs(10);

/// Wait until enough initial segments exist in the working directory to
/// start playback without immediate starvation.
///
/// Counts `segment000.ts`, `segment001.ts`, … contiguously from zero.
/// Succeeds when the contiguous count reaches `min_segments`, or when
/// `expected_total` is known and every expected segment exists. On timeout
/// it returns whatever count exists; the gate never fails and the caller
/// serves the partial playlist.
pub async fn wait(
	workdir: &Path,
	min_segments: usize,
	timeout: Duration,
	expected_total: Option<u64>,
) -> usize {
	let mut min_segments = min_segments;
	let mut timeout = timeout;

	if let Some(expected) = expected_total {
		if expected <= 2 {
			min_segments = (expected as usize).div_ceil(2);
			timeout = timeout.min(SHORT_ASSET_TIMEOUT);
		}
	}

	let deadline = tokio::time::Instant::now() + timeout;

	loop {
		let count = contiguous_segments(workdir).await;

		if count >= min_segments {
			return count;
		}
		if let Some(expected) = expected_total {
			if count as u64 >= expected {
				return count;
			}
		}
		if tokio::time::Instant::now() >= deadline {
			tracing::debug!(workdir = %workdir.display(), count, "readiness timed out");
			return count;
		}

		tokio::time::sleep(POLL_INTERVAL).await;
	}
}

/// Count segment files numbered contiguously from 000.
pub async fn contiguous_segments(workdir: &Path) -> usize {
	let mut count = 0;

	while tokio::fs::try_exists(workdir.join(segment_name(count)))
		.await
		.unwrap_or(false)
	{
		count += 1;
	}

	count
}

#[cfg(test)]
mod tests {
	use super::*;

	fn touch(dir: &Path, name: &str) {
		std::fs::write(dir.join(name), b"ts").unwrap();
	}

	#[tokio::test]
	async fn counts_contiguous_segments_only() {
		let dir = tempfile::tempdir().unwrap();
		touch(dir.path(), "segment000.ts");
		touch(dir.path(), "segment001.ts");
		touch(dir.path(), "segment003.ts");

		assert_eq!(contiguous_segments(dir.path()).await, 2);
	}

	#[tokio::test]
	async fn unlocks_when_enough_segments_exist() {
		let dir = tempfile::tempdir().unwrap();
		touch(dir.path(), "segment000.ts");
		touch(dir.path(), "segment001.ts");

		let count = wait(dir.path(), 2, Duration::from_secs(30), None).await;
		assert_eq!(count, 2);
	}

	#[tokio::test]
	async fn short_asset_unlocks_on_single_segment() {
		let dir = tempfile::tempdir().unwrap();
		touch(dir.path(), "segment000.ts");

		let count = wait(dir.path(), 2, Duration::from_secs(30), Some(1)).await;
		assert_eq!(count, 1);
	}

	#[tokio::test(start_paused = true)]
	async fn timeout_returns_partial_count() {
		let dir = tempfile::tempdir().unwrap();

		let count = wait(dir.path(), 2, Duration::from_millis(300), None).await;
		assert_eq!(count, 0);
	}
}
