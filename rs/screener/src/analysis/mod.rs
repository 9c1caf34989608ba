mod loudness;
mod waveform;

pub use loudness::*;
pub use waveform::*;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Analysis results stay cached this long, unless the asset is evicted first.
const ANALYSIS_TTL: Duration = Duration::from_secs(3600);

#[derive(Clone, Debug, Hash, PartialEq, Eq)]
struct WaveformKey {
	key: String,
	buckets: usize,
	combined: bool,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq)]
struct LoudnessKey {
	key: String,
	start_ms: u64,
	duration_ms: u64,
}

/// Memoized analysis results, keyed by asset and parameters.
///
/// Identical parameters return the identical cached value, so repeated
/// requests serialize to byte-identical JSON.
#[derive(Default)]
pub struct AnalysisCache {
	waveforms: Mutex<HashMap<WaveformKey, (Instant, Arc<Waveform>)>>,
	loudness: Mutex<HashMap<LoudnessKey, (Instant, LoudnessWindow)>>,
}

impl AnalysisCache {
	pub fn waveform(&self, key: &str, buckets: usize, combined: bool) -> Option<Arc<Waveform>> {
		let key = WaveformKey {
			key: key.to_string(),
			buckets,
			combined,
		};

		let waveforms = self.waveforms.lock().unwrap();
		let (at, waveform) = waveforms.get(&key)?;
		(at.elapsed() < ANALYSIS_TTL).then(|| waveform.clone())
	}

	pub fn store_waveform(&self, key: &str, buckets: usize, combined: bool, waveform: Arc<Waveform>) {
		let key = WaveformKey {
			key: key.to_string(),
			buckets,
			combined,
		};

		let mut waveforms = self.waveforms.lock().unwrap();
		waveforms.retain(|_, (at, _)| at.elapsed() < ANALYSIS_TTL);
		waveforms.insert(key, (Instant::now(), waveform));
	}

	pub fn loudness(&self, key: &str, start: f64, duration: f64) -> Option<LoudnessWindow> {
		let key = loudness_key(key, start, duration);

		let loudness = self.loudness.lock().unwrap();
		let (at, window) = loudness.get(&key)?;
		(at.elapsed() < ANALYSIS_TTL).then_some(*window)
	}

	pub fn store_loudness(&self, key: &str, start: f64, duration: f64, window: LoudnessWindow) {
		let key = loudness_key(key, start, duration);

		let mut loudness = self.loudness.lock().unwrap();
		loudness.retain(|_, (at, _)| at.elapsed() < ANALYSIS_TTL);
		loudness.insert(key, (Instant::now(), window));
	}

	/// Drop every cached analysis for one asset; called when its session
	/// is evicted.
	pub fn purge(&self, key: &str) {
		self.waveforms.lock().unwrap().retain(|k, _| k.key != key);
		self.loudness.lock().unwrap().retain(|k, _| k.key != key);
	}
}

fn loudness_key(key: &str, start: f64, duration: f64) -> LoudnessKey {
	LoudnessKey {
		key: key.to_string(),
		start_ms: (start.max(0.0) * 1000.0) as u64,
		duration_ms: (duration.max(0.0) * 1000.0) as u64,
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn waveform_round_trip_and_purge() {
		let cache = AnalysisCache::default();
		let waveform = Arc::new(Waveform::silent(10.0));

		assert!(cache.waveform("k", 1000, false).is_none());
		cache.store_waveform("k", 1000, false, waveform.clone());

		let hit = cache.waveform("k", 1000, false).unwrap();
		assert!(Arc::ptr_eq(&hit, &waveform));

		// Different parameters are a different entry.
		assert!(cache.waveform("k", 500, false).is_none());
		assert!(cache.waveform("k", 1000, true).is_none());

		cache.purge("k");
		assert!(cache.waveform("k", 1000, false).is_none());
	}

	#[test]
	fn loudness_keys_on_window() {
		let cache = AnalysisCache::default();
		let window = LoudnessWindow {
			integrated: Some(-23.0),
			range: Some(5.0),
			lra_low: None,
			lra_high: None,
			threshold: Some(-33.0),
		};

		cache.store_loudness("k", 0.0, 10.0, window);
		assert_eq!(cache.loudness("k", 0.0, 10.0), Some(window));
		assert!(cache.loudness("k", 10.0, 10.0).is_none());
	}
}
