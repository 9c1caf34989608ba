use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::{Binaries, Error, ObjectStore, Result};

/// Probe records stay valid for an hour before re-probing.
const PROBE_TTL: Duration = Duration::from_secs(3600);

/// Ceiling for the ffprobe child itself.
const PROBE_TIMEOUT: Duration = Duration::from_secs(30);

/// Last-resort bitrate when neither the container nor any stream reports one.
const FALLBACK_BITRATE: u64 = 8_000_000;

/// Everything we know about an asset after probing it once.
#[serde_with::skip_serializing_none]
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeRecord {
	/// Total duration in seconds.
	pub duration: f64,

	/// Total size in bytes, when the container reports it.
	pub size: Option<u64>,

	/// Container format name.
	pub container: String,

	/// Container-level bitrate in bits per second.
	pub bit_rate: Option<u64>,

	pub video: Option<VideoInfo>,
	pub audio: Vec<AudioInfo>,

	/// The first two mono streams, when the asset has them.
	pub stereo_pair: Option<StereoPair>,
}

impl ProbeRecord {
	/// Best-effort bitrate: container, then video stream, then size over
	/// duration, then a fixed fallback.
	pub fn bitrate(&self) -> u64 {
		if let Some(rate) = self.bit_rate {
			return rate;
		}
		if let Some(rate) = self.video.as_ref().and_then(|v| v.bit_rate) {
			return rate;
		}
		if let Some(size) = self.size {
			if self.duration > 0.0 {
				return (size as f64 * 8.0 / self.duration) as u64;
			}
		}
		FALLBACK_BITRATE
	}

	pub fn has_audio(&self) -> bool {
		!self.audio.is_empty()
	}
}

#[serde_with::skip_serializing_none]
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoInfo {
	pub codec: String,
	pub width: u32,
	pub height: u32,

	/// Derived from the stream's rational rate; round to nearest when an
	/// integer is needed.
	pub frame_rate: f64,

	pub bit_rate: Option<u64>,
}

impl VideoInfo {
	pub fn frame_rate_rounded(&self) -> u32 {
		self.frame_rate.round() as u32
	}
}

#[serde_with::skip_serializing_none]
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioInfo {
	/// Absolute stream index within the container.
	pub index: usize,

	pub codec: String,
	pub sample_rate: u32,
	pub channels: u32,
	pub channel_layout: String,
	pub bit_rate: Option<u64>,
	pub bits_per_sample: Option<u32>,
	pub language: Option<String>,
	pub title: Option<String>,
	pub duration: Option<f64>,
}

impl AudioInfo {
	/// The label used when synthesizing the merged-stereo title.
	fn label(&self) -> String {
		self.title
			.clone()
			.unwrap_or_else(|| format!("Audio {}", self.index))
	}
}

/// The first two mono audio streams, merged into one stereo track when
/// their codec and sample rate match.
#[serde_with::skip_serializing_none]
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StereoPair {
	/// Absolute stream index of the first mono stream.
	pub first: usize,

	/// Absolute stream index of the second mono stream.
	pub second: usize,

	/// Whether the two streams can actually be merged.
	pub compatible: bool,

	/// Synthesized track title, e.g. "Mix L + Mix R (Stereo)".
	pub title: String,

	pub language: Option<String>,
}

/// Probes assets with ffprobe and memoizes the result.
pub struct Prober {
	binaries: Binaries,
	store: Arc<ObjectStore>,
	memo: Mutex<HashMap<String, (Instant, Arc<ProbeRecord>)>>,
}

impl Prober {
	pub fn new(binaries: Binaries, store: Arc<ObjectStore>) -> Self {
		Self {
			binaries,
			store,
			memo: Mutex::new(HashMap::new()),
		}
	}

	/// Probe an asset, preferring a complete local copy over a signed URL.
	///
	/// `local` is the cached file when one is fully downloaded; partial files
	/// are not probed because MP4 moov atoms commonly trail the file.
	pub async fn probe(&self, key: &str, local: Option<PathBuf>) -> Result<Arc<ProbeRecord>> {
		if let Some(record) = self.cached(key) {
			return Ok(record);
		}

		let input = match &local {
			Some(path) => path.to_string_lossy().into_owned(),
			None => self.store.signed_url(key).await?,
		};

		let record = Arc::new(self.run(&input).await?);

		let mut memo = self.memo.lock().unwrap();
		memo.retain(|_, (at, _)| at.elapsed() < PROBE_TTL);
		memo.insert(key.to_string(), (Instant::now(), record.clone()));

		Ok(record)
	}

	fn cached(&self, key: &str) -> Option<Arc<ProbeRecord>> {
		let memo = self.memo.lock().unwrap();
		let (at, record) = memo.get(key)?;
		(at.elapsed() < PROBE_TTL).then(|| record.clone())
	}

	async fn run(&self, input: &str) -> Result<ProbeRecord> {
		let output = tokio::time::timeout(
			PROBE_TIMEOUT,
			tokio::process::Command::new(&self.binaries.ffprobe)
				.args(["-v", "error", "-print_format", "json", "-show_format", "-show_streams"])
				.arg(input)
				.output(),
		)
		.await
		.map_err(|_| Error::Timeout)??;

		if !output.status.success() {
			let stderr = String::from_utf8_lossy(&output.stderr);
			return Err(Error::SourceUnavailable(format!(
				"ffprobe exited with {}: {}",
				output.status,
				stderr.trim()
			)));
		}

		let raw: RawProbe = serde_json::from_slice(&output.stdout)
			.map_err(|err| Error::SourceUnavailable(format!("unreadable ffprobe output: {err}")))?;

		Ok(shape(raw))
	}
}

/// Default channel layout names for streams that omit one.
pub fn default_channel_layout(channels: u32) -> String {
	match channels {
		1 => "mono".to_string(),
		2 => "stereo".to_string(),
		3 => "2.1".to_string(),
		4 => "quad".to_string(),
		5 => "4.1".to_string(),
		6 => "5.1".to_string(),
		7 => "6.1".to_string(),
		8 => "7.1".to_string(),
		n => format!("{n} channels"),
	}
}

fn shape(raw: RawProbe) -> ProbeRecord {
	let duration = raw
		.format
		.duration
		.as_deref()
		.and_then(|d| d.parse::<f64>().ok())
		.unwrap_or_default();

	let mut video = None;
	let mut audio = Vec::new();

	for stream in raw.streams {
		match stream.codec_type.as_deref() {
			Some("video") if video.is_none() => {
				video = Some(VideoInfo {
					codec: stream.codec_name.clone().unwrap_or_default(),
					width: stream.width.unwrap_or_default(),
					height: stream.height.unwrap_or_default(),
					frame_rate: parse_rate(
						stream.avg_frame_rate.as_deref(),
						stream.r_frame_rate.as_deref(),
					),
					bit_rate: parse_u64(stream.bit_rate.as_deref()),
				});
			}
			Some("audio") => {
				let channels = stream.channels.unwrap_or_default();
				audio.push(AudioInfo {
					index: stream.index,
					codec: stream.codec_name.clone().unwrap_or_default(),
					sample_rate: parse_u64(stream.sample_rate.as_deref()).unwrap_or_default() as u32,
					channels,
					channel_layout: stream
						.channel_layout
						.clone()
						.unwrap_or_else(|| default_channel_layout(channels)),
					bit_rate: parse_u64(stream.bit_rate.as_deref()),
					bits_per_sample: stream.bits_per_sample.filter(|bits| *bits > 0),
					language: stream.tag("language"),
					title: stream.tag("title"),
					duration: stream.duration.as_deref().and_then(|d| d.parse().ok()),
				});
			}
			_ => {}
		}
	}

	let stereo_pair = mono_pair(&audio);

	ProbeRecord {
		duration,
		size: parse_u64(raw.format.size.as_deref()),
		container: raw.format.format_name.unwrap_or_default(),
		bit_rate: parse_u64(raw.format.bit_rate.as_deref()),
		video,
		audio,
		stereo_pair,
	}
}

/// The first two mono streams form a combinable pair; they merge cleanly
/// only when codec and sample rate agree.
fn mono_pair(audio: &[AudioInfo]) -> Option<StereoPair> {
	let mut monos = audio.iter().filter(|a| a.channels == 1);
	let first = monos.next()?;
	let second = monos.next()?;

	Some(StereoPair {
		first: first.index,
		second: second.index,
		compatible: first.codec == second.codec && first.sample_rate == second.sample_rate,
		title: format!("{} + {} (Stereo)", first.label(), second.label()),
		language: first.language.clone().or_else(|| second.language.clone()),
	})
}

fn parse_rate(avg: Option<&str>, raw: Option<&str>) -> f64 {
	parse_rational(avg).or_else(|| parse_rational(raw)).unwrap_or_default()
}

fn parse_rational(rate: Option<&str>) -> Option<f64> {
	let (num, den) = rate?.split_once('/')?;
	let num: f64 = num.parse().ok()?;
	let den: f64 = den.parse().ok()?;
	(den != 0.0 && num != 0.0).then(|| num / den)
}

fn parse_u64(value: Option<&str>) -> Option<u64> {
	value?.parse().ok()
}

#[derive(Deserialize)]
struct RawProbe {
	format: RawFormat,
	#[serde(default)]
	streams: Vec<RawStream>,
}

#[derive(Deserialize)]
struct RawFormat {
	format_name: Option<String>,
	duration: Option<String>,
	size: Option<String>,
	bit_rate: Option<String>,
}

#[derive(Deserialize)]
struct RawStream {
	index: usize,
	codec_type: Option<String>,
	codec_name: Option<String>,
	width: Option<u32>,
	height: Option<u32>,
	r_frame_rate: Option<String>,
	avg_frame_rate: Option<String>,
	bit_rate: Option<String>,
	sample_rate: Option<String>,
	channels: Option<u32>,
	channel_layout: Option<String>,
	bits_per_sample: Option<u32>,
	duration: Option<String>,
	#[serde(default)]
	tags: HashMap<String, String>,
}

impl RawStream {
	fn tag(&self, name: &str) -> Option<String> {
		self.tags
			.iter()
			.find(|(key, _)| key.eq_ignore_ascii_case(name))
			.map(|(_, value)| value.clone())
			.filter(|value| !value.is_empty())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn stream(index: usize, channels: u32, codec: &str, rate: u32, title: Option<&str>) -> AudioInfo {
		AudioInfo {
			index,
			codec: codec.to_string(),
			sample_rate: rate,
			channels,
			channel_layout: default_channel_layout(channels),
			bit_rate: None,
			bits_per_sample: None,
			language: None,
			title: title.map(str::to_string),
			duration: None,
		}
	}

	#[test]
	fn layout_defaults() {
		assert_eq!(default_channel_layout(1), "mono");
		assert_eq!(default_channel_layout(2), "stereo");
		assert_eq!(default_channel_layout(6), "5.1");
		assert_eq!(default_channel_layout(8), "7.1");
		assert_eq!(default_channel_layout(11), "11 channels");
	}

	#[test]
	fn mono_pair_takes_first_two() {
		let audio = vec![
			stream(1, 1, "pcm_s24le", 48000, Some("Mix L")),
			stream(2, 1, "pcm_s24le", 48000, Some("Mix R")),
			stream(3, 1, "pcm_s24le", 48000, None),
		];

		let pair = mono_pair(&audio).unwrap();
		assert_eq!(pair.first, 1);
		assert_eq!(pair.second, 2);
		assert!(pair.compatible);
		assert_eq!(pair.title, "Mix L + Mix R (Stereo)");
	}

	#[test]
	fn mono_pair_incompatible_on_rate_mismatch() {
		let audio = vec![
			stream(1, 1, "aac", 48000, None),
			stream(2, 1, "aac", 44100, None),
		];

		let pair = mono_pair(&audio).unwrap();
		assert!(!pair.compatible);
	}

	#[test]
	fn mono_pair_ignores_multichannel_streams() {
		let audio = vec![
			stream(1, 2, "aac", 48000, None),
			stream(2, 1, "aac", 48000, None),
		];

		assert!(mono_pair(&audio).is_none());
	}

	#[test]
	fn shapes_ffprobe_json() {
		let json = r#"{
			"format": {
				"format_name": "mov,mp4,m4a,3gp,3g2,mj2",
				"duration": "35.000000",
				"size": "52428800",
				"bit_rate": "11983616"
			},
			"streams": [
				{
					"index": 0,
					"codec_type": "video",
					"codec_name": "h264",
					"width": 1920,
					"height": 1080,
					"avg_frame_rate": "25000/1000",
					"r_frame_rate": "25/1",
					"bit_rate": "10000000"
				},
				{
					"index": 1,
					"codec_type": "audio",
					"codec_name": "aac",
					"sample_rate": "48000",
					"channels": 1,
					"tags": { "language": "eng", "title": "Commentary" }
				},
				{
					"index": 2,
					"codec_type": "audio",
					"codec_name": "aac",
					"sample_rate": "48000",
					"channels": 1
				}
			]
		}"#;

		let raw: RawProbe = serde_json::from_str(json).unwrap();
		let record = shape(raw);

		assert_eq!(record.duration, 35.0);
		assert_eq!(record.bitrate(), 11_983_616);

		let video = record.video.as_ref().unwrap();
		assert_eq!(video.frame_rate_rounded(), 25);

		assert_eq!(record.audio.len(), 2);
		assert_eq!(record.audio[0].channel_layout, "mono");
		assert_eq!(record.audio[0].language.as_deref(), Some("eng"));

		let pair = record.stereo_pair.as_ref().unwrap();
		assert!(pair.compatible);
		assert_eq!(pair.title, "Commentary + Audio 2 (Stereo)");
		assert_eq!(pair.language.as_deref(), Some("eng"));
	}

	#[test]
	fn bitrate_falls_back_to_size_over_duration() {
		let record = ProbeRecord {
			duration: 10.0,
			size: Some(12_500_000),
			container: "mpegts".to_string(),
			bit_rate: None,
			video: None,
			audio: Vec::new(),
			stereo_pair: None,
		};

		assert_eq!(record.bitrate(), 10_000_000);
	}

	#[test]
	fn bitrate_fixed_fallback() {
		let record = ProbeRecord {
			duration: 0.0,
			size: None,
			container: String::new(),
			bit_rate: None,
			video: None,
			audio: Vec::new(),
			stereo_pair: None,
		};

		assert_eq!(record.bitrate(), FALLBACK_BITRATE);
	}
}
