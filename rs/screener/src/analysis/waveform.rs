use std::time::Duration;

use serde::Serialize;

use crate::{Binaries, Error, ProbeRecord, Result};

/// PCM sample rate the source is reduced to before bucketing.
const ANALYSIS_RATE: u32 = 8000;

/// Ceiling for the one-shot extraction child.
const EXTRACT_TIMEOUT: Duration = Duration::from_secs(300);

/// Compander ahead of the resample, lifting low-amplitude detail so quiet
/// passages stay visible in the rendered waveform.
const COMPAND: &str = "compand=attacks=0.3:decays=0.8:points=-80/-80|-45/-15|-27/-9|0/-7|20/-7";

/// RMS-per-bucket waveform of an asset's audio.
#[serde_with::skip_serializing_none]
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Waveform {
	pub duration: f64,
	pub samples: Vec<f32>,
	pub sample_rate: u32,
	pub has_audio: bool,
	pub samples_per_second: Option<f64>,
}

impl Waveform {
	/// The shape returned for assets without any audio stream.
	pub fn silent(duration: f64) -> Self {
		Self {
			duration,
			samples: Vec::new(),
			sample_rate: 0,
			has_audio: false,
			samples_per_second: None,
		}
	}
}

/// Extract the waveform by decoding to 8 kHz mono float PCM on stdout and
/// reducing the sample array to `buckets` RMS values.
///
/// The mono-combinable pair is merged first when the hint holds, so the
/// waveform matches what the preview plays as track 0.
pub async fn extract_waveform(
	binaries: &Binaries,
	input: &str,
	probe: &ProbeRecord,
	buckets: usize,
) -> Result<Waveform> {
	if !probe.has_audio() {
		return Ok(Waveform::silent(probe.duration));
	}

	let args = waveform_args(input, probe);

	let output = tokio::time::timeout(
		EXTRACT_TIMEOUT,
		tokio::process::Command::new(&binaries.ffmpeg)
			.args(&args)
			.stdin(std::process::Stdio::null())
			.output(),
	)
	.await
	.map_err(|_| Error::Timeout)?
	.map_err(|err| Error::Analysis(format!("spawn: {err}")))?;

	if !output.status.success() {
		let stderr = String::from_utf8_lossy(&output.stderr);
		return Err(Error::Analysis(format!(
			"pcm decode exited with {}: {}",
			output.status,
			stderr.trim()
		)));
	}

	let pcm: Vec<f32> = output
		.stdout
		.chunks_exact(4)
		.map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
		.collect();

	if pcm.is_empty() {
		return Err(Error::Analysis("no pcm samples decoded".to_string()));
	}

	let samples = bucket_rms(&pcm, buckets);

	Ok(Waveform {
		duration: probe.duration,
		samples,
		sample_rate: ANALYSIS_RATE,
		has_audio: true,
		samples_per_second: (probe.duration > 0.0).then(|| buckets as f64 / probe.duration),
	})
}

fn waveform_args(input: &str, probe: &ProbeRecord) -> Vec<String> {
	let mut args: Vec<String> = ["-hide_banner", "-loglevel", "error", "-i"]
		.iter()
		.map(|s| s.to_string())
		.collect();
	args.push(input.to_string());

	match probe.stereo_pair.as_ref().filter(|pair| pair.compatible) {
		Some(pair) => {
			args.push("-filter_complex".to_string());
			args.push(format!(
				"[0:{}][0:{}]join=inputs=2:channel_layout=stereo,{COMPAND}[wave]",
				pair.first, pair.second
			));
			args.push("-map".to_string());
			args.push("[wave]".to_string());
		}
		None => {
			args.push("-map".to_string());
			args.push(format!("0:{}", probe.audio[0].index));
			args.push("-af".to_string());
			args.push(COMPAND.to_string());
		}
	}

	args.extend(
		["-ac", "1", "-ar", "8000", "-c:a", "pcm_f32le", "-f", "f32le", "pipe:1"]
			.iter()
			.map(|s| s.to_string()),
	);

	args
}

/// Partition samples into equal buckets and take `sqrt(mean(x²))` of each,
/// clamped to `[0, 1]`.
fn bucket_rms(pcm: &[f32], buckets: usize) -> Vec<f32> {
	if buckets == 0 {
		return Vec::new();
	}

	(0..buckets)
		.map(|i| {
			let start = i * pcm.len() / buckets;
			let end = ((i + 1) * pcm.len() / buckets).max(start);
			let bucket = &pcm[start..end];

			if bucket.is_empty() {
				return 0.0;
			}

			let mean_square: f64 = bucket
				.iter()
				.map(|sample| (*sample as f64) * (*sample as f64))
				.sum::<f64>() / bucket.len() as f64;

			(mean_square.sqrt() as f32).clamp(0.0, 1.0)
		})
		.collect()
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::{AudioInfo, StereoPair};

	fn probe_with(audio: Vec<AudioInfo>, pair: Option<StereoPair>) -> ProbeRecord {
		ProbeRecord {
			duration: 20.0,
			size: None,
			container: "wav".to_string(),
			bit_rate: None,
			video: None,
			audio,
			stereo_pair: pair,
		}
	}

	fn mono(index: usize) -> AudioInfo {
		AudioInfo {
			index,
			codec: "pcm_s16le".to_string(),
			sample_rate: 48000,
			channels: 1,
			channel_layout: "mono".to_string(),
			bit_rate: None,
			bits_per_sample: None,
			language: None,
			title: None,
			duration: None,
		}
	}

	#[test]
	fn rms_of_constant_signal() {
		let pcm = vec![0.5f32; 1000];
		let samples = bucket_rms(&pcm, 10);

		assert_eq!(samples.len(), 10);
		for sample in samples {
			assert!((sample - 0.5).abs() < 1e-6);
		}
	}

	#[test]
	fn rms_clamps_overdriven_signal() {
		let pcm = vec![1.5f32; 100];
		let samples = bucket_rms(&pcm, 4);

		assert!(samples.iter().all(|s| *s == 1.0));
	}

	#[test]
	fn rms_of_silence_is_zero() {
		let pcm = vec![0.0f32; 100];
		assert!(bucket_rms(&pcm, 5).iter().all(|s| *s == 0.0));
	}

	#[test]
	fn more_buckets_than_samples_pads_with_zero() {
		let pcm = vec![0.5f32; 3];
		let samples = bucket_rms(&pcm, 10);

		assert_eq!(samples.len(), 10);
		assert!(samples.iter().any(|s| *s > 0.0));
		assert!(samples.iter().any(|s| *s == 0.0));
	}

	#[test]
	fn silent_asset_shape() {
		let waveform = Waveform::silent(12.5);

		assert!(!waveform.has_audio);
		assert!(waveform.samples.is_empty());
		assert_eq!(waveform.sample_rate, 0);
		assert_eq!(waveform.duration, 12.5);
	}

	#[test]
	fn combined_pair_merges_before_compand() {
		let pair = StereoPair {
			first: 1,
			second: 2,
			compatible: true,
			title: "L + R (Stereo)".to_string(),
			language: None,
		};
		let probe = probe_with(vec![mono(1), mono(2)], Some(pair));

		let line = waveform_args("in.wav", &probe).join(" ");
		assert!(line.contains("[0:1][0:2]join=inputs=2:channel_layout=stereo,compand"));
		assert!(line.contains("-map [wave]"));
		assert!(line.contains("-ar 8000"));
		assert!(line.contains("-f f32le"));
	}

	#[test]
	fn single_stream_applies_compand_directly() {
		let probe = probe_with(vec![mono(3)], None);

		let line = waveform_args("in.wav", &probe).join(" ");
		assert!(line.contains("-map 0:3"));
		assert!(line.contains("-af compand"));
		assert!(!line.contains("join"));
	}
}
