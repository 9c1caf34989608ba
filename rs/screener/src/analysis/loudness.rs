use std::time::Duration;

use regex::Regex;
use serde::Serialize;

use crate::{Binaries, Error, ProbeRecord, Result};

const EXTRACT_TIMEOUT: Duration = Duration::from_secs(300);

/// EBU R128 measurements over one window of the asset.
///
/// Fields the filter's summary did not yield are absent, never synthesized.
#[serde_with::skip_serializing_none]
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoudnessWindow {
	/// Integrated loudness in LUFS.
	pub integrated: Option<f64>,

	/// Loudness range in LU.
	pub range: Option<f64>,

	pub lra_low: Option<f64>,
	pub lra_high: Option<f64>,

	/// Integrated-loudness gating threshold in LUFS.
	pub threshold: Option<f64>,
}

/// Measure loudness over `[start, start + duration)` with the ebur128
/// filter and parse its final summary off stderr.
pub async fn extract_loudness(
	binaries: &Binaries,
	input: &str,
	probe: &ProbeRecord,
	start: f64,
	duration: f64,
) -> Result<LoudnessWindow> {
	if !probe.has_audio() {
		return Err(Error::Analysis("asset has no audio stream".to_string()));
	}

	let args = loudness_args(input, probe, start, duration);

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
			"loudness measurement exited with {}: {}",
			output.status,
			stderr.trim()
		)));
	}

	Ok(parse_summary(&String::from_utf8_lossy(&output.stderr)))
}

fn loudness_args(input: &str, probe: &ProbeRecord, start: f64, duration: f64) -> Vec<String> {
	let mut args: Vec<String> = ["-hide_banner", "-nostats"]
		.iter()
		.map(|s| s.to_string())
		.collect();

	args.push("-ss".to_string());
	args.push(format!("{start:.3}"));
	args.push("-t".to_string());
	args.push(format!("{duration:.3}"));
	args.push("-i".to_string());
	args.push(input.to_string());
	args.push("-vn".to_string());

	match probe.stereo_pair.as_ref().filter(|pair| pair.compatible) {
		Some(pair) => {
			args.push("-filter_complex".to_string());
			args.push(format!(
				"[0:{}][0:{}]join=inputs=2:channel_layout=stereo,ebur128=framelog=verbose[out]",
				pair.first, pair.second
			));
			args.push("-map".to_string());
			args.push("[out]".to_string());
		}
		None => {
			args.push("-map".to_string());
			args.push(format!("0:{}", probe.audio[0].index));
			args.push("-af".to_string());
			args.push("ebur128=framelog=verbose".to_string());
		}
	}

	args.push("-f".to_string());
	args.push("null".to_string());
	args.push("-".to_string());

	args
}

/// Pull the labelled values out of the filter's human-readable summary.
/// The first `Threshold` line belongs to the integrated measurement.
fn parse_summary(stderr: &str) -> LoudnessWindow {
	LoudnessWindow {
		integrated: summary_value(stderr, "I"),
		range: summary_value(stderr, "LRA"),
		lra_low: summary_value(stderr, "LRA low"),
		lra_high: summary_value(stderr, "LRA high"),
		threshold: summary_value(stderr, "Threshold"),
	}
}

fn summary_value(stderr: &str, label: &str) -> Option<f64> {
	let pattern = format!(r"(?m)^\s*{}:\s*(-?\d+(?:\.\d+)?)\s*LU", regex::escape(label));
	let regex = Regex::new(&pattern).ok()?;

	regex
		.captures(stderr)
		.and_then(|caps| caps.get(1))
		.and_then(|value| value.as_str().parse().ok())
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::AudioInfo;

	const SUMMARY: &str = "\
[Parsed_ebur128_0 @ 0x55e1a8] Summary:

  Integrated loudness:
    I:         -23.1 LUFS
    Threshold: -33.6 LUFS

  Loudness range:
    LRA:        6.5 LU
    Threshold: -43.6 LUFS
    LRA low:   -28.0 LUFS
    LRA high:  -21.5 LUFS
";

	#[test]
	fn parses_full_summary() {
		let window = parse_summary(SUMMARY);

		assert_eq!(window.integrated, Some(-23.1));
		assert_eq!(window.range, Some(6.5));
		assert_eq!(window.lra_low, Some(-28.0));
		assert_eq!(window.lra_high, Some(-21.5));
		// The first Threshold line wins: the integrated gate.
		assert_eq!(window.threshold, Some(-33.6));
	}

	#[test]
	fn missing_fields_stay_absent() {
		let window = parse_summary("    I:   -18.0 LUFS\n");

		assert_eq!(window.integrated, Some(-18.0));
		assert_eq!(window.range, None);
		assert_eq!(window.lra_low, None);
		assert_eq!(window.threshold, None);
	}

	#[test]
	fn garbage_yields_empty_window() {
		let window = parse_summary("frame=100 fps=25\n");

		assert_eq!(window.integrated, None);
		assert_eq!(window.range, None);
	}

	#[test]
	fn window_args_seek_before_input() {
		let probe = ProbeRecord {
			duration: 120.0,
			size: None,
			container: "mov".to_string(),
			bit_rate: None,
			video: None,
			audio: vec![AudioInfo {
				index: 1,
				codec: "aac".to_string(),
				sample_rate: 48000,
				channels: 2,
				channel_layout: "stereo".to_string(),
				bit_rate: None,
				bits_per_sample: None,
				language: None,
				title: None,
				duration: None,
			}],
			stereo_pair: None,
		};

		let args = loudness_args("in.mp4", &probe, 30.0, 10.0);
		let line = args.join(" ");

		let seek = line.find("-ss 30.000").unwrap();
		let input = line.find("-i in.mp4").unwrap();
		assert!(seek < input);
		assert!(line.contains("-t 10.000"));
		assert!(line.contains("ebur128=framelog=verbose"));
		assert!(line.ends_with("-f null -"));
	}
}
