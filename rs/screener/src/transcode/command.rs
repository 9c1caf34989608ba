use std::path::Path;

use crate::{EncoderKind, ProbeRecord};

pub const DEFAULT_SEGMENT_DURATION: u32 = 10;

/// Preview output geometry is fixed; the reviewer judges content, not pixels.
const PREVIEW_WIDTH: u32 = 1280;
const PREVIEW_HEIGHT: u32 = 720;
const PREVIEW_FPS: u32 = 25;

const THUMB_WIDTH: u32 = 320;
const THUMB_HEIGHT: u32 = 180;

const SCOPE_SIZE: u32 = 300;
const SCOPE_MARGIN_RIGHT: u32 = 20;
const SCOPE_MARGIN_BOTTOM: u32 = 50;

const AUDIO_BITRATE: &str = "128k";

/// Options that travel from the playlist request to the transcoder.
/// One value per session; never widened ad hoc.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TranscodeOptions {
	/// HLS target segment length in seconds; also the thumbnail cadence.
	pub segment_duration: u32,

	/// Overlay a 300x300 audio vectorscope bottom-right.
	pub goniometer: bool,

	/// Reserved. Loudness is served as data, not burned in.
	pub loudness_overlay: bool,
}

impl Default for TranscodeOptions {
	fn default() -> Self {
		Self {
			segment_duration: DEFAULT_SEGMENT_DURATION,
			goniometer: false,
			loudness_overlay: false,
		}
	}
}

/// Where the transcoder reads the source from.
#[derive(Clone, Debug)]
pub enum TranscodeInput {
	/// A fully downloaded local file.
	Complete(std::path::PathBuf),

	/// A local file still being appended to by the download task.
	Growing(std::path::PathBuf),

	/// A signed URL; used when the local cache is disabled or absent.
	Remote(String),
}

impl TranscodeInput {
	pub fn location(&self) -> String {
		match self {
			Self::Complete(path) | Self::Growing(path) => path.to_string_lossy().into_owned(),
			Self::Remote(url) => url.clone(),
		}
	}

	fn is_growing(&self) -> bool {
		matches!(self, Self::Growing(_))
	}
}

/// Build the argument vector for the live HLS transcode.
///
/// One child per session produces the event playlist, the MPEG-TS segments
/// and the per-segment thumbnails in a single run.
pub fn hls_args(
	input: &TranscodeInput,
	probe: &ProbeRecord,
	options: &TranscodeOptions,
	encoder: EncoderKind,
	workdir: &Path,
) -> Vec<String> {
	let seg = options.segment_duration.max(1);
	let mut args = string_vec(["-hide_banner", "-loglevel", "info", "-y"]);

	// A growing file must not look like EOF to the demuxer: regenerate
	// timestamps and cap the output at the probed duration instead.
	if input.is_growing() {
		args.extend(string_vec(["-fflags", "+genpts+igndts"]));
	}

	args.push("-i".into());
	args.push(input.location());

	let FilterGraph {
		filters,
		audio_maps,
		merged,
	} = filter_graph(probe, options);

	args.extend(string_vec(["-filter_complex"]));
	args.push(filters);

	// HLS output: burned-in video plus every mapped audio track.
	args.extend(string_vec(["-map", "[vout]"]));
	for map in &audio_maps {
		args.push("-map".into());
		args.push(map.clone());
	}

	args.extend(encoder_args(encoder));
	args.push("-force_key_frames".into());
	args.push(format!("expr:gte(t,n_forced*{seg})"));

	if !audio_maps.is_empty() {
		args.extend(string_vec(["-c:a", "aac", "-b:a", AUDIO_BITRATE]));
	}

	if merged {
		if let Some(pair) = &probe.stereo_pair {
			args.push("-metadata:s:a:0".into());
			args.push(format!("title={}", pair.title));
			if let Some(language) = &pair.language {
				args.push("-metadata:s:a:0".into());
				args.push(format!("language={language}"));
			}
		}
	}

	if input.is_growing() {
		args.extend(string_vec(["-avoid_negative_ts", "make_zero"]));
		if probe.duration > 0.0 {
			args.push("-t".into());
			args.push(format!("{:.3}", probe.duration));
		}
	}

	args.extend(string_vec([
		"-f",
		"hls",
		"-hls_time",
	]));
	args.push(seg.to_string());
	args.extend(string_vec([
		"-hls_playlist_type",
		"event",
		"-hls_list_size",
		"0",
		"-hls_flags",
		"independent_segments+split_by_time",
		"-hls_segment_filename",
	]));
	args.push(workdir.join("segment%03d.ts").to_string_lossy().into_owned());
	args.push(workdir.join("playlist.m3u8").to_string_lossy().into_owned());

	// Thumbnail output: one JPEG per segment, sampled at the midpoint.
	args.extend(string_vec(["-map", "[thumb]"]));
	if let Some(cap) = thumbnail_cap(probe.duration, seg) {
		args.push("-frames:v".into());
		args.push(cap.to_string());
	}
	args.extend(string_vec(["-q:v", "3", "-f", "image2", "-start_number", "0"]));
	args.push(workdir.join("thumb%03d.jpg").to_string_lossy().into_owned());

	args
}

/// The number of thumbnails a finite asset can produce.
pub fn thumbnail_cap(duration: f64, segment_duration: u32) -> Option<u64> {
	(duration > 0.0).then(|| (duration / segment_duration.max(1) as f64).ceil() as u64)
}

struct FilterGraph {
	filters: String,
	audio_maps: Vec<String>,

	/// The mono pair was joined into the first output track.
	merged: bool,
}

/// Assemble the filter_complex graph: split video into the timecode-burned
/// preview chain and the thumbnail chain, merge the mono pair when the hint
/// holds, and optionally overlay the goniometer.
fn filter_graph(probe: &ProbeRecord, options: &TranscodeOptions) -> FilterGraph {
	let seg = options.segment_duration.max(1);
	let mut chains = Vec::new();
	let mut audio_maps = Vec::new();

	chains.push("[0:v:0]split=2[vmain][vthumb]".to_string());

	// Timestamps reset at the pipeline head so the burned timecode starts
	// at zero regardless of the source's epoch.
	chains.push(format!(
		"[vmain]setpts=PTS-STARTPTS,scale={PREVIEW_WIDTH}:{PREVIEW_HEIGHT},fps={PREVIEW_FPS},\
		 drawtext=text='%{{pts\\:hms}}':x=w-tw-20:y=h-th-20:fontsize=36:fontcolor=white:\
		 box=1:boxcolor=black@0.5:boxborderw=8[vtc]"
	));

	chains.push(format!(
		"[vthumb]fps=1/{seg}:start_time={:.1},scale={THUMB_WIDTH}:{THUMB_HEIGHT}[thumb]",
		seg as f64 / 2.0
	));

	let merged = probe
		.stereo_pair
		.as_ref()
		.filter(|pair| pair.compatible)
		.cloned();

	let goniometer = options.goniometer && probe.has_audio();

	if let Some(pair) = &merged {
		let join = format!(
			"[0:{}][0:{}]join=inputs=2:channel_layout=stereo",
			pair.first, pair.second
		);

		if goniometer {
			// The joined pair feeds both the encoder and the vectorscope.
			chains.push(format!("{join}[stereo]"));
			chains.push("[stereo]asplit=2[stereo_out][scope_in]".to_string());
			chains.push(format!(
				"[scope_in]avectorscope=s={SCOPE_SIZE}x{SCOPE_SIZE}:r={PREVIEW_FPS}[scope]"
			));
			audio_maps.push("[stereo_out]".to_string());
		} else {
			chains.push(format!("{join}[stereo]"));
			audio_maps.push("[stereo]".to_string());
		}

		// Remaining audio streams map 1:1 after the merged pair.
		for stream in &probe.audio {
			if stream.index != pair.first && stream.index != pair.second {
				audio_maps.push(format!("0:{}", stream.index));
			}
		}
	} else {
		for stream in &probe.audio {
			audio_maps.push(format!("0:{}", stream.index));
		}

		if goniometer {
			// Input streams may feed a filter and a -map at the same time.
			chains.push(format!(
				"[0:{}]avectorscope=s={SCOPE_SIZE}x{SCOPE_SIZE}:r={PREVIEW_FPS}[scope]",
				probe.audio[0].index
			));
		}
	}

	if goniometer {
		chains.push(format!(
			"[vtc][scope]overlay=W-w-{SCOPE_MARGIN_RIGHT}:H-h-{SCOPE_MARGIN_BOTTOM}[vout]"
		));
	} else {
		chains.push("[vtc]null[vout]".to_string());
	}

	FilterGraph {
		filters: chains.join(";"),
		audio_maps,
		merged: merged.is_some(),
	}
}

/// Video encoder arguments for the configured path.
///
/// Decoding and filters stay in software either way; the timecode burn-in
/// requires CPU filters.
fn encoder_args(encoder: EncoderKind) -> Vec<String> {
	let mut args = string_vec(["-c:v", encoder.codec()]);

	match encoder {
		EncoderKind::Software => {
			args.extend(string_vec(["-preset", "veryfast", "-profile:v", "high", "-level", "4.0"]));
		}
		EncoderKind::Nvenc => {
			args.extend(string_vec(["-preset", "p5", "-profile:v", "high", "-level", "4.0"]));
		}
		EncoderKind::Videotoolbox => {
			args.extend(string_vec(["-profile:v", "high"]));
		}
	}

	args.extend(string_vec(["-pix_fmt", "yuv420p"]));
	args
}

fn string_vec<const N: usize>(args: [&str; N]) -> Vec<String> {
	args.iter().map(|s| s.to_string()).collect()
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::{AudioInfo, StereoPair, VideoInfo};

	fn probe(audio: Vec<AudioInfo>, pair: Option<StereoPair>) -> ProbeRecord {
		ProbeRecord {
			duration: 35.0,
			size: Some(50_000_000),
			container: "mov,mp4,m4a,3gp,3g2,mj2".to_string(),
			bit_rate: Some(10_000_000),
			video: Some(VideoInfo {
				codec: "h264".to_string(),
				width: 1920,
				height: 1080,
				frame_rate: 25.0,
				bit_rate: None,
			}),
			audio,
			stereo_pair: pair,
		}
	}

	fn mono(index: usize) -> AudioInfo {
		AudioInfo {
			index,
			codec: "pcm_s24le".to_string(),
			sample_rate: 48000,
			channels: 1,
			channel_layout: "mono".to_string(),
			bit_rate: None,
			bits_per_sample: Some(24),
			language: Some("eng".to_string()),
			title: None,
			duration: None,
		}
	}

	fn pair(first: usize, second: usize, compatible: bool) -> StereoPair {
		StereoPair {
			first,
			second,
			compatible,
			title: "Mix L + Mix R (Stereo)".to_string(),
			language: Some("eng".to_string()),
		}
	}

	fn workdir() -> std::path::PathBuf {
		"/tmp/live-hls/test".into()
	}

	fn args_of(probe: &ProbeRecord, options: &TranscodeOptions) -> Vec<String> {
		hls_args(
			&TranscodeInput::Complete("/tmp/src.mp4".into()),
			probe,
			options,
			EncoderKind::Software,
			&workdir(),
		)
	}

	fn joined(args: &[String]) -> String {
		args.join(" ")
	}

	#[test]
	fn video_only_has_no_audio_args() {
		let probe = probe(Vec::new(), None);
		let args = args_of(&probe, &TranscodeOptions::default());
		let line = joined(&args);

		assert!(!line.contains("-c:a"));
		assert!(line.contains("-map [vout]"));
		assert!(line.contains("-map [thumb]"));
		assert!(line.contains("scale=1280:720"));
		assert!(line.contains("drawtext"));
		assert!(line.contains("-hls_playlist_type event"));
		assert!(line.contains("independent_segments+split_by_time"));
	}

	#[test]
	fn mono_pair_merges_and_labels_track_zero() {
		let probe = probe(
			vec![mono(1), mono(2), mono(3), mono(4)],
			Some(pair(1, 2, true)),
		);
		let args = args_of(&probe, &TranscodeOptions::default());
		let line = joined(&args);

		assert!(line.contains("[0:1][0:2]join=inputs=2:channel_layout=stereo"));
		assert!(line.contains("-map [stereo]"));
		assert!(line.contains("-map 0:3"));
		assert!(line.contains("-map 0:4"));
		assert!(!line.contains("-map 0:1 "));
		assert!(line.contains("title=Mix L + Mix R (Stereo)"));
		assert!(line.contains("language=eng"));
		assert!(line.contains("-c:a aac"));
		assert!(line.contains("-b:a 128k"));
	}

	#[test]
	fn incompatible_pair_maps_streams_directly() {
		let probe = probe(vec![mono(1), mono(2)], Some(pair(1, 2, false)));
		let args = args_of(&probe, &TranscodeOptions::default());
		let line = joined(&args);

		assert!(!line.contains("join=inputs=2"));
		assert!(line.contains("-map 0:1"));
		assert!(line.contains("-map 0:2"));
		assert!(!line.contains("-metadata:s:a:0"));
	}

	#[test]
	fn goniometer_overlays_bottom_right() {
		let probe = probe(vec![mono(1), mono(2)], Some(pair(1, 2, true)));
		let options = TranscodeOptions {
			goniometer: true,
			..Default::default()
		};
		let line = joined(&args_of(&probe, &options));

		assert!(line.contains("avectorscope=s=300x300"));
		assert!(line.contains("overlay=W-w-20:H-h-50"));
		assert!(line.contains("asplit=2[stereo_out][scope_in]"));
		assert!(line.contains("-map [stereo_out]"));
	}

	#[test]
	fn goniometer_without_audio_is_ignored() {
		let probe = probe(Vec::new(), None);
		let options = TranscodeOptions {
			goniometer: true,
			..Default::default()
		};
		let line = joined(&args_of(&probe, &options));

		assert!(!line.contains("avectorscope"));
	}

	#[test]
	fn growing_input_enables_streaming_mode() {
		let probe = probe(Vec::new(), None);
		let args = hls_args(
			&TranscodeInput::Growing("/tmp/src.mp4".into()),
			&probe,
			&TranscodeOptions::default(),
			EncoderKind::Software,
			&workdir(),
		);
		let line = joined(&args);

		assert!(line.contains("-fflags +genpts+igndts"));
		assert!(line.contains("-avoid_negative_ts make_zero"));
		assert!(line.contains("-t 35.000"));
	}

	#[test]
	fn complete_input_skips_streaming_mode() {
		let probe = probe(Vec::new(), None);
		let line = joined(&args_of(&probe, &TranscodeOptions::default()));

		assert!(!line.contains("genpts"));
		assert!(!line.contains("-t 35.000"));
	}

	#[test]
	fn thumbnails_sample_segment_midpoints() {
		let probe = probe(Vec::new(), None);
		let line = joined(&args_of(&probe, &TranscodeOptions::default()));

		// 35 s / 10 s segments: thumbnails at 5, 15, 25, 35 capped to 4.
		assert!(line.contains("fps=1/10:start_time=5.0"));
		assert!(line.contains("scale=320:180"));
		assert!(line.contains("-frames:v 4"));
		assert!(line.contains("-start_number 0"));
		assert!(line.contains("thumb%03d.jpg"));
	}

	#[test]
	fn keyframes_align_with_segments() {
		let probe = probe(Vec::new(), None);
		let options = TranscodeOptions {
			segment_duration: 6,
			..Default::default()
		};
		let line = joined(&args_of(&probe, &options));

		assert!(line.contains("expr:gte(t,n_forced*6)"));
		assert!(line.contains("-hls_time 6"));
	}

	#[test]
	fn thumbnail_cap_rounds_up() {
		assert_eq!(thumbnail_cap(35.0, 10), Some(4));
		assert_eq!(thumbnail_cap(30.0, 10), Some(3));
		assert_eq!(thumbnail_cap(9.0, 10), Some(1));
		assert_eq!(thumbnail_cap(0.0, 10), None);
	}

	#[test]
	fn hardware_encoder_still_uses_cpu_filters() {
		let probe = probe(Vec::new(), None);
		let args = hls_args(
			&TranscodeInput::Complete("/tmp/src.mp4".into()),
			&probe,
			&TranscodeOptions::default(),
			EncoderKind::Nvenc,
			&workdir(),
		);
		let line = joined(&args);

		assert!(line.contains("-c:v h264_nvenc"));
		assert!(line.contains("drawtext"));
		assert!(!line.contains("-hwaccel"));
	}
}
