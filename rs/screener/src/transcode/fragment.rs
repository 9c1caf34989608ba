use std::time::Duration;

use bytes::Bytes;

use crate::{Binaries, EncoderKind, Error, Result};

/// Ceiling for a one-shot fragment encode.
const FRAGMENT_TIMEOUT: Duration = Duration::from_secs(120);

/// Encode one chunk of the source as a fragmented MP4 with the timecode
/// burned in, returning the bytes from the child's stdout.
///
/// The burned timecode is offset by the chunk start so it shows asset time,
/// not chunk time.
pub async fn mp4_fragment(
	binaries: &Binaries,
	encoder: EncoderKind,
	input: &str,
	start: f64,
	duration: f64,
) -> Result<Bytes> {
	let args = fragment_args(input, start, duration, encoder);

	let output = tokio::time::timeout(
		FRAGMENT_TIMEOUT,
		tokio::process::Command::new(&binaries.ffmpeg)
			.args(&args)
			.stdin(std::process::Stdio::null())
			.output(),
	)
	.await
	.map_err(|_| Error::Timeout)??;

	if !output.status.success() {
		let stderr = String::from_utf8_lossy(&output.stderr);
		return Err(Error::TranscodeFailed(format!(
			"fragment encode exited with {}: {}",
			output.status,
			stderr.trim()
		)));
	}

	Ok(Bytes::from(output.stdout))
}

fn fragment_args(input: &str, start: f64, duration: f64, encoder: EncoderKind) -> Vec<String> {
	let mut args: Vec<String> = ["-hide_banner", "-loglevel", "error"]
		.iter()
		.map(|s| s.to_string())
		.collect();

	args.push("-ss".to_string());
	args.push(format!("{start:.3}"));
	args.push("-t".to_string());
	args.push(format!("{duration:.3}"));
	args.push("-i".to_string());
	args.push(input.to_string());

	args.push("-vf".to_string());
	args.push(format!(
		"setpts=PTS-STARTPTS,scale=1280:720,fps=25,\
		 drawtext=text='%{{pts\\:hms\\:{start:.3}}}':x=w-tw-20:y=h-th-20:fontsize=36:\
		 fontcolor=white:box=1:boxcolor=black@0.5:boxborderw=8"
	));

	args.push("-c:v".to_string());
	args.push(encoder.codec().to_string());
	if encoder == EncoderKind::Software {
		args.push("-preset".to_string());
		args.push("veryfast".to_string());
	}
	args.push("-pix_fmt".to_string());
	args.push("yuv420p".to_string());

	args.push("-c:a".to_string());
	args.push("aac".to_string());
	args.push("-b:a".to_string());
	args.push("128k".to_string());

	args.push("-movflags".to_string());
	args.push("frag_keyframe+empty_moov+default_base_moof".to_string());
	args.push("-f".to_string());
	args.push("mp4".to_string());
	args.push("pipe:1".to_string());

	args
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn fragment_args_window_and_offset() {
		let args = fragment_args("/tmp/src.mp4", 30.0, 10.0, EncoderKind::Software);
		let line = args.join(" ");

		assert!(line.contains("-ss 30.000"));
		assert!(line.contains("-t 10.000"));
		assert!(line.contains("pts\\:hms\\:30.000"));
		assert!(line.contains("frag_keyframe+empty_moov"));
		assert!(line.ends_with("-f mp4 pipe:1"));
	}
}
