use std::path::PathBuf;

/// The H.264 encoder used for the live preview.
///
/// Chosen once at startup; never switched at runtime. Decoding and the
/// timecode/goniometer filters always run in software regardless, since
/// drawtext and avectorscope are CPU filters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EncoderKind {
	/// libx264
	#[default]
	Software,
	/// NVIDIA NVENC
	Nvenc,
	/// Apple VideoToolbox
	Videotoolbox,
}

impl EncoderKind {
	pub fn codec(&self) -> &'static str {
		match self {
			Self::Software => "libx264",
			Self::Nvenc => "h264_nvenc",
			Self::Videotoolbox => "h264_videotoolbox",
		}
	}
}

/// Core service configuration.
#[derive(clap::Args, Clone, Debug)]
pub struct Config {
	/// Root directory for cached sources and HLS working directories.
	#[arg(long = "cache-dir", env = "SCREENER_CACHE_DIR", default_value = "cache")]
	pub cache_dir: PathBuf,

	/// Byte budget for locally cached source files before eviction.
	#[arg(long = "cache-budget", env = "SCREENER_CACHE_BUDGET", default_value_t = 10 * 1024 * 1024 * 1024)]
	pub cache_budget: u64,

	/// Disable the local source cache; all reads go through signed URLs.
	#[arg(long = "no-local-cache", env = "SCREENER_NO_LOCAL_CACHE")]
	pub no_local_cache: bool,

	/// Default HLS segment duration in seconds; also the thumbnail cadence.
	#[arg(long = "segment-duration", env = "SCREENER_SEGMENT_DURATION", default_value_t = 10)]
	pub segment_duration: u32,

	/// Directory containing the ffmpeg and ffprobe binaries.
	/// When unset the binaries are looked up on PATH.
	#[arg(long = "ffmpeg-dir", env = "SCREENER_FFMPEG_DIR")]
	pub ffmpeg_dir: Option<PathBuf>,

	/// The H.264 encoder for the live preview.
	#[arg(long = "encoder", env = "SCREENER_ENCODER", value_enum, default_value = "software")]
	pub encoder: EncoderKind,
}

impl Config {
	pub fn binaries(&self) -> Binaries {
		Binaries::new(self.ffmpeg_dir.as_deref())
	}
}

/// Object store configuration.
#[derive(clap::Args, Clone, Debug)]
pub struct StoreConfig {
	/// The bucket holding reviewable assets.
	#[arg(long = "bucket", env = "SCREENER_BUCKET")]
	pub bucket: String,

	/// Custom endpoint URL for S3-compatible stores.
	#[arg(long = "endpoint", env = "SCREENER_ENDPOINT")]
	pub endpoint: Option<String>,

	/// Region override.
	#[arg(long = "region", env = "SCREENER_REGION")]
	pub region: Option<String>,
}

/// Resolved paths to the external transcoder binaries.
#[derive(Clone, Debug)]
pub struct Binaries {
	pub ffmpeg: PathBuf,
	pub ffprobe: PathBuf,
}

impl Binaries {
	pub fn new(dir: Option<&std::path::Path>) -> Self {
		match dir {
			Some(dir) => Self {
				ffmpeg: dir.join("ffmpeg"),
				ffprobe: dir.join("ffprobe"),
			},
			None => Self {
				ffmpeg: "ffmpeg".into(),
				ffprobe: "ffprobe".into(),
			},
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn binaries_prefer_override_dir() {
		let bins = Binaries::new(Some(std::path::Path::new("/opt/ffmpeg/bin")));
		assert_eq!(bins.ffmpeg, PathBuf::from("/opt/ffmpeg/bin/ffmpeg"));
		assert_eq!(bins.ffprobe, PathBuf::from("/opt/ffmpeg/bin/ffprobe"));
	}

	#[test]
	fn binaries_default_to_path_lookup() {
		let bins = Binaries::new(None);
		assert_eq!(bins.ffmpeg, PathBuf::from("ffmpeg"));
	}

	#[test]
	fn encoder_codec_names() {
		assert_eq!(EncoderKind::Software.codec(), "libx264");
		assert_eq!(EncoderKind::Nvenc.codec(), "h264_nvenc");
	}
}
