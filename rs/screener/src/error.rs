/// A list of possible failures surfaced by the review pipeline.
///
/// The enum is `Clone` so a single download failure can be broadcast to every
/// waiter blocked on the same asset.
#[derive(thiserror::Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
	/// The asset key or a derived artifact does not exist.
	#[error("not found")]
	NotFound,

	/// The object store rejected our credentials.
	#[error("credentials rejected by object store")]
	Credentials,

	/// The source download could not start or was closed by the peer.
	#[error("source unavailable: {0}")]
	SourceUnavailable(String),

	/// A download stalled past its ceiling, or a probe never responded.
	#[error("timeout")]
	Timeout,

	/// Local disk failure.
	#[error("i/o: {0}")]
	Io(String),

	/// The transcoder child exited non-zero before readiness.
	#[error("transcoder failed to start: {0}")]
	TranscodeStartup(String),

	/// The transcoder child exited non-zero after readiness.
	///
	/// Existing segments remain servable; this is logged rather than
	/// propagated unless a later request finds the session missing.
	#[error("transcode failed: {0}")]
	TranscodeFailed(String),

	/// Waveform or loudness extraction failed. Never synthesized around.
	#[error("analysis failed: {0}")]
	Analysis(String),

	/// The request was superseded by a key switch or an explicit abort.
	#[error("cancelled")]
	Cancelled,

	/// A malformed artifact name or query parameter.
	#[error("invalid request: {0}")]
	InvalidRequest(String),
}

impl From<std::io::Error> for Error {
	fn from(err: std::io::Error) -> Self {
		if err.kind() == std::io::ErrorKind::NotFound {
			return Error::NotFound;
		}

		Error::Io(err.to_string())
	}
}

impl From<reqwest::Error> for Error {
	fn from(err: reqwest::Error) -> Self {
		if err.is_timeout() {
			return Error::Timeout;
		}

		Error::SourceUnavailable(err.to_string())
	}
}

pub type Result<T> = std::result::Result<T, Error>;
