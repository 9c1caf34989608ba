//! # screener: broadcast asset review
//!
//! Review service for large broadcast video assets held in an S3-compatible
//! object store. A reviewer picks an asset by key; the service delivers a
//! live-updating HLS preview with a burned-in timecode (and optional audio
//! goniometer) while progressively caching the source locally and producing
//! per-segment thumbnails and audio analysis.
//!
//! ## Overview
//!
//! - **Store**: signed-URL issuance, HEAD metadata and byte streams from the
//!   object store via the [`store`] client.
//! - **Fetch**: progressive, resumable source downloads with LRU eviction
//!   under a byte budget ([`SourceCache`]).
//! - **Probe**: memoized ffprobe records, including the mono-combinable
//!   stereo pair hint ([`Prober`]).
//! - **Transcode**: the per-asset supervisor owning one ffmpeg child that
//!   grows an HLS event playlist, segments and thumbnails ([`transcode`]).
//! - **Analysis**: one-shot waveform and EBU R128 loudness extraction
//!   ([`analysis`]).
//! - **Controller**: the pipeline controller composing all of the above and
//!   owning the currently-loaded key ([`Controller`]).
//!
//! The external transcoder binary (ffmpeg/ffprobe) does all decoding and
//! encoding; this crate owns lifecycle, readiness and caching around it.

mod config;
mod controller;
mod error;
mod fetch;
mod probe;
mod store;

pub mod analysis;
pub mod transcode;

pub use config::*;
pub use controller::*;
pub use error::*;
pub use fetch::*;
pub use probe::*;
pub use store::*;

pub use transcode::{SessionRegistry, TranscodeOptions, DEFAULT_SEGMENT_DURATION};
