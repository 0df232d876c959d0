//! FFmpeg-backed decoding: binary discovery, process execution, probing, and
//! the [`FfmpegSession`] used by the sidecar.

pub mod discovery;
mod error;
pub mod probe;
mod runner;
mod session;

pub use error::{FfmpegErrorPayload, parse_ffmpeg_error};
pub use probe::{MediaProbe, parse_ffprobe_json, probe_media};
pub use runner::run_capture_blocking;
pub use session::{
    FfmpegBackend, FfmpegSession, MAX_DECODE_WIDTH, build_frame_args, decode_frame,
};

/// Path to string for FFmpeg args or logging.
pub fn path_to_string(path: &(impl AsRef<std::path::Path> + ?Sized)) -> String {
    path.as_ref().to_string_lossy().to_string()
}
