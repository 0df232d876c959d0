//! ffprobe-based stream metadata: dimensions and duration.

use serde::Deserialize;

use super::discovery::get_ffprobe_path;
use super::runner::run_capture_blocking;
use crate::error::PreviewError;

#[derive(Debug, Deserialize)]
struct FfprobeFormat {
    duration: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FfprobeStream {
    codec_type: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    #[serde(default)]
    duration: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    format: Option<FfprobeFormat>,
    streams: Option<Vec<FfprobeStream>>,
}

#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaProbe {
    /// Seconds; 0 when unknown (live or unbounded streams).
    pub duration: f64,
    pub width: u32,
    pub height: u32,
}

fn parse_seconds(s: Option<&String>) -> Option<f64> {
    s.and_then(|s| s.trim().parse::<f64>().ok())
        .filter(|d| d.is_finite() && *d > 0.0)
}

pub fn parse_ffprobe_json(json: &str) -> Result<MediaProbe, PreviewError> {
    let output: FfprobeOutput = serde_json::from_str(json)
        .map_err(|e| PreviewError::from(format!("Failed to parse ffprobe JSON: {}", e)))?;

    let video = output
        .streams
        .as_ref()
        .and_then(|streams| streams.iter().find(|s| s.codec_type.as_deref() == Some("video")));
    let duration = parse_seconds(output.format.as_ref().and_then(|f| f.duration.as_ref()))
        .or_else(|| parse_seconds(video.and_then(|s| s.duration.as_ref())))
        .unwrap_or(0.0);

    Ok(MediaProbe {
        duration,
        width: video.and_then(|s| s.width).unwrap_or(0),
        height: video.and_then(|s| s.height).unwrap_or(0),
    })
}

/// Runs ffprobe against a file path or URL. Blocking.
pub fn probe_media(source: &str) -> Result<MediaProbe, PreviewError> {
    let ffprobe = get_ffprobe_path()?;
    log::debug!(
        target: "scrub_preview::ffmpeg::probe",
        "probing {}",
        source
    );
    let args: Vec<String> = [
        "-v",
        "error",
        "-print_format",
        "json",
        "-show_format",
        "-show_streams",
        source,
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();
    let stdout = run_capture_blocking(&ffprobe, &args)?;
    let json = String::from_utf8(stdout)
        .map_err(|_| PreviewError::from("ffprobe output was not valid UTF-8"))?;
    parse_ffprobe_json(&json)
}
