//! Locating the ffmpeg and ffprobe executables.

use std::path::{Path, PathBuf};
use std::process::Command;

use parking_lot::Mutex;

use crate::error::PreviewError;

#[cfg(target_os = "windows")]
const WHICH: &str = "where";
#[cfg(not(target_os = "windows"))]
const WHICH: &str = "which";

fn find_in_path(binary: &str) -> Option<PathBuf> {
    let output = Command::new(WHICH).arg(binary).output().ok()?;
    if !output.status.success() {
        return None;
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    let first = stdout.lines().next()?.trim();
    if first.is_empty() {
        None
    } else {
        Some(PathBuf::from(first))
    }
}

fn common_paths() -> Vec<PathBuf> {
    #[cfg(target_os = "macos")]
    {
        vec![
            PathBuf::from("/opt/homebrew/bin/ffmpeg"),
            PathBuf::from("/usr/local/bin/ffmpeg"),
            PathBuf::from("/opt/local/bin/ffmpeg"),
        ]
    }

    #[cfg(target_os = "windows")]
    {
        vec![
            PathBuf::from("C:\\ffmpeg\\bin\\ffmpeg.exe"),
            PathBuf::from("C:\\Program Files\\ffmpeg\\bin\\ffmpeg.exe"),
        ]
    }

    #[cfg(all(unix, not(target_os = "macos")))]
    {
        vec![
            PathBuf::from("/usr/bin/ffmpeg"),
            PathBuf::from("/usr/local/bin/ffmpeg"),
        ]
    }

    #[cfg(not(any(target_os = "macos", target_os = "windows", unix)))]
    {
        vec![]
    }
}

static FFMPEG_PATH_CACHE: Mutex<Option<PathBuf>> = Mutex::new(None);
static FFPROBE_PATH_CACHE: Mutex<Option<PathBuf>> = Mutex::new(None);

fn env_override(var: &str) -> Option<PathBuf> {
    let path = PathBuf::from(std::env::var_os(var)?);
    if path.exists() {
        log::debug!(
            target: "scrub_preview::ffmpeg::discovery",
            "{} from {} env",
            path.display(),
            var
        );
        Some(path)
    } else {
        log::warn!(
            target: "scrub_preview::ffmpeg::discovery",
            "{} points to missing file {}",
            var,
            path.display()
        );
        None
    }
}

fn resolve_ffmpeg_path() -> Result<PathBuf, PreviewError> {
    if let Some(path) = env_override("FFMPEG_PATH") {
        return Ok(path);
    }
    for path in common_paths() {
        if path.exists() {
            log::debug!(
                target: "scrub_preview::ffmpeg::discovery",
                "FFmpeg found in common path: {}",
                path.display()
            );
            return Ok(path);
        }
    }
    if let Some(path) = find_in_path("ffmpeg").filter(|p| p.exists()) {
        log::debug!(
            target: "scrub_preview::ffmpeg::discovery",
            "FFmpeg found in PATH: {}",
            path.display()
        );
        return Ok(path);
    }

    log::error!(
        target: "scrub_preview::ffmpeg::discovery",
        "FFmpeg not found in PATH or common locations"
    );
    Err(PreviewError::FfmpegNotFound(
        "FFmpeg not found. Please install FFmpeg on your system:\n  - macOS: brew install ffmpeg\n  - Linux: sudo apt install ffmpeg\n  - Windows: Download from https://ffmpeg.org/download.html"
            .to_string(),
    ))
}

/// FFmpeg path, cached for the process lifetime.
/// `FFMPEG_PATH` takes precedence, then common install locations, then PATH.
pub fn get_ffmpeg_path() -> Result<PathBuf, PreviewError> {
    let mut cache = FFMPEG_PATH_CACHE.lock();
    if let Some(path) = cache.as_ref() {
        return Ok(path.clone());
    }
    let path = resolve_ffmpeg_path()?;
    *cache = Some(path.clone());
    Ok(path)
}

/// ffprobe binaries to try next to `ffmpeg_path`: platform-suffixed first, then plain.
pub fn ffprobe_candidates(ffmpeg_path: &Path) -> Vec<PathBuf> {
    let Some(parent) = ffmpeg_path.parent() else {
        return vec![];
    };
    let exe = if cfg!(target_os = "windows") { ".exe" } else { "" };
    let mut candidates = Vec::with_capacity(2);
    if let Some(suffix) = ffmpeg_path
        .file_stem()
        .and_then(|s| s.to_str())
        .and_then(|stem| stem.strip_prefix("ffmpeg"))
        .filter(|suffix| !suffix.is_empty())
    {
        candidates.push(parent.join(format!("ffprobe{}{}", suffix, exe)));
    }
    candidates.push(parent.join(format!("ffprobe{}", exe)));
    candidates
}

/// ffprobe path: `FFPROBE_PATH`, else next to ffmpeg, else PATH.
pub fn get_ffprobe_path() -> Result<PathBuf, PreviewError> {
    let mut cache = FFPROBE_PATH_CACHE.lock();
    if let Some(path) = cache.as_ref() {
        return Ok(path.clone());
    }
    let path = match env_override("FFPROBE_PATH") {
        Some(path) => path,
        None => {
            let ffmpeg = get_ffmpeg_path()?;
            ffprobe_candidates(&ffmpeg)
                .into_iter()
                .find(|candidate| candidate.exists())
                .or_else(|| find_in_path("ffprobe").filter(|p| p.exists()))
                .ok_or_else(|| {
                    PreviewError::FfmpegNotFound(format!(
                        "ffprobe not found next to {}",
                        ffmpeg.display()
                    ))
                })?
        }
    };
    *cache = Some(path.clone());
    Ok(path)
}

/// Forgets cached paths so discovery tests can run in any order.
#[cfg(feature = "discovery-test-helpers")]
pub fn reset_discovery_cache() {
    FFMPEG_PATH_CACHE.lock().take();
    FFPROBE_PATH_CACHE.lock().take();
}
