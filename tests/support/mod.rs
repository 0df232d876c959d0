#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};

pub const TEST_WIDTH: u32 = 320;
pub const TEST_HEIGHT: u32 = 240;

pub struct IntegrationEnv {
    pub ffmpeg: PathBuf,
    dir: tempfile::TempDir,
}

impl IntegrationEnv {
    pub fn new() -> Self {
        let ffmpeg =
            scrub_preview_core::ffmpeg::discovery::get_ffmpeg_path().expect("FFmpeg not found");
        let dir = tempfile::tempdir().expect("tempdir");
        Self { ffmpeg, dir }
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    pub fn with_test_video(&self, name: &str, duration_secs: f32) -> PathBuf {
        let output_path = self.path(name);
        let status =
            create_test_video(&self.ffmpeg, &output_path, duration_secs).expect("spawn ffmpeg");
        assert!(status.success(), "ffmpeg failed to create test video");
        output_path
    }
}

/// Test pattern video encoded with ffmpeg's built-in mpeg4 encoder.
pub fn create_test_video(
    ffmpeg: &Path,
    output_path: &Path,
    duration_secs: f32,
) -> std::io::Result<ExitStatus> {
    Command::new(ffmpeg)
        .args([
            "-loglevel",
            "error",
            "-y",
            "-f",
            "lavfi",
            "-i",
            &format!(
                "testsrc=duration={}:size={}x{}:rate=25",
                duration_secs, TEST_WIDTH, TEST_HEIGHT
            ),
            "-c:v",
            "mpeg4",
            "-g",
            "25",
            output_path.to_string_lossy().as_ref(),
        ])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
}
