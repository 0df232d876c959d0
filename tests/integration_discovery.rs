#![cfg(feature = "discovery-test-helpers")]

use std::fs;

use scrub_preview_core::ffmpeg::discovery::{
    get_ffmpeg_path, get_ffprobe_path, reset_discovery_cache,
};
use serial_test::serial;

struct EnvGuard(&'static [&'static str]);

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for var in self.0 {
            unsafe { std::env::remove_var(var) };
        }
        reset_discovery_cache();
    }
}

#[test]
#[serial]
fn ffmpeg_path_env_override_wins() {
    let _guard = EnvGuard(&["FFMPEG_PATH"]);
    let dir = tempfile::tempdir().expect("tempdir");
    let ffmpeg = dir.path().join("ffmpeg-custom");
    fs::write(&ffmpeg, b"").expect("write stub");

    reset_discovery_cache();
    unsafe { std::env::set_var("FFMPEG_PATH", &ffmpeg) };
    assert_eq!(get_ffmpeg_path().expect("ffmpeg"), ffmpeg);
}

#[test]
#[serial]
fn ffprobe_is_found_next_to_ffmpeg() {
    let _guard = EnvGuard(&["FFMPEG_PATH", "FFPROBE_PATH"]);
    let dir = tempfile::tempdir().expect("tempdir");
    let ffmpeg = dir.path().join("ffmpeg");
    let ffprobe = dir.path().join("ffprobe");
    fs::write(&ffmpeg, b"").expect("write ffmpeg stub");
    fs::write(&ffprobe, b"").expect("write ffprobe stub");

    reset_discovery_cache();
    unsafe {
        std::env::set_var("FFMPEG_PATH", &ffmpeg);
        std::env::remove_var("FFPROBE_PATH");
    }
    assert_eq!(get_ffprobe_path().expect("ffprobe"), ffprobe);
}

#[test]
#[serial]
fn discovered_path_is_cached() {
    let _guard = EnvGuard(&["FFMPEG_PATH"]);
    let dir = tempfile::tempdir().expect("tempdir");
    let ffmpeg = dir.path().join("ffmpeg");
    fs::write(&ffmpeg, b"").expect("write stub");

    reset_discovery_cache();
    unsafe { std::env::set_var("FFMPEG_PATH", &ffmpeg) };
    let first = get_ffmpeg_path().expect("ffmpeg");
    unsafe { std::env::remove_var("FFMPEG_PATH") };
    assert_eq!(get_ffmpeg_path().expect("cached"), first);
}
