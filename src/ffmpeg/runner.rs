//! Blocking ffmpeg/ffprobe invocation that collects stdout.
//!
//! Stdout carries the payload (a PNG frame or probe JSON) and is read to the
//! end on the calling thread. Stderr is drained on a helper thread so a
//! chatty process cannot block on a full pipe.

use std::io::{BufRead, BufReader, Read};
use std::path::Path;
use std::process::{Command, Stdio};
#[cfg(windows)]
use std::os::windows::process::CommandExt;
use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;

use crate::error::PreviewError;

/// Keep only the last N bytes of stderr to avoid unbounded memory growth.
const MAX_STDERR_BYTES: usize = 64 * 1024;

fn drain_stderr<R: Read + Send + 'static>(
    reader: R,
    buffer: Arc<Mutex<Vec<u8>>>,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let mut reader = BufReader::new(reader);
        let mut line = Vec::with_capacity(256);
        while reader.read_until(b'\n', &mut line).unwrap_or(0) > 0 {
            let mut guard = buffer.lock();
            guard.extend_from_slice(&line);
            if guard.len() > MAX_STDERR_BYTES {
                let excess = guard.len() - MAX_STDERR_BYTES;
                guard.drain(..excess);
            }
            line.clear();
        }
    })
}

/// Runs `program` with `args`, blocking until it exits. Returns stdout on success.
pub fn run_capture_blocking(program: &Path, args: &[String]) -> Result<Vec<u8>, PreviewError> {
    let input_arg = args
        .iter()
        .position(|a| a == "-i")
        .and_then(|i| args.get(i + 1))
        .or_else(|| args.last());
    log::debug!(
        target: "scrub_preview::ffmpeg::runner",
        "Spawning {}: input={:?}",
        program.display(),
        input_arg
    );

    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    #[cfg(windows)]
    cmd.creation_flags(0x08000000); // CREATE_NO_WINDOW
    let mut child = cmd.spawn().map_err(|e| {
        PreviewError::ffmpeg_failed(-1, format!("Failed to spawn {}: {}", program.display(), e))
    })?;

    let (Some(mut stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
        let _ = child.kill();
        let _ = child.wait();
        return Err(PreviewError::from("Failed to capture process output"));
    };

    let stderr_buffer = Arc::new(Mutex::new(Vec::new()));
    let stderr_handle = drain_stderr(stderr, Arc::clone(&stderr_buffer));

    let mut output = Vec::new();
    let read = stdout.read_to_end(&mut output);
    let status = child.wait();
    let _ = stderr_handle.join();
    read?;
    let status = status?;

    if status.success() {
        log::trace!(
            target: "scrub_preview::ffmpeg::runner",
            "{} completed ({} bytes)",
            program.display(),
            output.len()
        );
        return Ok(output);
    }

    let stderr = String::from_utf8_lossy(&stderr_buffer.lock()).to_string();
    let code = status.code().unwrap_or(-1);
    let preview = stderr
        .lines()
        .rev()
        .take(3)
        .collect::<Vec<_>>()
        .join("; ");
    log::warn!(
        target: "scrub_preview::ffmpeg::runner",
        "{} failed (code={}): {}",
        program.display(),
        code,
        preview
    );
    Err(PreviewError::ffmpeg_failed(code, stderr))
}
