//! Decoding session backed by short-lived ffmpeg processes.
//!
//! Every position change queues a single-frame decode. One worker task per
//! session runs decodes back to back; when several positions are requested
//! while a decode is running only the newest one is decoded next, and results
//! for superseded requests are dropped.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use image::ImageFormat;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::broadcast;

use super::discovery::get_ffmpeg_path;
use super::probe::{MediaProbe, probe_media};
use super::runner::run_capture_blocking;
use crate::error::PreviewError;
use crate::session::{
    DecodingSession, FrameError, HLS_MIME, MediaBackend, ReadyState, SessionEvent, VideoFrame,
};

/// Decoded frames are downscaled to at most this width before leaving ffmpeg.
pub const MAX_DECODE_WIDTH: u32 = 640;

const EVENT_CAPACITY: usize = 64;
/// Seeks are kept this far before the reported end so a frame always exists.
const END_GUARD_SECONDS: f64 = 0.1;

pub fn build_frame_args(source: &str, time: f64, max_width: u32) -> Vec<String> {
    vec![
        "-hide_banner".into(),
        "-loglevel".into(),
        "error".into(),
        "-ss".into(),
        format!("{:.3}", time.max(0.0)),
        "-i".into(),
        source.into(),
        "-an".into(),
        "-sn".into(),
        "-frames:v".into(),
        "1".into(),
        "-vf".into(),
        format!("scale='min({},iw)':-2", max_width),
        "-f".into(),
        "image2pipe".into(),
        "-c:v".into(),
        "png".into(),
        "pipe:1".into(),
    ]
}

/// Decodes the frame at `time`. Blocking.
pub fn decode_frame(source: &str, time: f64, max_width: u32) -> Result<VideoFrame, PreviewError> {
    let ffmpeg = get_ffmpeg_path()?;
    let png = run_capture_blocking(&ffmpeg, &build_frame_args(source, time, max_width))?;
    if png.is_empty() {
        return Err(PreviewError::from(format!(
            "FFmpeg produced no frame at {:.3}s",
            time
        )));
    }
    let image = image::load_from_memory_with_format(&png, ImageFormat::Png)
        .map_err(|e| PreviewError::from(format!("Failed to decode frame: {}", e)))?
        .into_rgba8();
    Ok(VideoFrame {
        width: image.width(),
        height: image.height(),
        data: image.into_raw(),
    })
}

async fn blocking<T, F>(f: F) -> Result<T, PreviewError>
where
    F: FnOnce() -> Result<T, PreviewError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| PreviewError::from(format!("Decode task failed: {}", e)))?
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodePurpose {
    Load,
    Seek,
    Refresh,
}

#[derive(Debug, Clone, Copy)]
struct DecodeTarget {
    time: f64,
    request: u64,
    purpose: DecodePurpose,
}

#[derive(Default)]
struct DecodeState {
    source: Option<String>,
    source_id: u64,
    probe: Option<MediaProbe>,
    /// Probing the current source failed; cleared by the next load.
    load_failed: bool,
    ready: Option<ReadyState>,
    time: f64,
    frame: Option<VideoFrame>,
    request: u64,
    target: Option<DecodeTarget>,
    worker_running: bool,
}

impl DecodeState {
    fn clamp_time(&self, time: f64) -> f64 {
        let time = if time.is_finite() { time.max(0.0) } else { 0.0 };
        match self.probe {
            Some(probe) if probe.duration > 0.0 => {
                time.min((probe.duration - END_GUARD_SECONDS).max(0.0))
            }
            _ => time,
        }
    }

    /// Position moved: the held frame no longer matches it.
    fn invalidate_frame(&mut self) {
        self.frame = None;
        if self.ready > Some(ReadyState::HaveMetadata) {
            self.ready = Some(ReadyState::HaveMetadata);
        }
    }
}

struct Inner {
    state: Mutex<DecodeState>,
    events: broadcast::Sender<SessionEvent>,
    max_width: u32,
    headless: AtomicBool,
}

impl Inner {
    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }
}

pub struct FfmpegSession {
    inner: Arc<Inner>,
    runtime: Handle,
}

impl FfmpegSession {
    pub fn new(runtime: Handle) -> Self {
        Self::with_max_width(runtime, MAX_DECODE_WIDTH)
    }

    pub fn with_max_width(runtime: Handle, max_width: u32) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(DecodeState::default()),
                events,
                max_width: max_width.max(1),
                headless: AtomicBool::new(false),
            }),
            runtime,
        }
    }

    pub fn source(&self) -> Option<String> {
        self.inner.state.lock().source.clone()
    }

    pub fn duration(&self) -> Option<f64> {
        self.inner
            .state
            .lock()
            .probe
            .map(|p| p.duration)
            .filter(|d| *d > 0.0)
    }

    pub fn is_headless(&self) -> bool {
        self.inner.headless.load(Ordering::Relaxed)
    }

    /// Position reported by an external player during playback.
    pub fn report_playback_time(&self, time: f64) {
        {
            let mut state = self.inner.state.lock();
            state.time = state.clamp_time(time);
            state.invalidate_frame();
        }
        self.inner.emit(SessionEvent::TimeUpdate);
        self.request_decode(DecodePurpose::Refresh);
    }

    /// A seek already completed by an external player.
    pub fn report_seeked(&self, time: f64) {
        {
            let mut state = self.inner.state.lock();
            state.time = state.clamp_time(time);
            state.invalidate_frame();
        }
        self.inner.emit(SessionEvent::Seeking);
        self.inner.emit(SessionEvent::Seeked);
        self.request_decode(DecodePurpose::Refresh);
    }

    fn request_decode(&self, purpose: DecodePurpose) {
        let spawn_worker = {
            let mut state = self.inner.state.lock();
            if state.source.is_none() {
                return;
            }
            state.request += 1;
            state.target = Some(DecodeTarget {
                time: state.time,
                request: state.request,
                purpose,
            });
            !std::mem::replace(&mut state.worker_running, true)
        };
        if spawn_worker {
            self.runtime.spawn(run_decoder(Arc::clone(&self.inner)));
        }
    }
}

async fn run_decoder(inner: Arc<Inner>) {
    loop {
        let job = {
            let mut state = inner.state.lock();
            match (state.target.take(), state.source.clone()) {
                (Some(mut target), Some(source)) => {
                    target.time = state.clamp_time(target.time);
                    (target, source, state.source_id, state.probe)
                }
                _ => {
                    state.worker_running = false;
                    return;
                }
            }
        };
        let (target, source, source_id, probe) = job;

        if probe.is_none() {
            let url = source.clone();
            match blocking(move || probe_media(&url)).await {
                Ok(probe) => {
                    {
                        let mut state = inner.state.lock();
                        if state.source_id != source_id {
                            continue;
                        }
                        state.probe = Some(probe);
                        state.ready = state.ready.max(Some(ReadyState::HaveMetadata));
                        // Requeue so the position is clamped against the probed duration.
                        if state.target.is_none() {
                            state.target = Some(target);
                        }
                        state.time = state.clamp_time(state.time);
                    }
                    log::debug!(
                        target: "scrub_preview::ffmpeg::session",
                        "{}x{}, {:.3}s: {}",
                        probe.width,
                        probe.height,
                        probe.duration,
                        source
                    );
                    inner.emit(SessionEvent::LoadedMetadata);
                    continue;
                }
                Err(e) => {
                    let current = {
                        let mut state = inner.state.lock();
                        let current = state.source_id == source_id;
                        if current {
                            state.load_failed = true;
                        }
                        current
                    };
                    if current {
                        log::warn!(
                            target: "scrub_preview::ffmpeg::session",
                            "probe failed for {}: {}",
                            source,
                            e
                        );
                        inner.emit(SessionEvent::Error);
                    }
                    continue;
                }
            }
        }

        let max_width = inner.max_width;
        let url = source.clone();
        let time = target.time;
        let result = blocking(move || decode_frame(&url, time, max_width)).await;

        {
            let mut state = inner.state.lock();
            if state.source_id != source_id || state.request != target.request {
                log::trace!(
                    target: "scrub_preview::ffmpeg::session",
                    "dropping superseded frame at {:.3}s",
                    time
                );
                continue;
            }
            match result {
                Ok(frame) => {
                    state.frame = Some(frame);
                    state.ready = Some(ReadyState::HaveEnoughData);
                }
                Err(e) => {
                    drop(state);
                    log::warn!(
                        target: "scrub_preview::ffmpeg::session",
                        "decode at {:.3}s failed: {}",
                        time,
                        e
                    );
                    inner.emit(SessionEvent::Error);
                    continue;
                }
            }
        }

        match target.purpose {
            DecodePurpose::Load => {
                inner.emit(SessionEvent::CanPlay);
                inner.emit(SessionEvent::CanPlayThrough);
            }
            DecodePurpose::Seek => {
                inner.emit(SessionEvent::Seeked);
                inner.emit(SessionEvent::CanPlay);
            }
            DecodePurpose::Refresh => inner.emit(SessionEvent::CanPlay),
        }
    }
}

impl DecodingSession for FfmpegSession {
    fn ready_state(&self) -> ReadyState {
        self.inner
            .state
            .lock()
            .ready
            .unwrap_or(ReadyState::HaveNothing)
    }

    fn current_time(&self) -> f64 {
        self.inner.state.lock().time
    }

    fn set_current_time(&self, time: f64) {
        {
            let mut state = self.inner.state.lock();
            state.time = state.clamp_time(time);
            state.invalidate_frame();
        }
        self.inner.emit(SessionEvent::Seeking);
        self.request_decode(DecodePurpose::Seek);
    }

    fn video_size(&self) -> (u32, u32) {
        self.inner
            .state
            .lock()
            .probe
            .map(|p| (p.width, p.height))
            .unwrap_or((0, 0))
    }

    fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    fn read_frame(&self) -> Result<VideoFrame, FrameError> {
        self.inner
            .state
            .lock()
            .frame
            .clone()
            .ok_or(FrameError::Unavailable)
    }

    fn load_source(&self, url: &str) {
        {
            let mut state = self.inner.state.lock();
            let (source_id, request, worker_running) =
                (state.source_id + 1, state.request, state.worker_running);
            *state = DecodeState {
                source: Some(url.to_string()),
                source_id,
                request,
                worker_running,
                ..DecodeState::default()
            };
        }
        log::debug!(
            target: "scrub_preview::ffmpeg::session",
            "loading {} ({})",
            url,
            if self.is_headless() { "headless" } else { "primary" }
        );
        self.request_decode(DecodePurpose::Load);
    }

    fn clear_source(&self) {
        let mut state = self.inner.state.lock();
        let (source_id, request, worker_running) =
            (state.source_id + 1, state.request, state.worker_running);
        *state = DecodeState {
            source_id,
            request,
            worker_running,
            ..DecodeState::default()
        };
    }

    fn can_play_type(&self, mime: &str) -> bool {
        mime == HLS_MIME || mime.starts_with("video/")
    }

    fn has_load_error(&self) -> bool {
        self.inner.state.lock().load_failed
    }

    fn prepare_headless(&self) {
        self.inner.headless.store(true, Ordering::Relaxed);
    }
}

/// Backend whose headless sessions decode through ffmpeg. HLS is read natively.
pub struct FfmpegBackend {
    runtime: Handle,
}

impl FfmpegBackend {
    pub fn new(runtime: Handle) -> Self {
        Self { runtime }
    }

    pub fn current() -> Result<Self, PreviewError> {
        Handle::try_current()
            .map(Self::new)
            .map_err(|_| PreviewError::NoRuntime)
    }
}

impl MediaBackend for FfmpegBackend {
    fn create_headless_session(&self) -> Arc<dyn DecodingSession> {
        Arc::new(FfmpegSession::new(self.runtime.clone()))
    }
}
