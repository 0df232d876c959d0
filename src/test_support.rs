//! Scripted fakes exposed for unit tests and integration test targets.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::broadcast;

use crate::blob::{BlobRegistry, PreviewHandle};
use crate::config::StreamConfig;
use crate::error::PreviewError;
use crate::scheduler::SegmentCapture;
use crate::segment::SegmentIndex;
use crate::session::{
    AdaptiveStream, DecodingSession, FrameError, HLS_MIME, MediaBackend, ReadyState,
    SessionEvent, StreamFactory, VideoFrame,
};

/// How a `FakeSession` answers `set_current_time`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekBehavior {
    Immediate,
    Delay(Duration),
    Stall,
    Fail,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameFailure {
    CrossOrigin,
    Unavailable,
    Backend,
}

struct FakeState {
    ready: ReadyState,
    time: f64,
    size: (u32, u32),
    seek_behavior: SeekBehavior,
    failing_seeks: u32,
    frame_failure: Option<FrameFailure>,
    native_hls: bool,
    failing_loads: u32,
    load_error: bool,
    source: Option<String>,
    loaded: Vec<String>,
    seeks: Vec<f64>,
    frames: Vec<f64>,
}

/// In-memory decoding session. Loading a source makes it fully ready.
pub struct FakeSession {
    state: Mutex<FakeState>,
    events: broadcast::Sender<SessionEvent>,
    prepared: AtomicBool,
}

impl FakeSession {
    pub fn new(width: u32, height: u32) -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        Arc::new(Self {
            state: Mutex::new(FakeState {
                ready: ReadyState::HaveNothing,
                time: 0.0,
                size: (width, height),
                seek_behavior: SeekBehavior::Immediate,
                failing_seeks: 0,
                frame_failure: None,
                native_hls: false,
                failing_loads: 0,
                load_error: false,
                source: None,
                loaded: Vec::new(),
                seeks: Vec::new(),
                frames: Vec::new(),
            }),
            events,
            prepared: AtomicBool::new(false),
        })
    }

    pub fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    /// Changes readiness without emitting anything.
    pub fn set_ready_state(&self, ready: ReadyState) {
        self.state.lock().ready = ready;
    }

    pub fn become_ready(&self, ready: ReadyState) {
        self.set_ready_state(ready);
        self.emit(SessionEvent::LoadedMetadata);
        self.emit(SessionEvent::CanPlay);
    }

    pub fn set_seek_behavior(&self, behavior: SeekBehavior) {
        self.state.lock().seek_behavior = behavior;
    }

    /// The next `count` seeks report an error instead of completing.
    pub fn fail_next_seeks(&self, count: u32) {
        self.state.lock().failing_seeks = count;
    }

    /// The next `count` source loads fail before metadata arrives.
    pub fn fail_next_loads(&self, count: u32) {
        self.state.lock().failing_loads = count;
    }

    pub fn set_frame_error(&self, failure: Option<FrameFailure>) {
        self.state.lock().frame_failure = failure;
    }

    pub fn set_native_hls(&self, supported: bool) {
        self.state.lock().native_hls = supported;
    }

    /// Playback progress on a primary session.
    pub fn play_to(&self, time: f64) {
        self.state.lock().time = time;
        self.emit(SessionEvent::TimeUpdate);
    }

    /// User-initiated seek on a primary session. Not recorded in `seek_log`.
    pub fn user_seek(&self, time: f64) {
        self.state.lock().time = time;
        self.emit(SessionEvent::Seeking);
        self.emit(SessionEvent::Seeked);
    }

    pub fn is_prepared(&self) -> bool {
        self.prepared.load(Ordering::SeqCst)
    }

    pub fn loaded_sources(&self) -> Vec<String> {
        self.state.lock().loaded.clone()
    }

    pub fn seek_log(&self) -> Vec<f64> {
        self.state.lock().seeks.clone()
    }

    /// Playback positions at which frames were read.
    pub fn frame_times(&self) -> Vec<f64> {
        self.state.lock().frames.clone()
    }

    pub fn frames_read(&self) -> usize {
        self.state.lock().frames.len()
    }
}

impl DecodingSession for FakeSession {
    fn ready_state(&self) -> ReadyState {
        self.state.lock().ready
    }

    fn current_time(&self) -> f64 {
        self.state.lock().time
    }

    fn set_current_time(&self, time: f64) {
        let (behavior, fail) = {
            let mut state = self.state.lock();
            state.time = time;
            state.seeks.push(time);
            let fail = state.failing_seeks > 0;
            if fail {
                state.failing_seeks -= 1;
            }
            (state.seek_behavior, fail)
        };
        self.emit(SessionEvent::Seeking);
        if fail {
            self.emit(SessionEvent::Error);
            return;
        }
        match behavior {
            SeekBehavior::Immediate => self.emit(SessionEvent::Seeked),
            SeekBehavior::Delay(delay) => match tokio::runtime::Handle::try_current() {
                Ok(runtime) => {
                    let events = self.events.clone();
                    runtime.spawn(async move {
                        tokio::time::sleep(delay).await;
                        let _ = events.send(SessionEvent::Seeked);
                    });
                }
                Err(_) => self.emit(SessionEvent::Seeked),
            },
            SeekBehavior::Stall => {}
            SeekBehavior::Fail => self.emit(SessionEvent::Error),
        }
    }

    fn video_size(&self) -> (u32, u32) {
        self.state.lock().size
    }

    fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    fn read_frame(&self) -> Result<VideoFrame, FrameError> {
        let mut state = self.state.lock();
        match state.frame_failure {
            Some(FrameFailure::CrossOrigin) => return Err(FrameError::CrossOrigin),
            Some(FrameFailure::Unavailable) => return Err(FrameError::Unavailable),
            Some(FrameFailure::Backend) => {
                return Err(FrameError::Backend("scripted decoder failure".into()));
            }
            None => {}
        }
        let (width, height) = state.size;
        if width == 0 || height == 0 {
            return Err(FrameError::Unavailable);
        }
        let time = state.time;
        state.frames.push(time);
        let shade = ((time * 10.0) as u64 % 255) as u8;
        Ok(VideoFrame {
            width,
            height,
            data: vec![shade; (width * height * 4) as usize],
        })
    }

    fn load_source(&self, url: &str) {
        let fail = {
            let mut state = self.state.lock();
            state.source = Some(url.to_string());
            state.loaded.push(url.to_string());
            let fail = state.failing_loads > 0;
            if fail {
                state.failing_loads -= 1;
                state.ready = ReadyState::HaveNothing;
            } else {
                state.ready = ReadyState::HaveEnoughData;
            }
            state.load_error = fail;
            fail
        };
        if fail {
            self.emit(SessionEvent::Error);
            return;
        }
        self.emit(SessionEvent::LoadedMetadata);
        self.emit(SessionEvent::CanPlay);
        self.emit(SessionEvent::CanPlayThrough);
    }

    fn clear_source(&self) {
        let mut state = self.state.lock();
        state.source = None;
        state.ready = ReadyState::HaveNothing;
        state.load_error = false;
    }

    fn can_play_type(&self, mime: &str) -> bool {
        mime == HLS_MIME && self.state.lock().native_hls
    }

    fn has_load_error(&self) -> bool {
        self.state.lock().load_error
    }

    fn prepare_headless(&self) {
        self.prepared.store(true, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, Default)]
pub struct StreamLog {
    pub created: usize,
    pub destroyed: usize,
    pub attached: usize,
    pub loaded: Vec<String>,
    pub configs: Vec<StreamConfig>,
}

/// Adaptive-stream factory whose streams feed the attached session directly.
#[derive(Default)]
pub struct FakeStreamFactory {
    log: Arc<Mutex<StreamLog>>,
}

impl FakeStreamFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn log(&self) -> StreamLog {
        self.log.lock().clone()
    }
}

struct FakeStream {
    log: Arc<Mutex<StreamLog>>,
    url: Option<String>,
}

impl AdaptiveStream for FakeStream {
    fn load_source(&mut self, url: &str) -> Result<(), PreviewError> {
        self.log.lock().loaded.push(url.to_string());
        self.url = Some(url.to_string());
        Ok(())
    }

    fn attach(&mut self, session: Arc<dyn DecodingSession>) -> Result<(), PreviewError> {
        let url = self
            .url
            .as_deref()
            .ok_or_else(|| PreviewError::from("stream attached before load"))?;
        self.log.lock().attached += 1;
        session.load_source(url);
        Ok(())
    }

    fn destroy(&mut self) {
        self.log.lock().destroyed += 1;
    }
}

impl StreamFactory for FakeStreamFactory {
    fn create(&self, config: &StreamConfig) -> Result<Box<dyn AdaptiveStream>, PreviewError> {
        {
            let mut log = self.log.lock();
            log.created += 1;
            log.configs.push(config.clone());
        }
        Ok(Box::new(FakeStream {
            log: Arc::clone(&self.log),
            url: None,
        }))
    }
}

/// Backend handing out one `FakeSession` as the headless session.
pub struct FakeBackend {
    headless: Arc<FakeSession>,
    factory: Option<Arc<FakeStreamFactory>>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self {
            headless: FakeSession::new(640, 360),
            factory: None,
        }
    }

    pub fn with_stream_factory() -> Self {
        Self {
            headless: FakeSession::new(640, 360),
            factory: Some(Arc::new(FakeStreamFactory::new())),
        }
    }

    pub fn headless(&self) -> Arc<FakeSession> {
        Arc::clone(&self.headless)
    }

    pub fn stream_log(&self) -> Option<StreamLog> {
        self.factory.as_ref().map(|factory| factory.log())
    }
}

impl Default for FakeBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MediaBackend for FakeBackend {
    fn create_headless_session(&self) -> Arc<dyn DecodingSession> {
        self.headless.clone()
    }

    fn stream_factory(&self) -> Option<Arc<dyn StreamFactory>> {
        self.factory
            .as_ref()
            .map(|factory| Arc::clone(factory) as Arc<dyn StreamFactory>)
    }
}

/// Segment capture that sleeps, then registers a small placeholder preview.
pub struct ScriptedCapture {
    registry: Arc<BlobRegistry>,
    delay: Duration,
    calls: Mutex<Vec<SegmentIndex>>,
    failures: Mutex<HashMap<SegmentIndex, u32>>,
    panics: Mutex<HashSet<SegmentIndex>>,
    running: AtomicUsize,
    peak: AtomicUsize,
}

impl ScriptedCapture {
    pub fn new(registry: Arc<BlobRegistry>, delay: Duration) -> Self {
        Self {
            registry,
            delay,
            calls: Mutex::new(Vec::new()),
            failures: Mutex::new(HashMap::new()),
            panics: Mutex::new(HashSet::new()),
            running: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    pub fn registry(&self) -> &Arc<BlobRegistry> {
        &self.registry
    }

    /// The next `count` captures of `index` fail with a timeout.
    pub fn fail_next(&self, index: SegmentIndex, count: u32) {
        self.failures.lock().insert(index, count);
    }

    pub fn panic_on(&self, index: SegmentIndex) {
        self.panics.lock().insert(index);
    }

    pub fn call_log(&self) -> Vec<SegmentIndex> {
        self.calls.lock().clone()
    }

    pub fn calls_for(&self, index: SegmentIndex) -> usize {
        self.calls.lock().iter().filter(|&&i| i == index).count()
    }

    pub fn peak_running(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

impl SegmentCapture for ScriptedCapture {
    fn capture_segment(
        &self,
        index: SegmentIndex,
    ) -> BoxFuture<'_, Result<Option<PreviewHandle>, PreviewError>> {
        self.calls.lock().push(index);
        async move {
            let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(running, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.running.fetch_sub(1, Ordering::SeqCst);

            if self.panics.lock().contains(&index) {
                panic!("scripted panic for segment {}", index);
            }
            let fail = {
                let mut failures = self.failures.lock();
                match failures.get_mut(&index) {
                    Some(remaining) if *remaining > 0 => {
                        *remaining -= 1;
                        true
                    }
                    _ => false,
                }
            };
            if fail {
                return Err(PreviewError::timeout("seek"));
            }
            Ok(Some(self.registry.register(vec![index as u8; 16], 200, 112)))
        }
        .boxed()
    }
}
