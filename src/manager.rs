//! Public facade tying cache, scheduler, capture and live throttle together.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio::runtime::Handle;

use crate::blob::{BlobRegistry, PreviewHandle};
use crate::cache::PreviewStore;
use crate::capture::CaptureEngine;
use crate::config::{PreviewConfig, StreamConfig};
use crate::error::PreviewError;
use crate::headless::{HeadlessCapture, HeadlessSession, StreamKind, thumbnail_request_url};
use crate::scheduler::{JobScheduler, PreviewFuture, SchedulerStats, settled};
use crate::segment::{SegmentClock, SegmentIndex};
use crate::session::{DecodingSession, MediaBackend};
use crate::throttle::{LiveCaptureThrottle, ThrottleContext};

struct SourceState {
    url: Option<String>,
    kind: StreamKind,
}

/// Owns every piece of preview state for one player. Multiple managers do not share anything.
pub struct PreviewManager {
    clock: SegmentClock,
    prefetch_ahead: u64,
    use_custom_request: bool,
    registry: Arc<BlobRegistry>,
    store: Arc<PreviewStore>,
    engine: Arc<CaptureEngine>,
    headless: Arc<HeadlessSession>,
    scheduler: Arc<JobScheduler>,
    throttle: LiveCaptureThrottle,
    source: Mutex<SourceState>,
    closed: AtomicBool,
}

impl PreviewManager {
    pub fn new(
        backend: &dyn MediaBackend,
        primary: Arc<dyn DecodingSession>,
        source_url: Option<&str>,
        stream_kind: StreamKind,
        use_custom_request: bool,
    ) -> Result<Self, PreviewError> {
        Self::with_config(
            backend,
            primary,
            source_url,
            stream_kind,
            use_custom_request,
            PreviewConfig::default(),
        )
    }

    /// Must be called from within a tokio runtime; jobs and the live throttle run on it.
    pub fn with_config(
        backend: &dyn MediaBackend,
        primary: Arc<dyn DecodingSession>,
        source_url: Option<&str>,
        stream_kind: StreamKind,
        use_custom_request: bool,
        config: PreviewConfig,
    ) -> Result<Self, PreviewError> {
        let runtime = Handle::try_current().map_err(|_| PreviewError::NoRuntime)?;
        let clock = SegmentClock::new(config.effective_segment_seconds());

        let registry = Arc::new(BlobRegistry::new());
        let store = Arc::new(PreviewStore::new(Arc::clone(&registry)));
        let engine = Arc::new(CaptureEngine::new(
            Arc::clone(&registry),
            config.effective_preview_width(),
            config.effective_quality(),
        ));
        let headless = Arc::new(HeadlessSession::new(
            backend.create_headless_session(),
            backend.stream_factory(),
            StreamConfig::default(),
        ));
        let executor = Arc::new(HeadlessCapture::new(
            Arc::clone(&headless),
            Arc::clone(&engine),
            clock,
            config.effective_metadata_timeout(),
            config.effective_seek_timeout(),
            config.effective_job_ready_timeout(),
        ));
        let scheduler = Arc::new(JobScheduler::new(
            config.effective_max_concurrent_jobs(),
            Arc::clone(&store),
            executor,
            runtime.clone(),
        ));
        let throttle = LiveCaptureThrottle::attach(
            primary,
            ThrottleContext {
                store: Arc::clone(&store),
                scheduler: Arc::clone(&scheduler),
                engine: Arc::clone(&engine),
                clock,
                debounce: config.effective_capture_debounce(),
                ready_timeout: config.effective_live_ready_timeout(),
            },
            runtime,
        );

        let manager = Self {
            clock,
            prefetch_ahead: config.effective_prefetch_ahead(),
            use_custom_request,
            registry,
            store,
            engine,
            headless,
            scheduler,
            throttle,
            source: Mutex::new(SourceState {
                url: None,
                kind: stream_kind,
            }),
            closed: AtomicBool::new(false),
        };
        log::info!(
            target: "scrub_preview::manager",
            "preview manager ready: {}s segments, {} concurrent job(s), prefetch {}",
            clock.segment_seconds(),
            manager.scheduler.limit(),
            manager.prefetch_ahead
        );

        if let Some(url) = source_url.filter(|url| !url.is_empty()) {
            if let Err(e) = manager.load_media_source(url) {
                log::warn!(
                    target: "scrub_preview::manager",
                    "failed to load preview source {}: {}",
                    url,
                    e
                );
            }
        }
        Ok(manager)
    }

    /// Preview for `index`, captured in the background when not cached.
    /// Also prefetches the segments that follow.
    pub fn retrieve_preview_for_segment(&self, index: SegmentIndex) -> PreviewFuture {
        if self.is_closed() {
            return settled(None);
        }
        if let Some(cached) = self.store.get(index) {
            self.scheduler.prefetch(index, self.prefetch_ahead);
            return settled(Some(cached));
        }
        if let Some(in_flight) = self.scheduler.in_flight(index) {
            return in_flight;
        }
        let future = self.scheduler.schedule(index);
        self.scheduler.prefetch(index, self.prefetch_ahead);
        future
    }

    pub fn cached_preview(&self, index: SegmentIndex) -> Option<PreviewHandle> {
        self.store.get(index)
    }

    pub fn highest_cached_index(&self) -> Option<SegmentIndex> {
        self.store.highest_cached_index()
    }

    pub fn cached_count(&self) -> usize {
        self.store.len()
    }

    pub fn time_for_segment(&self, index: SegmentIndex) -> f64 {
        self.clock.to_time(index)
    }

    pub fn segment_for_time(&self, time: f64) -> SegmentIndex {
        self.clock.to_index(time)
    }

    pub fn registry(&self) -> &Arc<BlobRegistry> {
        &self.registry
    }

    pub fn stats(&self) -> SchedulerStats {
        self.scheduler.stats()
    }

    pub fn current_source(&self) -> Option<String> {
        self.source.lock().url.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Points the headless session at `url`, recreating any adaptive stream.
    pub fn load_media_source(&self, url: &str) -> Result<(), PreviewError> {
        let kind = {
            let mut source = self.source.lock();
            source.url = Some(url.to_string());
            source.kind
        };
        let request_url = if self.use_custom_request {
            thumbnail_request_url(url)
        } else {
            url.to_string()
        };
        self.headless.load_media_source(&request_url, kind)
    }

    /// Switches to a new source, dropping every preview of the old one.
    /// Returns false for an empty or unchanged source.
    pub fn change_media_source(&self, url: &str) -> Result<bool, PreviewError> {
        if self.is_closed() || url.is_empty() {
            return Ok(false);
        }
        {
            let mut source = self.source.lock();
            if source.url.as_deref() == Some(url) {
                return Ok(false);
            }
            if source.kind == StreamKind::Native {
                source.kind = StreamKind::from_kind_and_url(None, url);
            }
        }
        let discarded = self.reset_generation();
        self.throttle.reset();
        log::info!(
            target: "scrub_preview::manager",
            "source changed to {} ({} queued job(s) discarded)",
            url,
            discarded
        );
        self.load_media_source(url)?;
        Ok(true)
    }

    /// Detaches from the primary session and releases every resource. Idempotent.
    pub fn cleanup(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.throttle.detach();
        self.headless.teardown();
        let released = self.store.len();
        let discarded = self.reset_generation();
        self.engine.reset_surface();
        self.source.lock().url = None;
        log::info!(
            target: "scrub_preview::manager",
            "preview manager cleaned up: released {} preview(s), discarded {} queued job(s)",
            released,
            discarded
        );
    }

    /// Moves scheduler and cache to a fresh generation. The scheduler goes
    /// first so a job settling in between cannot admit queued work.
    fn reset_generation(&self) -> usize {
        let next = self.store.generation() + 1;
        let discarded = self.scheduler.reset(next);
        self.store.clear();
        discarded
    }
}

impl Drop for PreviewManager {
    fn drop(&mut self) {
        self.cleanup();
    }
}
