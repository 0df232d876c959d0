//! Private headless decoding session used by background jobs.

use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;

use crate::blob::PreviewHandle;
use crate::capture::CaptureEngine;
use crate::config::StreamConfig;
use crate::error::PreviewError;
use crate::scheduler::SegmentCapture;
use crate::segment::{SegmentClock, SegmentIndex};
use crate::session::{
    AdaptiveStream, DecodingSession, HLS_MIME, StreamFactory, seek_and_wait, wait_for_metadata,
};

/// How the media source is delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    #[default]
    Native,
    Hls,
}

impl StreamKind {
    /// `"hls"` (any case) or a `.m3u8` URL path selects HLS; anything else is native.
    pub fn from_kind_and_url(kind: Option<&str>, url: &str) -> Self {
        if kind.is_some_and(|k| k.eq_ignore_ascii_case("hls")) || is_hls_url(url) {
            StreamKind::Hls
        } else {
            StreamKind::Native
        }
    }
}

fn is_hls_url(url: &str) -> bool {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    path.to_ascii_lowercase().ends_with(".m3u8")
}

/// Marks the request as a thumbnail fetch so the server can serve it cheaply.
pub fn thumbnail_request_url(url: &str) -> String {
    let (base, fragment) = match url.split_once('#') {
        Some((base, fragment)) => (base, Some(fragment)),
        None => (url, None),
    };
    let separator = if base.contains('?') { '&' } else { '?' };
    match fragment {
        Some(fragment) => format!("{}{}thumbnail=true#{}", base, separator, fragment),
        None => format!("{}{}thumbnail=true", base, separator),
    }
}

struct HeadlessState {
    stream: Option<Box<dyn AdaptiveStream>>,
    source: Option<String>,
    kind: StreamKind,
}

pub struct HeadlessSession {
    session: Arc<dyn DecodingSession>,
    factory: Option<Arc<dyn StreamFactory>>,
    stream_config: StreamConfig,
    state: parking_lot::Mutex<HeadlessState>,
}

impl HeadlessSession {
    pub fn new(
        session: Arc<dyn DecodingSession>,
        factory: Option<Arc<dyn StreamFactory>>,
        stream_config: StreamConfig,
    ) -> Self {
        session.prepare_headless();
        Self {
            session,
            factory,
            stream_config,
            state: parking_lot::Mutex::new(HeadlessState {
                stream: None,
                source: None,
                kind: StreamKind::Native,
            }),
        }
    }

    pub fn session(&self) -> &Arc<dyn DecodingSession> {
        &self.session
    }

    pub fn source(&self) -> Option<String> {
        self.state.lock().source.clone()
    }

    pub fn kind(&self) -> StreamKind {
        self.state.lock().kind
    }

    pub fn has_stream(&self) -> bool {
        self.state.lock().stream.is_some()
    }

    /// Points the session at `url`, replacing any adaptive stream from a previous source.
    pub fn load_media_source(&self, url: &str, kind: StreamKind) -> Result<(), PreviewError> {
        let mut state = self.state.lock();
        self.load_locked(&mut state, url, kind)
    }

    /// Reloads the current source when the session's last load failed.
    /// Returns whether a reload was started.
    pub fn retry_failed_load(&self) -> Result<bool, PreviewError> {
        let mut state = self.state.lock();
        if !self.session.has_load_error() {
            return Ok(false);
        }
        let Some(url) = state.source.clone() else {
            return Ok(false);
        };
        let kind = state.kind;
        log::info!(
            target: "scrub_preview::manager",
            "retrying failed load of {}",
            url
        );
        self.load_locked(&mut state, &url, kind)?;
        Ok(true)
    }

    fn load_locked(
        &self,
        state: &mut HeadlessState,
        url: &str,
        kind: StreamKind,
    ) -> Result<(), PreviewError> {
        if let Some(mut previous) = state.stream.take() {
            previous.destroy();
        }
        state.source = Some(url.to_string());
        state.kind = kind;

        match kind {
            StreamKind::Hls => {
                if let Some(factory) = &self.factory {
                    let mut stream = factory.create(&self.stream_config)?;
                    let attached = stream
                        .load_source(url)
                        .and_then(|()| stream.attach(Arc::clone(&self.session)));
                    if let Err(e) = attached {
                        stream.destroy();
                        return Err(e);
                    }
                    state.stream = Some(stream);
                    log::info!(
                        target: "scrub_preview::manager",
                        "headless session attached to adaptive stream {}",
                        url
                    );
                } else if self.session.can_play_type(HLS_MIME) {
                    self.session.load_source(url);
                    log::info!(
                        target: "scrub_preview::manager",
                        "headless session playing HLS natively from {}",
                        url
                    );
                } else {
                    self.session.clear_source();
                    log::warn!(
                        target: "scrub_preview::manager",
                        "HLS not supported for thumbnails"
                    );
                }
            }
            StreamKind::Native => {
                self.session.load_source(url);
                log::info!(
                    target: "scrub_preview::manager",
                    "headless session loading {}",
                    url
                );
            }
        }
        Ok(())
    }

    /// Destroys the adaptive stream and unloads the source.
    pub fn teardown(&self) {
        let stream = {
            let mut state = self.state.lock();
            state.source = None;
            state.stream.take()
        };
        if let Some(mut stream) = stream {
            stream.destroy();
        }
        self.session.clear_source();
    }
}

/// Background capture: seek the headless session to the segment start and capture it.
pub struct HeadlessCapture {
    headless: Arc<HeadlessSession>,
    engine: Arc<CaptureEngine>,
    clock: SegmentClock,
    // The decoder has one playhead; seek + capture must not interleave.
    position: tokio::sync::Mutex<()>,
    metadata_timeout: Duration,
    seek_timeout: Duration,
    ready_timeout: Duration,
}

impl HeadlessCapture {
    pub fn new(
        headless: Arc<HeadlessSession>,
        engine: Arc<CaptureEngine>,
        clock: SegmentClock,
        metadata_timeout: Duration,
        seek_timeout: Duration,
        ready_timeout: Duration,
    ) -> Self {
        Self {
            headless,
            engine,
            clock,
            position: tokio::sync::Mutex::new(()),
            metadata_timeout,
            seek_timeout,
            ready_timeout,
        }
    }

    async fn capture_at(
        &self,
        index: SegmentIndex,
    ) -> Result<Option<PreviewHandle>, PreviewError> {
        let session = self.headless.session();
        self.headless.retry_failed_load()?;
        wait_for_metadata(session.as_ref(), self.metadata_timeout).await?;

        let _lease = self.position.lock().await;
        let time = self.clock.to_time(index);
        seek_and_wait(session.as_ref(), time, self.seek_timeout).await?;
        self.engine
            .capture(session.as_ref(), self.ready_timeout)
            .await
    }
}

impl SegmentCapture for HeadlessCapture {
    fn capture_segment(
        &self,
        index: SegmentIndex,
    ) -> BoxFuture<'_, Result<Option<PreviewHandle>, PreviewError>> {
        self.capture_at(index).boxed()
    }
}
