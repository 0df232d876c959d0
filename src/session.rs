//! Decoding-session capability surface and bounded readiness waits.
//!
//! The core never decodes video itself. It drives an external playback
//! primitive through `DecodingSession` (load, seek, readiness, frame read,
//! events) and, for segmented streams, an `AdaptiveStream` created by a
//! `StreamFactory`.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

use crate::config::StreamConfig;
use crate::error::PreviewError;

pub const HLS_MIME: &str = "application/vnd.apple.mpegurl";

/// Decode readiness, ordered like HTML media `readyState`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ReadyState {
    HaveNothing = 0,
    HaveMetadata = 1,
    HaveCurrentData = 2,
    HaveFutureData = 3,
    HaveEnoughData = 4,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    LoadedMetadata,
    CanPlay,
    CanPlayThrough,
    Seeking,
    Seeked,
    TimeUpdate,
    Error,
}

/// One decoded frame, tightly packed RGBA8.
#[derive(Debug, Clone, PartialEq)]
pub struct VideoFrame {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The source is cross-origin and its pixels cannot be read back.
    #[error("Frame pixels are not readable (cross-origin source)")]
    CrossOrigin,

    #[error("No decoded frame available")]
    Unavailable,

    #[error("{0}")]
    Backend(String),
}

/// Playback primitive driven by the preview core.
pub trait DecodingSession: Send + Sync {
    fn ready_state(&self) -> ReadyState;

    fn current_time(&self) -> f64;

    /// Starts a seek. Completion is signalled by `SessionEvent::Seeked`.
    fn set_current_time(&self, time: f64);

    /// Intrinsic video dimensions; `(0, 0)` until known or when there is no video track.
    fn video_size(&self) -> (u32, u32);

    fn subscribe(&self) -> broadcast::Receiver<SessionEvent>;

    /// Reads the frame at the current position.
    fn read_frame(&self) -> Result<VideoFrame, FrameError>;

    fn load_source(&self, url: &str);

    fn clear_source(&self);

    fn can_play_type(&self, mime: &str) -> bool;

    /// The last source load failed and nothing is loading now.
    fn has_load_error(&self) -> bool {
        false
    }

    /// Muted, paused at rate 0, anonymous cross-origin, metadata preload.
    fn prepare_headless(&self) {}
}

/// Segmented-streaming session (HLS) that feeds a decoding session.
pub trait AdaptiveStream: Send {
    fn load_source(&mut self, url: &str) -> Result<(), PreviewError>;

    fn attach(&mut self, session: Arc<dyn DecodingSession>) -> Result<(), PreviewError>;

    fn destroy(&mut self);
}

pub trait StreamFactory: Send + Sync {
    fn create(&self, config: &StreamConfig) -> Result<Box<dyn AdaptiveStream>, PreviewError>;
}

/// Supplies the private headless session and, optionally, adaptive streaming.
pub trait MediaBackend: Send + Sync {
    fn create_headless_session(&self) -> Arc<dyn DecodingSession>;

    fn stream_factory(&self) -> Option<Arc<dyn StreamFactory>> {
        None
    }
}

/// Waits until `session` reports at least `min`. Re-checks on every event.
pub async fn wait_for_ready_state(
    session: &dyn DecodingSession,
    min: ReadyState,
    timeout: Duration,
) -> Result<(), PreviewError> {
    let mut events = session.subscribe();
    if session.ready_state() >= min {
        return Ok(());
    }
    let wait = async {
        loop {
            match events.recv().await {
                Ok(_) | Err(RecvError::Lagged(_)) => {
                    if session.ready_state() >= min {
                        return Ok(());
                    }
                }
                Err(RecvError::Closed) => return Err(PreviewError::SessionClosed),
            }
        }
    };
    tokio::time::timeout(timeout, wait)
        .await
        .map_err(|_| PreviewError::timeout("ready state"))?
}

/// Waits for metadata; an error event or a failed load fails the wait immediately.
pub async fn wait_for_metadata(
    session: &dyn DecodingSession,
    timeout: Duration,
) -> Result<(), PreviewError> {
    let mut events = session.subscribe();
    if session.ready_state() >= ReadyState::HaveMetadata {
        return Ok(());
    }
    if session.has_load_error() {
        return Err(PreviewError::SessionFailed);
    }
    let wait = async {
        loop {
            match events.recv().await {
                Ok(SessionEvent::Error) => return Err(PreviewError::SessionFailed),
                Ok(_) | Err(RecvError::Lagged(_)) => {
                    if session.ready_state() >= ReadyState::HaveMetadata {
                        return Ok(());
                    }
                }
                Err(RecvError::Closed) => return Err(PreviewError::SessionClosed),
            }
        }
    };
    tokio::time::timeout(timeout, wait)
        .await
        .map_err(|_| PreviewError::timeout("video metadata"))?
}

/// Sets the playback position and waits for the matching `Seeked` event.
pub async fn seek_and_wait(
    session: &dyn DecodingSession,
    time: f64,
    timeout: Duration,
) -> Result<(), PreviewError> {
    let mut events = session.subscribe();
    session.set_current_time(time);
    let wait = async {
        loop {
            match events.recv().await {
                Ok(SessionEvent::Seeked) => return Ok(()),
                Ok(SessionEvent::Error) => return Err(PreviewError::SessionFailed),
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => return Err(PreviewError::SessionClosed),
            }
        }
    };
    tokio::time::timeout(timeout, wait)
        .await
        .map_err(|_| PreviewError::timeout("seek"))?
}
