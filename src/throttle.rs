//! Live capture from the primary session while it plays.
//!
//! Progress events arm a short debounce; when it fires, the frame currently
//! shown by the primary session is captured for its segment. No seeks are
//! issued against the primary session.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

use crate::cache::PreviewStore;
use crate::capture::CaptureEngine;
use crate::delayed::DelayedTask;
use crate::scheduler::JobScheduler;
use crate::segment::{SegmentClock, SegmentIndex};
use crate::session::{DecodingSession, SessionEvent};

/// Collaborators the throttle shares with the manager.
#[derive(Clone)]
pub struct ThrottleContext {
    pub store: Arc<PreviewStore>,
    pub scheduler: Arc<JobScheduler>,
    pub engine: Arc<CaptureEngine>,
    pub clock: SegmentClock,
    pub debounce: Duration,
    pub ready_timeout: Duration,
}

#[derive(Debug, Default)]
struct ThrottleState {
    last_known_time: f64,
    last_captured: Option<SegmentIndex>,
}

struct Shared {
    primary: Arc<dyn DecodingSession>,
    ctx: ThrottleContext,
    state: Mutex<ThrottleState>,
    pending: DelayedTask,
}

pub struct LiveCaptureThrottle {
    shared: Arc<Shared>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl LiveCaptureThrottle {
    /// Subscribes to `primary` and starts reacting to seek and progress events.
    pub fn attach(primary: Arc<dyn DecodingSession>, ctx: ThrottleContext, runtime: Handle) -> Self {
        let mut events = primary.subscribe();
        let shared = Arc::new(Shared {
            state: Mutex::new(ThrottleState {
                last_known_time: primary.current_time(),
                last_captured: None,
            }),
            pending: DelayedTask::new(runtime.clone()),
            primary,
            ctx,
        });

        let listener = {
            let shared = Arc::clone(&shared);
            runtime.spawn(async move {
                loop {
                    match events.recv().await {
                        Ok(SessionEvent::Seeked) => shared.on_seeked(),
                        Ok(SessionEvent::TimeUpdate) => shared.on_time_update(),
                        Ok(_) => {}
                        Err(RecvError::Lagged(skipped)) => {
                            log::trace!(
                                target: "scrub_preview::throttle",
                                "skipped {} playback event(s)",
                                skipped
                            );
                        }
                        Err(RecvError::Closed) => break,
                    }
                }
            })
        };

        Self {
            shared,
            listener: Mutex::new(Some(listener)),
        }
    }

    /// Forgets the last captured segment and drops any pending capture.
    pub fn reset(&self) {
        self.shared.state.lock().last_captured = None;
        self.shared.pending.cancel();
    }

    /// Cancels the pending capture and stops listening. Safe to call twice.
    pub fn detach(&self) {
        self.shared.pending.cancel();
        if let Some(listener) = self.listener.lock().take() {
            listener.abort();
            log::debug!(
                target: "scrub_preview::throttle",
                "detached from primary session"
            );
        }
    }

    pub fn last_captured(&self) -> Option<SegmentIndex> {
        self.shared.state.lock().last_captured
    }

    pub fn is_capture_pending(&self) -> bool {
        self.shared.pending.is_pending()
    }
}

impl Drop for LiveCaptureThrottle {
    fn drop(&mut self) {
        self.detach();
    }
}

impl Shared {
    fn on_seeked(&self) {
        let now = self.primary.current_time();
        if !now.is_finite() {
            return;
        }
        let jumped = {
            let mut state = self.state.lock();
            let jump = self.ctx.clock.distance(now, state.last_known_time);
            state.last_known_time = now;
            if jump > 1 {
                state.last_captured = None;
                Some(jump)
            } else {
                None
            }
        };
        if let Some(jump) = jumped {
            self.pending.cancel();
            log::info!(
                target: "scrub_preview::throttle",
                "seek discontinuity of {} segment(s) to {:.3}s",
                jump,
                now
            );
        }
    }

    fn on_time_update(self: &Arc<Self>) {
        // Live streams may report an unbounded position; there is no segment to capture.
        let now = self.primary.current_time();
        if !now.is_finite() {
            return;
        }
        let index = self.ctx.clock.to_index(now);
        {
            let mut state = self.state.lock();
            state.last_known_time = now;
            if state.last_captured == Some(index) {
                return;
            }
        }
        if self.ctx.store.contains(index) {
            return;
        }
        let shared = Arc::clone(self);
        self.pending.schedule(self.ctx.debounce, async move {
            shared.capture_live(index).await;
        });
    }

    async fn capture_live(&self, index: SegmentIndex) {
        let ctx = &self.ctx;
        if ctx.store.contains(index) {
            return;
        }
        if ctx.clock.to_index(self.primary.current_time()) != index {
            log::trace!(
                target: "scrub_preview::throttle",
                "playhead left segment {} before capture",
                index
            );
            return;
        }
        let Some(claim) = ctx.scheduler.begin_external(index) else {
            return;
        };

        match ctx.engine.capture(self.primary.as_ref(), ctx.ready_timeout).await {
            Ok(Some(handle)) => {
                let stored = ctx.store.store(index, handle, claim.generation()).into_handle();
                if stored.is_some() {
                    self.state.lock().last_captured = Some(index);
                    log::trace!(
                        target: "scrub_preview::throttle",
                        "live capture stored segment {}",
                        index
                    );
                }
                claim.settle(stored);
            }
            Ok(None) => claim.settle(None),
            Err(e) => {
                log::warn!(
                    target: "scrub_preview::throttle",
                    "live capture for segment {} failed: {}",
                    index,
                    e
                );
                claim.settle(None);
            }
        }
    }
}
