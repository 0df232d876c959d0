//! Frame capture: readiness wait, draw onto the shared surface, encode, register.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::blob::{BlobRegistry, PreviewHandle};
use crate::error::PreviewError;
use crate::session::{DecodingSession, FrameError, ReadyState, wait_for_ready_state};
use crate::surface::RenderSurface;

pub struct CaptureEngine {
    surface: Mutex<RenderSurface>,
    registry: Arc<BlobRegistry>,
    preview_width: u32,
    quality: f32,
}

impl CaptureEngine {
    pub fn new(registry: Arc<BlobRegistry>, preview_width: u32, quality: f32) -> Self {
        Self {
            surface: Mutex::new(RenderSurface::new()),
            registry,
            preview_width,
            quality,
        }
    }

    pub fn registry(&self) -> &Arc<BlobRegistry> {
        &self.registry
    }

    /// Captures the frame currently shown by `session`.
    ///
    /// `Ok(None)` means "no preview this time": the session never reached
    /// current-data readiness, has no video dimensions, or its pixels are not
    /// readable. Only unexpected draw/encode failures are errors.
    pub async fn capture(
        &self,
        session: &dyn DecodingSession,
        ready_timeout: Duration,
    ) -> Result<Option<PreviewHandle>, PreviewError> {
        if let Err(e) =
            wait_for_ready_state(session, ReadyState::HaveCurrentData, ready_timeout).await
        {
            log::debug!(
                target: "scrub_preview::capture",
                "session not ready at {:.3}s: {}",
                session.current_time(),
                e
            );
            return Ok(None);
        }

        let (src_w, src_h) = session.video_size();
        if src_w == 0 || src_h == 0 {
            log::debug!(
                target: "scrub_preview::capture",
                "session has no video dimensions yet"
            );
            return Ok(None);
        }

        // Configure, draw and encode under one lock with no await in between,
        // so concurrent captures cannot interleave on the surface.
        let encoded = {
            let mut surface = self.surface.lock();
            surface.configure(self.preview_width, src_w, src_h);
            let frame = match session.read_frame() {
                Ok(frame) => frame,
                Err(FrameError::CrossOrigin) => {
                    log::warn!(
                        target: "scrub_preview::capture",
                        "cannot read frame pixels from a cross-origin source"
                    );
                    return Ok(None);
                }
                Err(FrameError::Unavailable) => {
                    log::debug!(
                        target: "scrub_preview::capture",
                        "no frame available at {:.3}s",
                        session.current_time()
                    );
                    return Ok(None);
                }
                Err(e) => return Err(e.into()),
            };
            surface.draw(frame)?;
            let bytes = surface.encode(self.quality)?;
            (bytes, surface.width(), surface.height())
        };

        let (bytes, width, height) = encoded;
        let size = bytes.len();
        let handle = self.registry.register(bytes, width, height);
        log::trace!(
            target: "scrub_preview::capture",
            "captured {}x{} preview ({} bytes) at {:.3}s",
            width,
            height,
            size,
            session.current_time()
        );
        Ok(Some(handle))
    }

    pub fn reset_surface(&self) {
        self.surface.lock().reset();
    }

    pub fn surface_resizes(&self) -> u64 {
        self.surface.lock().resizes()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::test_support::FakeSession;

    fn engine() -> CaptureEngine {
        CaptureEngine::new(Arc::new(BlobRegistry::new()), 200, 60.0)
    }

    #[tokio::test(start_paused = true)]
    async fn captures_and_registers_preview() {
        let engine = engine();
        let session = FakeSession::new(320, 180);
        session.set_ready_state(ReadyState::HaveEnoughData);

        let handle = engine
            .capture(&*session, Duration::from_secs(3))
            .await
            .expect("capture")
            .expect("preview");
        assert_eq!((handle.width(), handle.height()), (200, 112));
        assert_eq!(handle.mime(), "image/webp");
        assert!(engine.registry().resolve(handle.url()).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn readiness_timeout_yields_none() {
        let engine = engine();
        let session = FakeSession::new(320, 180);
        session.set_ready_state(ReadyState::HaveMetadata);

        let result = engine
            .capture(&*session, Duration::from_secs(3))
            .await
            .expect("no error");
        assert!(result.is_none());
        assert!(engine.registry().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn zero_dimensions_yield_none() {
        let engine = engine();
        let session = FakeSession::new(0, 0);
        session.set_ready_state(ReadyState::HaveEnoughData);

        let result = engine.capture(&*session, Duration::from_secs(3)).await;
        assert!(matches!(result, Ok(None)));
        assert_eq!(engine.surface_resizes(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cross_origin_frame_yields_none() {
        let engine = engine();
        let session = FakeSession::new(320, 180);
        session.set_ready_state(ReadyState::HaveEnoughData);
        session.set_frame_error(Some(crate::test_support::FrameFailure::CrossOrigin));

        let result = engine.capture(&*session, Duration::from_secs(3)).await;
        assert!(matches!(result, Ok(None)));
    }

    #[tokio::test(start_paused = true)]
    async fn backend_frame_failure_is_an_error() {
        let engine = engine();
        let session = FakeSession::new(320, 180);
        session.set_ready_state(ReadyState::HaveEnoughData);
        session.set_frame_error(Some(crate::test_support::FrameFailure::Backend));

        let result = engine.capture(&*session, Duration::from_secs(3)).await;
        assert!(matches!(result, Err(PreviewError::Frame(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn surface_is_reused_across_captures() {
        let engine = engine();
        let session = FakeSession::new(320, 180);
        session.set_ready_state(ReadyState::HaveEnoughData);
        for _ in 0..3 {
            engine
                .capture(&*session, Duration::from_secs(3))
                .await
                .expect("capture");
        }
        assert_eq!(engine.surface_resizes(), 1);
    }
}
