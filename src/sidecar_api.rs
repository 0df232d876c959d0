//! Session registry behind the sidecar's `preview.*` and `playback.*` methods.
//!
//! Each open session owns one [`PreviewManager`] plus the ffmpeg-backed
//! primary session that mirrors the remote player's position.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::Deserialize;
use tokio::runtime::Handle;

use crate::blob::PreviewHandle;
use crate::config::PreviewConfig;
use crate::error::PreviewError;
use crate::ffmpeg::{FfmpegBackend, FfmpegSession};
use crate::headless::StreamKind;
use crate::manager::PreviewManager;
use crate::scheduler::SchedulerStats;
use crate::segment::SegmentIndex;
use crate::session::DecodingSession;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenParams {
    pub source_url: String,
    pub stream_kind: Option<String>,
    #[serde(default)]
    pub use_custom_request: bool,
    #[serde(default)]
    pub config: PreviewConfig,
}

#[derive(Debug, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenResult {
    pub session_id: u64,
    pub stream_kind: StreamKind,
}

#[derive(Debug, Clone, serde::Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RetrieveResult {
    pub segment_index: SegmentIndex,
    pub available: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    /// Base64 of the encoded image bytes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

impl RetrieveResult {
    pub fn new(segment_index: SegmentIndex, preview: Option<PreviewHandle>) -> Self {
        match preview {
            Some(handle) => Self {
                segment_index,
                available: true,
                url: Some(handle.url().to_string()),
                mime: Some(handle.mime()),
                width: Some(handle.width()),
                height: Some(handle.height()),
                data: Some(STANDARD.encode(handle.bytes())),
            },
            None => Self {
                segment_index,
                available: false,
                url: None,
                mime: None,
                width: None,
                height: None,
                data: None,
            },
        }
    }
}

struct HostedSession {
    manager: PreviewManager,
    primary: Arc<FfmpegSession>,
}

pub struct SidecarHost {
    runtime: Handle,
    sessions: Mutex<HashMap<u64, Arc<HostedSession>>>,
}

impl SidecarHost {
    pub fn new(runtime: Handle) -> Self {
        Self {
            runtime,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    fn session(&self, session_id: u64) -> Result<Arc<HostedSession>, PreviewError> {
        self.sessions
            .lock()
            .get(&session_id)
            .cloned()
            .ok_or_else(|| PreviewError::from(format!("Unknown sessionId: {}", session_id)))
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn open(&self, params: OpenParams) -> Result<OpenResult, PreviewError> {
        let _enter = self.runtime.enter();
        let backend = FfmpegBackend::new(self.runtime.clone());
        let primary = Arc::new(FfmpegSession::new(self.runtime.clone()));
        if !params.source_url.is_empty() {
            primary.load_source(&params.source_url);
        }
        let stream_kind =
            StreamKind::from_kind_and_url(params.stream_kind.as_deref(), &params.source_url);
        let primary_session: Arc<dyn DecodingSession> = primary.clone();
        let manager = PreviewManager::with_config(
            &backend,
            primary_session,
            Some(params.source_url.as_str()),
            stream_kind,
            params.use_custom_request,
            params.config,
        )?;

        let session_id = NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed);
        self.sessions
            .lock()
            .insert(session_id, Arc::new(HostedSession { manager, primary }));
        log::info!(
            target: "scrub_preview::sidecar",
            "opened session {} for {}",
            session_id,
            params.source_url
        );
        Ok(OpenResult {
            session_id,
            stream_kind,
        })
    }

    /// Resolves once the preview settles. The future does not borrow the host,
    /// so a session closed meanwhile resolves it as unavailable.
    pub fn retrieve(
        &self,
        session_id: u64,
        segment_index: SegmentIndex,
    ) -> Result<BoxFuture<'static, RetrieveResult>, PreviewError> {
        let session = self.session(session_id)?;
        let preview = session.manager.retrieve_preview_for_segment(segment_index);
        Ok(async move { RetrieveResult::new(segment_index, preview.await) }.boxed())
    }

    pub fn highest_cached(&self, session_id: u64) -> Result<Option<SegmentIndex>, PreviewError> {
        Ok(self.session(session_id)?.manager.highest_cached_index())
    }

    pub fn stats(&self, session_id: u64) -> Result<SchedulerStats, PreviewError> {
        Ok(self.session(session_id)?.manager.stats())
    }

    pub fn change_source(&self, session_id: u64, source_url: &str) -> Result<bool, PreviewError> {
        let session = self.session(session_id)?;
        let changed = session.manager.change_media_source(source_url)?;
        if changed {
            session.primary.load_source(source_url);
        }
        Ok(changed)
    }

    pub fn report_time(&self, session_id: u64, time: f64) -> Result<(), PreviewError> {
        self.session(session_id)?.primary.report_playback_time(time);
        Ok(())
    }

    pub fn report_seeked(&self, session_id: u64, time: f64) -> Result<(), PreviewError> {
        self.session(session_id)?.primary.report_seeked(time);
        Ok(())
    }

    /// Returns false when the session was already gone.
    pub fn close(&self, session_id: u64) -> bool {
        let Some(session) = self.sessions.lock().remove(&session_id) else {
            return false;
        };
        session.manager.cleanup();
        session.primary.clear_source();
        log::info!(
            target: "scrub_preview::sidecar",
            "closed session {}",
            session_id
        );
        true
    }

    pub fn close_all(&self) -> usize {
        let sessions: Vec<_> = self.sessions.lock().drain().collect();
        for (_, session) in &sessions {
            session.manager.cleanup();
            session.primary.clear_source();
        }
        if !sessions.is_empty() {
            log::info!(
                target: "scrub_preview::sidecar",
                "closed {} session(s)",
                sessions.len()
            );
        }
        sessions.len()
    }
}

impl Drop for SidecarHost {
    fn drop(&mut self) {
        self.close_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::BlobRegistry;

    fn empty_source() -> OpenParams {
        OpenParams {
            source_url: String::new(),
            stream_kind: None,
            use_custom_request: false,
            config: PreviewConfig::default(),
        }
    }

    #[test]
    fn open_params_accept_minimal_payload() {
        let params: OpenParams =
            serde_json::from_value(serde_json::json!({ "sourceUrl": "http://h/a.m3u8" }))
                .expect("params");
        assert_eq!(params.source_url, "http://h/a.m3u8");
        assert!(!params.use_custom_request);
        assert_eq!(params.config, PreviewConfig::default());
    }

    #[test]
    fn retrieve_result_carries_base64_image() {
        let registry = BlobRegistry::new();
        let handle = registry.register(vec![1, 2, 3], 200, 112);
        let value = serde_json::to_value(RetrieveResult::new(7, Some(handle.clone())))
            .expect("serialize");
        assert_eq!(value["segmentIndex"], 7);
        assert_eq!(value["available"], true);
        assert_eq!(value["data"], "AQID");
        assert_eq!(value["mime"], "image/webp");
        assert_eq!(value["width"], 200);
        assert_eq!(value["url"], handle.url());
    }

    #[test]
    fn unavailable_result_omits_image_fields() {
        let value = serde_json::to_value(RetrieveResult::new(3, None)).expect("serialize");
        assert_eq!(
            value,
            serde_json::json!({ "segmentIndex": 3, "available": false })
        );
    }

    #[tokio::test]
    async fn sessions_are_independent_and_closable() {
        let host = SidecarHost::new(Handle::current());
        let a = host.open(empty_source()).expect("open a");
        let b = host.open(empty_source()).expect("open b");
        assert_ne!(a.session_id, b.session_id);
        assert_eq!(host.session_count(), 2);
        assert_eq!(host.highest_cached(a.session_id).expect("highest"), None);

        assert!(host.close(a.session_id));
        assert!(!host.close(a.session_id));
        assert!(host.highest_cached(a.session_id).is_err());
        assert!(host.highest_cached(b.session_id).is_ok());

        assert_eq!(host.close_all(), 1);
        assert_eq!(host.session_count(), 0);
    }

    #[tokio::test]
    async fn unknown_session_is_an_error() {
        let host = SidecarHost::new(Handle::current());
        let err = host.retrieve(99_999, 0).err().expect("should fail");
        assert!(err.to_string().contains("Unknown sessionId"));
        assert!(host.report_time(99_999, 1.0).is_err());
    }

    #[tokio::test]
    async fn empty_source_change_is_ignored() {
        let host = SidecarHost::new(Handle::current());
        let opened = host.open(empty_source()).expect("open");
        assert!(!host.change_source(opened.session_id, "").expect("change"));
    }
}
