//! Preview tuning knobs, fixed when a manager is constructed.

use std::time::Duration;

use serde::Deserialize;

pub const DEFAULT_SEGMENT_SECONDS: f64 = 4.0;
pub const DEFAULT_PREVIEW_WIDTH: u32 = 200;
pub const DEFAULT_QUALITY: f32 = 60.0;
pub const DEFAULT_MAX_CONCURRENT_JOBS: usize = 5;
pub const DEFAULT_PREFETCH_AHEAD: u64 = 10;
pub const DEFAULT_CAPTURE_DEBOUNCE_MS: u64 = 300;
pub const DEFAULT_LIVE_READY_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_JOB_READY_TIMEOUT_MS: u64 = 3_000;
pub const DEFAULT_METADATA_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_SEEK_TIMEOUT_MS: u64 = 5_000;

#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PreviewConfig {
    pub segment_seconds: Option<f64>,
    /// Every preview is rendered at this width; height follows the source aspect ratio.
    pub preview_width: Option<u32>,
    /// Lossy encoder quality, 0-100.
    pub quality: Option<f32>,
    pub max_concurrent_jobs: Option<usize>,
    pub prefetch_ahead: Option<u64>,
    pub capture_debounce_ms: Option<u64>,
    /// Readiness wait for live captures against the primary session.
    pub live_ready_timeout_ms: Option<u64>,
    /// Readiness wait for captures inside background jobs.
    pub job_ready_timeout_ms: Option<u64>,
    pub metadata_timeout_ms: Option<u64>,
    pub seek_timeout_ms: Option<u64>,
}

impl PreviewConfig {
    pub fn effective_segment_seconds(&self) -> f64 {
        self.segment_seconds
            .filter(|s| s.is_finite() && *s > 0.0)
            .unwrap_or(DEFAULT_SEGMENT_SECONDS)
    }

    pub fn effective_preview_width(&self) -> u32 {
        self.preview_width
            .filter(|w| *w > 0)
            .unwrap_or(DEFAULT_PREVIEW_WIDTH)
    }

    pub fn effective_quality(&self) -> f32 {
        self.quality
            .filter(|q| q.is_finite())
            .unwrap_or(DEFAULT_QUALITY)
            .clamp(0.0, 100.0)
    }

    pub fn effective_max_concurrent_jobs(&self) -> usize {
        self.max_concurrent_jobs
            .unwrap_or(DEFAULT_MAX_CONCURRENT_JOBS)
            .max(1)
    }

    pub fn effective_prefetch_ahead(&self) -> u64 {
        self.prefetch_ahead.unwrap_or(DEFAULT_PREFETCH_AHEAD)
    }

    pub fn effective_capture_debounce(&self) -> Duration {
        Duration::from_millis(
            self.capture_debounce_ms
                .unwrap_or(DEFAULT_CAPTURE_DEBOUNCE_MS),
        )
    }

    pub fn effective_live_ready_timeout(&self) -> Duration {
        Duration::from_millis(
            self.live_ready_timeout_ms
                .unwrap_or(DEFAULT_LIVE_READY_TIMEOUT_MS),
        )
    }

    pub fn effective_job_ready_timeout(&self) -> Duration {
        Duration::from_millis(
            self.job_ready_timeout_ms
                .unwrap_or(DEFAULT_JOB_READY_TIMEOUT_MS),
        )
    }

    pub fn effective_metadata_timeout(&self) -> Duration {
        Duration::from_millis(
            self.metadata_timeout_ms
                .unwrap_or(DEFAULT_METADATA_TIMEOUT_MS),
        )
    }

    pub fn effective_seek_timeout(&self) -> Duration {
        Duration::from_millis(self.seek_timeout_ms.unwrap_or(DEFAULT_SEEK_TIMEOUT_MS))
    }
}

/// Buffer settings handed to the adaptive-stream factory for the headless session.
/// Previews only ever need the frame under the playhead, so buffering is kept short.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamConfig {
    pub enable_worker: bool,
    pub low_latency_mode: bool,
    pub back_buffer_seconds: f64,
    pub max_buffer_seconds: f64,
    pub max_max_buffer_seconds: f64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            enable_worker: false,
            low_latency_mode: false,
            back_buffer_seconds: 0.0,
            max_buffer_seconds: 5.0,
            max_max_buffer_seconds: 10.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_constants() {
        let config = PreviewConfig::default();
        assert_eq!(config.effective_segment_seconds(), 4.0);
        assert_eq!(config.effective_preview_width(), 200);
        assert_eq!(config.effective_quality(), 60.0);
        assert_eq!(config.effective_max_concurrent_jobs(), 5);
        assert_eq!(config.effective_prefetch_ahead(), 10);
        assert_eq!(config.effective_capture_debounce(), Duration::from_millis(300));
        assert_eq!(config.effective_metadata_timeout(), Duration::from_secs(10));
        assert_eq!(config.effective_seek_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn invalid_values_fall_back_or_clamp() {
        let config = PreviewConfig {
            segment_seconds: Some(0.0),
            preview_width: Some(0),
            quality: Some(140.0),
            max_concurrent_jobs: Some(0),
            ..PreviewConfig::default()
        };
        assert_eq!(config.effective_segment_seconds(), DEFAULT_SEGMENT_SECONDS);
        assert_eq!(config.effective_preview_width(), DEFAULT_PREVIEW_WIDTH);
        assert_eq!(config.effective_quality(), 100.0);
        assert_eq!(config.effective_max_concurrent_jobs(), 1);
    }

    #[test]
    fn deserializes_camel_case_partial_payload() {
        let config: PreviewConfig =
            serde_json::from_str(r#"{"segmentSeconds": 2.5, "maxConcurrentJobs": 3}"#)
                .expect("parse config");
        assert_eq!(config.effective_segment_seconds(), 2.5);
        assert_eq!(config.effective_max_concurrent_jobs(), 3);
        assert_eq!(config.effective_prefetch_ahead(), DEFAULT_PREFETCH_AHEAD);
    }
}
