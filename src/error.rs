//! Crate error type. Implements Display and Serialize for sidecar responses.

use crate::ffmpeg::parse_ffmpeg_error;
use crate::session::FrameError;

#[derive(Debug, thiserror::Error)]
pub enum PreviewError {
    #[error("{0}")]
    Io(#[from] std::io::Error),

    #[error("Timed out waiting for {what}")]
    Timeout { what: &'static str },

    #[error("Decoding session reported an error")]
    SessionFailed,

    #[error("Decoding session closed")]
    SessionClosed,

    #[error("Frame capture failed: {0}")]
    Frame(#[from] FrameError),

    #[error("Image encode failed: {0}")]
    Encode(String),

    #[error("No async runtime available")]
    NoRuntime,

    #[error("{0}")]
    FfmpegNotFound(String),

    #[error("FFmpeg failed (code {code}): {stderr}")]
    FfmpegFailed { code: i32, stderr: String },

    #[error("{0}")]
    Other(String),
}

impl PreviewError {
    pub fn timeout(what: &'static str) -> Self {
        Self::Timeout { what }
    }

    pub fn ffmpeg_failed(code: i32, stderr: impl Into<String>) -> Self {
        Self::FfmpegFailed {
            code,
            stderr: stderr.into(),
        }
    }

    /// Expected runtime conditions that leave a segment uncached but retryable.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            PreviewError::Timeout { .. } | PreviewError::SessionFailed
        )
    }
}

impl serde::Serialize for PreviewError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        match self {
            PreviewError::FfmpegFailed { code, stderr } => {
                let payload = parse_ffmpeg_error(stderr, Some(*code));
                let json =
                    serde_json::json!({ "summary": payload.summary, "detail": payload.detail });
                serializer.serialize_str(&json.to_string())
            }
            _ => serializer.serialize_str(&self.to_string()),
        }
    }
}

impl From<String> for PreviewError {
    fn from(s: String) -> Self {
        PreviewError::Other(s)
    }
}

impl From<&str> for PreviewError {
    fn from(s: &str) -> Self {
        s.to_string().into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_string_is_other() {
        let e = PreviewError::from("some error message");
        match &e {
            PreviewError::Other(msg) => assert_eq!(msg, "some error message"),
            _ => panic!("expected Other"),
        }
    }

    #[test]
    fn timeout_names_the_wait() {
        let e = PreviewError::timeout("seek");
        assert_eq!(e.to_string(), "Timed out waiting for seek");
        assert!(e.is_transient());
    }

    #[test]
    fn encode_failure_is_not_transient() {
        assert!(!PreviewError::Encode("bad".into()).is_transient());
    }

    #[test]
    fn ffmpeg_failure_serializes_summary_and_detail() {
        let e = PreviewError::ffmpeg_failed(1, "Invalid data found when processing input");
        let json = serde_json::to_string(&e).expect("serialize");
        assert!(json.contains("summary"), "unexpected payload: {}", json);
        assert!(json.contains("Invalid data found"), "unexpected payload: {}", json);
    }
}
