pub mod blob;
pub mod cache;
pub mod capture;
pub mod config;
mod delayed;
pub mod error;
pub mod ffmpeg;
pub mod headless;
pub mod manager;
pub mod scheduler;
pub mod segment;
pub mod session;
pub mod sidecar_api;
mod surface;
pub mod throttle;
#[cfg(any(test, feature = "integration-test-api"))]
pub mod test_support;

pub use blob::{BlobRegistry, PreviewHandle};
pub use config::PreviewConfig;
pub use error::PreviewError;
pub use headless::StreamKind;
pub use manager::PreviewManager;
pub use scheduler::PreviewFuture;
pub use segment::SegmentIndex;
