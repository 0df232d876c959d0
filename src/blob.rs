//! In-memory object store for encoded previews.
//!
//! Each encoded image is registered under a `blob:` URL that the UI can hand to
//! an image element. Entries live until they are explicitly revoked; nothing
//! is released implicitly when a handle is dropped, so the cache must revoke
//! every handle it owns on teardown.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

pub const PREVIEW_MIME: &str = "image/webp";

static NEXT_REGISTRY_ID: AtomicU64 = AtomicU64::new(1);

/// Referenceable encoded preview. Cheap to clone; clones share the bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreviewHandle {
    url: Arc<str>,
    bytes: Arc<[u8]>,
    width: u32,
    height: u32,
}

impl PreviewHandle {
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn mime(&self) -> &'static str {
        PREVIEW_MIME
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }
}

pub struct BlobRegistry {
    prefix: String,
    next_blob_id: AtomicU64,
    blobs: Mutex<HashMap<Arc<str>, Arc<[u8]>>>,
}

impl BlobRegistry {
    pub fn new() -> Self {
        let registry_id = NEXT_REGISTRY_ID.fetch_add(1, Ordering::Relaxed);
        Self {
            prefix: format!("blob:scrub-preview/{}", registry_id),
            next_blob_id: AtomicU64::new(1),
            blobs: Mutex::new(HashMap::new()),
        }
    }

    pub fn register(&self, bytes: Vec<u8>, width: u32, height: u32) -> PreviewHandle {
        let id = self.next_blob_id.fetch_add(1, Ordering::Relaxed);
        let url: Arc<str> = Arc::from(format!("{}/{}", self.prefix, id));
        let bytes: Arc<[u8]> = Arc::from(bytes);
        self.blobs.lock().insert(Arc::clone(&url), Arc::clone(&bytes));
        PreviewHandle {
            url,
            bytes,
            width,
            height,
        }
    }

    /// Releases the backing bytes. Returns false for unknown or already revoked URLs.
    pub fn revoke(&self, handle: &PreviewHandle) -> bool {
        let removed = self.blobs.lock().remove(handle.url()).is_some();
        if removed {
            log::trace!(
                target: "scrub_preview::cache",
                "revoked {}",
                handle.url()
            );
        }
        removed
    }

    pub fn resolve(&self, url: &str) -> Option<Arc<[u8]>> {
        self.blobs.lock().get(url).cloned()
    }

    pub fn len(&self) -> usize {
        self.blobs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for BlobRegistry {
    fn default() -> Self {
        Self::new()
    }
}
