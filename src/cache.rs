//! Segment preview cache.
//!
//! `PreviewCache` is the plain map plus the highest-index marker. `PreviewStore`
//! wraps it with the blob registry and a generation counter: every teardown
//! bumps the generation, and writes tagged with an older generation are
//! refused, so a capture that finishes after `cleanup()` cannot repopulate the
//! cache. No eviction: entries stay until the store is cleared.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::blob::{BlobRegistry, PreviewHandle};
use crate::segment::SegmentIndex;

#[derive(Debug, Default)]
pub struct PreviewCache {
    entries: HashMap<SegmentIndex, PreviewHandle>,
    highest: Option<SegmentIndex>,
}

impl PreviewCache {
    pub fn get(&self, index: SegmentIndex) -> Option<&PreviewHandle> {
        self.entries.get(&index)
    }

    pub fn contains(&self, index: SegmentIndex) -> bool {
        self.entries.contains_key(&index)
    }

    /// Writes only into an empty slot. On conflict the existing entry wins and
    /// a clone of it is returned.
    pub fn put(&mut self, index: SegmentIndex, handle: PreviewHandle) -> Result<(), PreviewHandle> {
        match self.entries.entry(index) {
            Entry::Occupied(existing) => Err(existing.get().clone()),
            Entry::Vacant(slot) => {
                slot.insert(handle);
                if self.highest.is_none_or(|highest| index > highest) {
                    self.highest = Some(index);
                }
                Ok(())
            }
        }
    }

    pub fn highest_cached_index(&self) -> Option<SegmentIndex> {
        self.highest
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drains every entry and resets the highest-index marker.
    pub fn take_all(&mut self) -> Vec<PreviewHandle> {
        self.highest = None;
        self.entries.drain().map(|(_, handle)| handle).collect()
    }
}

/// Outcome of storing a freshly captured preview.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreOutcome {
    Stored(PreviewHandle),
    /// Another capture got there first; its handle is kept and returned.
    AlreadyCached(PreviewHandle),
    /// Captured against a generation that has since been torn down.
    Stale,
}

impl StoreOutcome {
    pub fn into_handle(self) -> Option<PreviewHandle> {
        match self {
            StoreOutcome::Stored(handle) | StoreOutcome::AlreadyCached(handle) => Some(handle),
            StoreOutcome::Stale => None,
        }
    }
}

struct StoreState {
    cache: PreviewCache,
    generation: u64,
}

/// Shared, lock-protected cache used by both capture paths.
pub struct PreviewStore {
    state: Mutex<StoreState>,
    registry: Arc<BlobRegistry>,
}

impl PreviewStore {
    pub fn new(registry: Arc<BlobRegistry>) -> Self {
        Self {
            state: Mutex::new(StoreState {
                cache: PreviewCache::default(),
                generation: 0,
            }),
            registry,
        }
    }

    pub fn registry(&self) -> &Arc<BlobRegistry> {
        &self.registry
    }

    pub fn generation(&self) -> u64 {
        self.state.lock().generation
    }

    pub fn get(&self, index: SegmentIndex) -> Option<PreviewHandle> {
        self.state.lock().cache.get(index).cloned()
    }

    pub fn contains(&self, index: SegmentIndex) -> bool {
        self.state.lock().cache.contains(index)
    }

    pub fn len(&self) -> usize {
        self.state.lock().cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn highest_cached_index(&self) -> Option<SegmentIndex> {
        self.state.lock().cache.highest_cached_index()
    }

    pub fn store(
        &self,
        index: SegmentIndex,
        handle: PreviewHandle,
        generation: u64,
    ) -> StoreOutcome {
        let mut state = self.state.lock();
        if state.generation != generation {
            drop(state);
            log::debug!(
                target: "scrub_preview::cache",
                "discarding preview for segment {} captured before teardown",
                index
            );
            self.registry.revoke(&handle);
            return StoreOutcome::Stale;
        }
        let outcome = state.cache.put(index, handle.clone());
        drop(state);
        match outcome {
            Ok(()) => {
                log::trace!(
                    target: "scrub_preview::cache",
                    "cached segment {} -> {}",
                    index,
                    handle.url()
                );
                StoreOutcome::Stored(handle)
            }
            Err(existing) => {
                self.registry.revoke(&handle);
                StoreOutcome::AlreadyCached(existing)
            }
        }
    }

    /// Releases every cached preview and starts a new generation. Returns the new generation.
    pub fn clear(&self) -> u64 {
        let (handles, generation) = {
            let mut state = self.state.lock();
            state.generation += 1;
            (state.cache.take_all(), state.generation)
        };
        let released = handles.len();
        for handle in &handles {
            self.registry.revoke(handle);
        }
        if released > 0 {
            log::debug!(
                target: "scrub_preview::cache",
                "released {} cached preview(s)",
                released
            );
        }
        generation
    }
}
