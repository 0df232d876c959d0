//! Single-slot delayed task: scheduling replaces whatever is still waiting.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

struct Pending {
    id: u64,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct Slot {
    next_id: u64,
    pending: Option<Pending>,
}

pub struct DelayedTask {
    slot: Arc<Mutex<Slot>>,
    runtime: Handle,
}

impl DelayedTask {
    pub fn new(runtime: Handle) -> Self {
        Self {
            slot: Arc::new(Mutex::new(Slot::default())),
            runtime,
        }
    }

    /// Runs `work` after `delay` unless cancelled or replaced first.
    /// Once the delay elapses the work leaves the slot and is no longer cancellable.
    pub fn schedule<F>(&self, delay: Duration, work: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut slot = self.slot.lock();
        if let Some(previous) = slot.pending.take() {
            previous.task.abort();
        }
        slot.next_id += 1;
        let id = slot.next_id;
        let shared = Arc::clone(&self.slot);
        let task = self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let mut slot = shared.lock();
                match &slot.pending {
                    Some(pending) if pending.id == id => slot.pending = None,
                    _ => return,
                }
            }
            work.await;
        });
        slot.pending = Some(Pending { id, task });
    }

    /// Drops the pending task, if any. Returns whether one was waiting.
    pub fn cancel(&self) -> bool {
        match self.slot.lock().pending.take() {
            Some(pending) => {
                pending.task.abort();
                true
            }
            None => false,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.slot.lock().pending.is_some()
    }
}

impl Drop for DelayedTask {
    fn drop(&mut self) {
        self.cancel();
    }
}
