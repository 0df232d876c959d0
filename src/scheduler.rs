//! Bounded background job scheduler with per-segment deduplication.
//!
//! Every segment has at most one outstanding capture, tracked in the
//! in-flight table as a shared future. At most `limit` jobs execute at once;
//! the rest wait in a FIFO queue that is only drained when a job settles.
//! The scheduler never cancels an executing job. `reset` discards the queue
//! and bumps the generation so late settlements cannot touch the new state;
//! jobs still executing from an older generation keep their slot until they
//! settle.

use std::collections::{HashMap, HashSet, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::oneshot;

use crate::blob::PreviewHandle;
use crate::cache::PreviewStore;
use crate::error::PreviewError;
use crate::segment::SegmentIndex;

/// Future resolving to a segment's preview, or `None` when none could be produced.
/// Clones share one underlying capture.
pub type PreviewFuture = Shared<BoxFuture<'static, Option<PreviewHandle>>>;

/// Produces the preview for one segment. Run by the scheduler inside a job.
pub trait SegmentCapture: Send + Sync {
    fn capture_segment(
        &self,
        index: SegmentIndex,
    ) -> BoxFuture<'_, Result<Option<PreviewHandle>, PreviewError>>;
}

pub(crate) fn settled(result: Option<PreviewHandle>) -> PreviewFuture {
    futures::future::ready(result).boxed().shared()
}

fn pending_preview(rx: oneshot::Receiver<Option<PreviewHandle>>) -> PreviewFuture {
    // A dropped sender (job discarded on reset) resolves to None.
    rx.map(|result| result.ok().flatten()).boxed().shared()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerStats {
    pub started: u64,
    pub completed: u64,
    pub soft_failures: u64,
    pub hard_failures: u64,
    pub prefetch_misses: u64,
    pub peak_active: usize,
    pub active: usize,
    pub retiring: usize,
    pub queued: usize,
}

#[derive(Default)]
struct Counters {
    started: AtomicU64,
    completed: AtomicU64,
    soft_failures: AtomicU64,
    hard_failures: AtomicU64,
    prefetch_misses: AtomicU64,
    peak_active: AtomicUsize,
}

struct Job {
    index: SegmentIndex,
    generation: u64,
    tx: oneshot::Sender<Option<PreviewHandle>>,
}

struct SchedulerState {
    in_flight: HashMap<SegmentIndex, PreviewFuture>,
    queue: VecDeque<Job>,
    active: HashSet<SegmentIndex>,
    /// Jobs from earlier generations that are still executing.
    retiring: usize,
    generation: u64,
}

impl SchedulerState {
    fn running(&self) -> usize {
        self.active.len() + self.retiring
    }
}

struct Inner {
    state: Mutex<SchedulerState>,
    limit: usize,
    store: Arc<PreviewStore>,
    executor: Arc<dyn SegmentCapture>,
    runtime: Handle,
    counters: Counters,
}

pub struct JobScheduler {
    inner: Arc<Inner>,
}

impl JobScheduler {
    pub fn new(
        limit: usize,
        store: Arc<PreviewStore>,
        executor: Arc<dyn SegmentCapture>,
        runtime: Handle,
    ) -> Self {
        let generation = store.generation();
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(SchedulerState {
                    in_flight: HashMap::new(),
                    queue: VecDeque::new(),
                    active: HashSet::new(),
                    retiring: 0,
                    generation,
                }),
                limit: limit.max(1),
                store,
                executor,
                runtime,
                counters: Counters::default(),
            }),
        }
    }

    pub fn limit(&self) -> usize {
        self.inner.limit
    }

    /// Returns the outstanding future for `index`, or submits a new job.
    /// The job runs immediately when a slot is free, otherwise it is queued.
    pub fn schedule(&self, index: SegmentIndex) -> PreviewFuture {
        let inner = &self.inner;
        let mut state = inner.state.lock();
        if let Some(existing) = state.in_flight.get(&index) {
            return existing.clone();
        }
        let (tx, rx) = oneshot::channel();
        let future = pending_preview(rx);
        state.in_flight.insert(index, future.clone());
        let job = Job {
            index,
            generation: state.generation,
            tx,
        };
        if state.running() < inner.limit {
            Inner::start(inner, &mut state, job);
        } else {
            log::debug!(
                target: "scrub_preview::scheduler",
                "queued segment {} ({} running, {} waiting)",
                index,
                state.running(),
                state.queue.len()
            );
            state.queue.push_back(job);
        }
        future
    }

    /// Schedules `from + 1 ..= from + ahead`, skipping segments that are cached
    /// or already in flight. Results are discarded; misses are counted.
    pub fn prefetch(&self, from: SegmentIndex, ahead: u64) -> usize {
        let mut submitted = 0;
        for offset in 1..=ahead {
            let index = from.saturating_add(offset);
            if self.inner.store.contains(index) || self.is_in_flight(index) {
                continue;
            }
            let future = self.schedule(index);
            self.fire_and_forget(index, future);
            submitted += 1;
        }
        if submitted > 0 {
            log::trace!(
                target: "scrub_preview::scheduler",
                "prefetching {} segment(s) after {}",
                submitted,
                from
            );
        }
        submitted
    }

    fn fire_and_forget(&self, index: SegmentIndex, future: PreviewFuture) {
        let inner = Arc::clone(&self.inner);
        self.inner.runtime.spawn(async move {
            if future.await.is_none() {
                inner.counters.prefetch_misses.fetch_add(1, Ordering::Relaxed);
                log::trace!(
                    target: "scrub_preview::scheduler",
                    "prefetch for segment {} produced no preview",
                    index
                );
            }
        });
    }

    pub fn in_flight(&self, index: SegmentIndex) -> Option<PreviewFuture> {
        self.inner.state.lock().in_flight.get(&index).cloned()
    }

    pub fn is_in_flight(&self, index: SegmentIndex) -> bool {
        self.inner.state.lock().in_flight.contains_key(&index)
    }

    /// Registers a capture running outside the scheduler (the live path) so
    /// that jobs for the same segment join it instead of starting another.
    /// Returns `None` when the segment already has an outstanding capture.
    pub fn begin_external(&self, index: SegmentIndex) -> Option<ExternalClaim> {
        let mut state = self.inner.state.lock();
        if state.in_flight.contains_key(&index) {
            return None;
        }
        let (tx, rx) = oneshot::channel();
        state.in_flight.insert(index, pending_preview(rx));
        Some(ExternalClaim {
            inner: Arc::clone(&self.inner),
            index,
            generation: state.generation,
            tx: Some(tx),
        })
    }

    /// Discards queued jobs and forgets executing ones. Executing jobs run to
    /// completion and still count against the limit, but their results are
    /// dropped by the generation check.
    pub fn reset(&self, generation: u64) -> usize {
        let (discarded, forgotten) = {
            let mut state = self.inner.state.lock();
            state.generation = generation;
            let discarded: Vec<Job> = state.queue.drain(..).collect();
            let forgotten = state.active.len();
            state.retiring += forgotten;
            state.active.clear();
            state.in_flight.clear();
            (discarded, forgotten)
        };
        let count = discarded.len();
        // Dropping the senders settles every waiting future with None.
        drop(discarded);
        if count > 0 || forgotten > 0 {
            log::debug!(
                target: "scrub_preview::scheduler",
                "reset: discarded {} queued job(s), {} still executing",
                count,
                forgotten
            );
        }
        count
    }

    pub fn active_count(&self) -> usize {
        self.inner.state.lock().active.len()
    }

    /// Jobs from before the last `reset` that have not settled yet.
    pub fn retiring_count(&self) -> usize {
        self.inner.state.lock().retiring
    }

    pub fn queued_count(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    pub fn stats(&self) -> SchedulerStats {
        let (active, retiring, queued) = {
            let state = self.inner.state.lock();
            (state.active.len(), state.retiring, state.queue.len())
        };
        let counters = &self.inner.counters;
        SchedulerStats {
            started: counters.started.load(Ordering::Relaxed),
            completed: counters.completed.load(Ordering::Relaxed),
            soft_failures: counters.soft_failures.load(Ordering::Relaxed),
            hard_failures: counters.hard_failures.load(Ordering::Relaxed),
            prefetch_misses: counters.prefetch_misses.load(Ordering::Relaxed),
            peak_active: counters.peak_active.load(Ordering::Relaxed),
            active,
            retiring,
            queued,
        }
    }
}

impl Inner {
    fn start(this: &Arc<Inner>, state: &mut SchedulerState, job: Job) {
        state.active.insert(job.index);
        this.counters
            .peak_active
            .fetch_max(state.running(), Ordering::Relaxed);
        let inner = Arc::clone(this);
        this.runtime.spawn(async move {
            inner.run(job).await;
        });
    }

    async fn run(self: Arc<Self>, job: Job) {
        self.counters.started.fetch_add(1, Ordering::Relaxed);
        let index = job.index;

        let result = match self.store.get(index) {
            Some(cached) => Some(cached),
            None => {
                let outcome = AssertUnwindSafe(self.executor.capture_segment(index))
                    .catch_unwind()
                    .await;
                self.settle_outcome(index, job.generation, outcome)
            }
        };
        self.counters.completed.fetch_add(1, Ordering::Relaxed);

        {
            let mut state = self.state.lock();
            if state.generation == job.generation {
                state.in_flight.remove(&index);
                state.active.remove(&index);
            } else {
                state.retiring = state.retiring.saturating_sub(1);
            }
        }
        let _ = job.tx.send(result);
        Inner::drain(&self);
    }

    fn settle_outcome(
        &self,
        index: SegmentIndex,
        generation: u64,
        outcome: std::thread::Result<Result<Option<PreviewHandle>, PreviewError>>,
    ) -> Option<PreviewHandle> {
        match outcome {
            Ok(Ok(Some(handle))) => self.store.store(index, handle, generation).into_handle(),
            Ok(Ok(None)) => {
                self.counters.soft_failures.fetch_add(1, Ordering::Relaxed);
                log::debug!(
                    target: "scrub_preview::scheduler",
                    "no preview for segment {}",
                    index
                );
                None
            }
            Ok(Err(e)) if e.is_transient() => {
                self.counters.soft_failures.fetch_add(1, Ordering::Relaxed);
                log::debug!(
                    target: "scrub_preview::scheduler",
                    "capture for segment {} failed: {}",
                    index,
                    e
                );
                None
            }
            Ok(Err(e)) => {
                self.counters.hard_failures.fetch_add(1, Ordering::Relaxed);
                log::warn!(
                    target: "scrub_preview::scheduler",
                    "capture for segment {} failed: {}",
                    index,
                    e
                );
                None
            }
            Err(_) => {
                self.counters.hard_failures.fetch_add(1, Ordering::Relaxed);
                log::warn!(
                    target: "scrub_preview::scheduler",
                    "capture for segment {} panicked",
                    index
                );
                None
            }
        }
    }

    /// Sole admission path for queued jobs.
    fn drain(this: &Arc<Inner>) {
        let mut state = this.state.lock();
        while state.running() < this.limit {
            let Some(job) = state.queue.pop_front() else {
                break;
            };
            Inner::start(this, &mut state, job);
        }
    }
}

/// In-flight registration for a capture performed outside the scheduler.
/// Dropping the claim without settling releases the segment with no preview.
pub struct ExternalClaim {
    inner: Arc<Inner>,
    index: SegmentIndex,
    generation: u64,
    tx: Option<oneshot::Sender<Option<PreviewHandle>>>,
}

impl ExternalClaim {
    pub fn index(&self) -> SegmentIndex {
        self.index
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn settle(mut self, result: Option<PreviewHandle>) {
        self.release();
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(result);
        }
    }

    fn release(&self) {
        let mut state = self.inner.state.lock();
        if state.generation == self.generation {
            state.in_flight.remove(&self.index);
        }
    }
}

impl Drop for ExternalClaim {
    fn drop(&mut self) {
        if self.tx.is_some() {
            self.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::blob::BlobRegistry;
    use crate::test_support::ScriptedCapture;

    fn scheduler_with(limit: usize, capture: Arc<ScriptedCapture>) -> (JobScheduler, Arc<PreviewStore>) {
        let store = Arc::new(PreviewStore::new(Arc::clone(capture.registry())));
        let scheduler = JobScheduler::new(limit, Arc::clone(&store), capture, Handle::current());
        (scheduler, store)
    }

    fn capture(delay_ms: u64) -> Arc<ScriptedCapture> {
        Arc::new(ScriptedCapture::new(
            Arc::new(BlobRegistry::new()),
            Duration::from_millis(delay_ms),
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_requests_share_one_future() {
        let capture = capture(100);
        let (scheduler, store) = scheduler_with(5, Arc::clone(&capture));

        let a = scheduler.schedule(3);
        let b = scheduler.schedule(3);
        assert!(a.ptr_eq(&b));

        let (ra, rb) = tokio::join!(a, b);
        assert_eq!(ra, rb);
        assert!(ra.is_some());
        assert_eq!(capture.calls_for(3), 1);
        assert!(store.contains(3));
        assert!(!scheduler.is_in_flight(3));
    }

    #[tokio::test(start_paused = true)]
    async fn burst_never_exceeds_limit() {
        let capture = capture(250);
        let (scheduler, store) = scheduler_with(5, Arc::clone(&capture));

        let futures: Vec<_> = (0..12).map(|i| scheduler.schedule(i)).collect();
        assert_eq!(scheduler.active_count(), 5);
        assert_eq!(scheduler.queued_count(), 7);

        let results = futures::future::join_all(futures).await;
        assert!(results.iter().all(Option::is_some));
        assert!(capture.peak_running() <= 5);
        assert_eq!(scheduler.stats().peak_active, 5);
        assert_eq!(store.len(), 12);
        assert_eq!(scheduler.active_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn queue_is_first_in_first_out() {
        let capture = capture(50);
        let (scheduler, _store) = scheduler_with(1, Arc::clone(&capture));

        let futures: Vec<_> = [9, 2, 7, 4].into_iter().map(|i| scheduler.schedule(i)).collect();
        futures::future::join_all(futures).await;
        assert_eq!(capture.call_log(), vec![9, 2, 7, 4]);
    }

    #[tokio::test(start_paused = true)]
    async fn failures_do_not_wedge_retries() {
        let capture = capture(10);
        capture.fail_next(7, 3);
        let (scheduler, store) = scheduler_with(5, Arc::clone(&capture));

        for attempt in 1..=3 {
            assert!(scheduler.schedule(7).await.is_none(), "attempt {}", attempt);
            assert!(!scheduler.is_in_flight(7));
        }
        assert!(scheduler.schedule(7).await.is_some());
        assert_eq!(capture.calls_for(7), 4);
        assert!(store.contains(7));
        assert_eq!(scheduler.stats().soft_failures, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_capture_settles_none_and_frees_slot() {
        let capture = capture(10);
        capture.panic_on(1);
        let (scheduler, _store) = scheduler_with(1, Arc::clone(&capture));

        let first = scheduler.schedule(1);
        let second = scheduler.schedule(2);
        assert!(first.await.is_none());
        assert!(second.await.is_some());
        assert_eq!(scheduler.stats().hard_failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn reset_discards_queue_and_drops_late_results() {
        let capture = capture(500);
        let (scheduler, store) = scheduler_with(2, Arc::clone(&capture));

        let futures: Vec<_> = (0..5).map(|i| scheduler.schedule(i)).collect();
        tokio::task::yield_now().await;
        let generation = store.clear();
        assert_eq!(scheduler.reset(generation), 3);

        let results = futures::future::join_all(futures).await;
        assert!(results.iter().all(Option::is_none));
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(capture.call_log().len(), 2, "queued jobs never execute");
        assert!(store.is_empty());
        assert!(store.registry().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn jobs_executing_across_reset_keep_their_slots() {
        let capture = capture(500);
        let (scheduler, store) = scheduler_with(5, Arc::clone(&capture));

        let old: Vec<_> = (0..5).map(|i| scheduler.schedule(i)).collect();
        tokio::task::yield_now().await;
        let generation = store.clear();
        assert_eq!(scheduler.reset(generation), 0);
        assert_eq!(scheduler.retiring_count(), 5);

        let new: Vec<_> = (100..105).map(|i| scheduler.schedule(i)).collect();
        assert_eq!(scheduler.active_count(), 0);
        assert_eq!(scheduler.queued_count(), 5, "old jobs still hold every slot");

        let results = futures::future::join_all(new).await;
        assert!(results.iter().all(Option::is_some));
        assert!(futures::future::join_all(old).await.iter().all(Option::is_none));
        assert!(capture.peak_running() <= 5);
        assert_eq!(scheduler.stats().peak_active, 5);
        assert_eq!(scheduler.retiring_count(), 0);
        assert_eq!(store.len(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn prefetch_skips_cached_and_in_flight() {
        let capture = capture(20);
        let (scheduler, store) = scheduler_with(5, Arc::clone(&capture));
        let generation = store.generation();
        store.store(5, store.registry().register(vec![1], 1, 1), generation);
        let pending = scheduler.schedule(6);

        let submitted = scheduler.prefetch(3, 4);
        assert_eq!(submitted, 2, "4 and 7 only");
        pending.await;
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(capture.calls_for(5), 0);
        assert_eq!(capture.calls_for(6), 1);
        assert!(store.contains(4) && store.contains(7));
    }

    #[tokio::test(start_paused = true)]
    async fn prefetch_counts_misses() {
        let capture = capture(10);
        capture.fail_next(2, 1);
        let (scheduler, _store) = scheduler_with(5, Arc::clone(&capture));

        scheduler.prefetch(0, 3);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(scheduler.stats().prefetch_misses, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn external_claim_dedups_with_jobs() {
        let capture = capture(10);
        let (scheduler, store) = scheduler_with(5, Arc::clone(&capture));

        let claim = scheduler.begin_external(4).expect("claim");
        assert!(scheduler.begin_external(4).is_none());
        let joined = scheduler.schedule(4);

        let handle = store.registry().register(vec![4], 1, 1);
        let stored = store.store(4, handle, claim.generation()).into_handle();
        claim.settle(stored.clone());

        assert_eq!(joined.await, stored);
        assert_eq!(capture.calls_for(4), 0);
        assert!(!scheduler.is_in_flight(4));
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_claim_releases_segment() {
        let capture = capture(10);
        let (scheduler, _store) = scheduler_with(5, capture);

        let claim = scheduler.begin_external(8).expect("claim");
        let joined = scheduler.in_flight(8).expect("registered");
        drop(claim);
        assert!(joined.await.is_none());
        assert!(!scheduler.is_in_flight(8));
    }
}
