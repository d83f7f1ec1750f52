//! Vigil work queue: a deduplicating, delay-aware, rate-limited queue of keys.
//!
//! Invariants:
//! - an item is pending at most once; adding a pending item is a no-op;
//! - an item is handed to at most one consumer at a time; adding it while it
//!   is being processed re-queues it when the consumer calls `done`;
//! - ready items come out in FIFO order, delayed items join the FIFO once
//!   their delay has elapsed.

#![forbid(unsafe_code)]

pub mod rate_limiter;

use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use metrics::{counter, gauge, histogram};
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, trace};

pub use rate_limiter::{
    controller_rate_limiter, default_controller_rate_limiter, ExponentialFailureRateLimiter, MaxOfRateLimiter, RateLimiter,
    TokenBucketRateLimiter,
};

/// Bound for items carried by the queue.
pub trait QueueItem: Clone + Eq + Hash + Send + Sync + 'static {}

impl<T> QueueItem for T where T: Clone + Eq + Hash + Send + Sync + 'static {}

struct Waiting<T> {
    ready_at: Instant,
    seq: u64,
    item: T,
}

impl<T> PartialEq for Waiting<T> {
    fn eq(&self, other: &Self) -> bool { self.ready_at == other.ready_at && self.seq == other.seq }
}

impl<T> Eq for Waiting<T> {}

impl<T> PartialOrd for Waiting<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> { Some(self.cmp(other)) }
}

impl<T> Ord for Waiting<T> {
    // Reversed so the max-heap pops the earliest deadline first.
    fn cmp(&self, other: &Self) -> Ordering {
        other.ready_at.cmp(&self.ready_at).then_with(|| other.seq.cmp(&self.seq))
    }
}

struct State<T> {
    queue: VecDeque<T>,
    dirty: FxHashSet<T>,
    processing: FxHashSet<T>,
    waiting: BinaryHeap<Waiting<T>>,
    /// Earliest ready time per delayed item; heap entries that disagree are stale.
    waiting_at: FxHashMap<T, Instant>,
    enqueued_at: FxHashMap<T, Instant>,
    started_at: FxHashMap<T, Instant>,
    seq: u64,
    shutting_down: bool,
}

struct Inner<T> {
    name: String,
    state: Mutex<State<T>>,
    ready: Notify,
    limiter: Box<dyn RateLimiter<T>>,
}

/// Handle to a shared work queue. Clones refer to the same queue.
pub struct WorkQueue<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for WorkQueue<T> {
    fn clone(&self) -> Self { Self { inner: Arc::clone(&self.inner) } }
}

impl<T: QueueItem> WorkQueue<T> {
    pub fn new(name: impl Into<String>, limiter: impl RateLimiter<T> + 'static) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                state: Mutex::new(State {
                    queue: VecDeque::new(),
                    dirty: FxHashSet::default(),
                    processing: FxHashSet::default(),
                    waiting: BinaryHeap::new(),
                    waiting_at: FxHashMap::default(),
                    enqueued_at: FxHashMap::default(),
                    started_at: FxHashMap::default(),
                    seq: 0,
                    shutting_down: false,
                }),
                ready: Notify::new(),
                limiter: Box::new(limiter),
            }),
        }
    }

    /// Queue using `default_controller_rate_limiter`.
    pub fn with_default_limiter(name: impl Into<String>) -> Self {
        Self::new(name, default_controller_rate_limiter())
    }

    pub fn name(&self) -> &str { &self.inner.name }

    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Mark `item` as needing processing. Returns true if it became ready for `get`.
    fn insert(&self, st: &mut State<T>, item: T) -> bool {
        if st.shutting_down || st.dirty.contains(&item) {
            return false;
        }
        counter!("workqueue_adds_total", 1u64, "queue" => self.inner.name.clone());
        st.dirty.insert(item.clone());
        if st.processing.contains(&item) {
            // Redelivered by `done`.
            return false;
        }
        st.enqueued_at.insert(item.clone(), Instant::now());
        st.queue.push_back(item);
        gauge!("workqueue_depth", st.queue.len() as f64, "queue" => self.inner.name.clone());
        true
    }

    pub fn add(&self, item: T) {
        let pushed = {
            let mut st = self.lock();
            self.insert(&mut st, item)
        };
        if pushed {
            self.inner.ready.notify_one();
        }
    }

    /// Add `item` once `delay` has elapsed. A pending delayed add with an earlier
    /// deadline wins.
    pub fn add_after(&self, item: T, delay: Duration) {
        if delay.is_zero() {
            self.add(item);
            return;
        }
        {
            let mut st = self.lock();
            if st.shutting_down {
                return;
            }
            let ready_at = Instant::now() + delay;
            if matches!(st.waiting_at.get(&item), Some(at) if *at <= ready_at) {
                return;
            }
            st.seq = st.seq.wrapping_add(1);
            let seq = st.seq;
            st.waiting_at.insert(item.clone(), ready_at);
            st.waiting.push(Waiting { ready_at, seq, item });
        }
        // Let a sleeping consumer pick up the new, possibly earlier, deadline.
        self.inner.ready.notify_one();
    }

    /// Re-add after the delay chosen by the rate limiter; counts as a retry.
    pub fn add_rate_limited(&self, item: T) {
        let delay = self.inner.limiter.when(&item);
        counter!("workqueue_retries_total", 1u64, "queue" => self.inner.name.clone());
        trace!(queue = %self.inner.name, delay_ms = delay.as_millis() as u64, "rate limited add");
        self.add_after(item, delay);
    }

    /// Clear retry state for `item`.
    pub fn forget(&self, item: &T) { self.inner.limiter.forget(item); }

    pub fn num_requeues(&self, item: &T) -> u32 { self.inner.limiter.num_requeues(item) }

    fn promote(&self, st: &mut State<T>, now: Instant) {
        while st.waiting.peek().is_some_and(|w| w.ready_at <= now) {
            let Some(w) = st.waiting.pop() else { break };
            if st.waiting_at.get(&w.item) != Some(&w.ready_at) {
                continue;
            }
            st.waiting_at.remove(&w.item);
            self.insert(st, w.item);
        }
    }

    /// Wait for the next ready item. Returns `None` once the queue is shut down.
    /// The caller must call `done` with the item when finished with it.
    pub async fn get(&self) -> Option<T> {
        loop {
            let notified = self.inner.ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let next_deadline = {
                let mut st = self.lock();
                if st.shutting_down {
                    return None;
                }
                let now = Instant::now();
                self.promote(&mut st, now);
                if let Some(item) = st.queue.pop_front() {
                    st.dirty.remove(&item);
                    st.processing.insert(item.clone());
                    st.started_at.insert(item.clone(), now);
                    if let Some(at) = st.enqueued_at.remove(&item) {
                        histogram!(
                            "workqueue_queue_duration_seconds",
                            now.saturating_duration_since(at).as_secs_f64(),
                            "queue" => self.inner.name.clone()
                        );
                    }
                    gauge!("workqueue_depth", st.queue.len() as f64, "queue" => self.inner.name.clone());
                    let more = !st.queue.is_empty();
                    drop(st);
                    if more {
                        self.inner.ready.notify_one();
                    }
                    return Some(item);
                }
                st.waiting.peek().map(|w| w.ready_at)
            };

            match next_deadline {
                Some(at) => {
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = tokio::time::sleep_until(at) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Finish processing `item`. If it was added meanwhile it becomes ready again.
    pub fn done(&self, item: &T) {
        let requeued = {
            let mut st = self.lock();
            st.processing.remove(item);
            if let Some(at) = st.started_at.remove(item) {
                histogram!(
                    "workqueue_work_duration_seconds",
                    at.elapsed().as_secs_f64(),
                    "queue" => self.inner.name.clone()
                );
            }
            if !st.shutting_down && st.dirty.contains(item) {
                st.enqueued_at.insert(item.clone(), Instant::now());
                st.queue.push_back(item.clone());
                true
            } else {
                false
            }
        };
        if requeued {
            self.inner.ready.notify_one();
        }
    }

    /// Close the queue. Blocked and future `get` calls return `None`; queued
    /// and delayed items are dropped.
    pub fn shut_down(&self) {
        {
            let mut st = self.lock();
            if st.shutting_down {
                return;
            }
            st.shutting_down = true;
            let dropped = st.queue.len() + st.waiting_at.len();
            st.queue.clear();
            st.dirty.clear();
            st.waiting.clear();
            st.waiting_at.clear();
            st.enqueued_at.clear();
            debug!(queue = %self.inner.name, dropped, in_flight = st.processing.len(), "work queue shut down");
        }
        self.inner.ready.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool { self.lock().shutting_down }

    /// Items ready for `get` right now (delayed items excluded).
    pub fn len(&self) -> usize { self.lock().queue.len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }
}
