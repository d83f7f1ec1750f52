//! Reconcile workers: pull a key, read the cached snapshot, reconcile, report.

use std::any::Any;
use std::future::Future;
use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::anyhow;
use futures::FutureExt;
use metrics::{counter, histogram};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use vigil_core::{Object, ObjectKey, Outcome};
use vigil_queue::WorkQueue;
use vigil_store::Cache;

/// User logic driving the world toward the desired state for one key.
///
/// `object` is `None` when the key is no longer cached, i.e. the object was
/// deleted; this is the place for cleanup.
#[async_trait::async_trait]
pub trait Reconciler<K>: Send + Sync {
    async fn reconcile(&self, key: &ObjectKey, object: Option<Arc<K>>) -> anyhow::Result<Outcome>;
}

/// Reconciler backed by an async closure.
pub struct FnReconciler<F, K> {
    f: F,
    _object: PhantomData<fn() -> K>,
}

pub fn reconciler_fn<K, F, Fut>(f: F) -> FnReconciler<F, K>
where
    F: Fn(ObjectKey, Option<Arc<K>>) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Outcome>> + Send,
{
    FnReconciler { f, _object: PhantomData }
}

#[async_trait::async_trait]
impl<K, F, Fut> Reconciler<K> for FnReconciler<F, K>
where
    K: Send + Sync + 'static,
    F: Fn(ObjectKey, Option<Arc<K>>) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Outcome>> + Send,
{
    async fn reconcile(&self, key: &ObjectKey, object: Option<Arc<K>>) -> anyhow::Result<Outcome> {
        (self.f)(key.clone(), object).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Fetching,
    Reconciling,
    Reporting,
    Stopped,
}

impl WorkerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerState::Idle => "idle",
            WorkerState::Fetching => "fetching",
            WorkerState::Reconciling => "reconciling",
            WorkerState::Reporting => "reporting",
            WorkerState::Stopped => "stopped",
        }
    }
}

pub struct Worker<K, R> {
    id: usize,
    queue: WorkQueue<ObjectKey>,
    cache: Cache<K>,
    reconciler: Arc<R>,
    not_ready_delay: Duration,
    state: watch::Sender<WorkerState>,
}

impl<K, R> Worker<K, R>
where
    K: Object,
    R: Reconciler<K> + 'static,
{
    pub fn new(
        id: usize,
        queue: WorkQueue<ObjectKey>,
        cache: Cache<K>,
        reconciler: Arc<R>,
        not_ready_delay: Duration,
        state: watch::Sender<WorkerState>,
    ) -> Self {
        Self { id, queue, cache, reconciler, not_ready_delay, state }
    }

    fn set_state(&self, s: WorkerState) { self.state.send_replace(s); }

    /// Process keys until the queue shuts down.
    pub async fn run(self) {
        debug!(worker = self.id, "worker started");
        while self.process_next().await {}
        self.set_state(WorkerState::Stopped);
        debug!(worker = self.id, "worker stopped");
    }

    /// Handle one key. Returns false once the queue is shut down.
    pub async fn process_next(&self) -> bool {
        self.set_state(WorkerState::Idle);
        let Some(key) = self.queue.get().await else { return false };

        self.set_state(WorkerState::Fetching);
        let object = self.cache.get(&key);
        let present = object.is_some();

        self.set_state(WorkerState::Reconciling);
        let started = Instant::now();
        let result = match AssertUnwindSafe(self.reconciler.reconcile(&key, object)).catch_unwind().await {
            Ok(r) => r,
            Err(panic) => Err(anyhow!("reconciler panicked: {}", panic_message(panic.as_ref()))),
        };
        histogram!("reconcile_duration_seconds", started.elapsed().as_secs_f64());

        self.set_state(WorkerState::Reporting);
        self.report(&key, present, result);
        self.queue.done(&key);
        true
    }

    fn report(&self, key: &ObjectKey, present: bool, result: anyhow::Result<Outcome>) {
        if !present {
            // The object is gone: one cleanup pass, never retried.
            if let Err(e) = &result {
                warn!(worker = self.id, key = %key, error = %e, "cleanup of deleted object failed");
            }
            counter!("reconcile_total", 1u64, "result" => "deleted");
            self.queue.forget(key);
            return;
        }
        match result {
            Ok(Outcome::Success) => {
                counter!("reconcile_total", 1u64, "result" => "success");
                self.queue.forget(key);
            }
            Ok(Outcome::Retry) => {
                counter!("reconcile_total", 1u64, "result" => "retry");
                debug!(worker = self.id, key = %key, delay_ms = self.not_ready_delay.as_millis() as u64, "not ready; retrying");
                self.queue.add_after(key.clone(), self.not_ready_delay);
            }
            Ok(Outcome::RetryAfter(delay)) => {
                counter!("reconcile_total", 1u64, "result" => "retry_after");
                self.queue.forget(key);
                self.queue.add_after(key.clone(), delay);
            }
            Err(e) => {
                counter!("reconcile_total", 1u64, "result" => "error");
                let retries = self.queue.num_requeues(key);
                if retries == 0 {
                    info!(worker = self.id, key = %key, error = %e, "reconcile failed; requeueing with backoff");
                } else {
                    warn!(worker = self.id, key = %key, retries, error = %e, "reconcile failed again");
                }
                self.queue.add_rate_limited(key.clone());
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string payload"
    }
}
