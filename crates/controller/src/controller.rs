use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use vigil_core::{ListerWatcher, Object, ObjectKey};
use vigil_queue::{controller_rate_limiter, WorkQueue};
use vigil_store::Cache;

use crate::config::ControllerConfig;
use crate::handler::{run_handler, EnqueueHandler};
use crate::reflector::Reflector;
use crate::worker::{Reconciler, Worker, WorkerState};
use crate::ControllerError;

/// Reflector, event handler and a pool of reconcile workers around one cache
/// and one work queue.
pub struct Controller<K, L, R> {
    lister: L,
    reconciler: Arc<R>,
    config: ControllerConfig,
    cache: Cache<K>,
    queue: WorkQueue<ObjectKey>,
    state_tx: Vec<watch::Sender<WorkerState>>,
    state_rx: Vec<watch::Receiver<WorkerState>>,
}

/// Read-only view of a controller, usable while `run` owns it.
pub struct ControllerHandle<K> {
    cache: Cache<K>,
    queue: WorkQueue<ObjectKey>,
    states: Vec<watch::Receiver<WorkerState>>,
}

impl<K> Clone for ControllerHandle<K> {
    fn clone(&self) -> Self {
        Self { cache: self.cache.clone(), queue: self.queue.clone(), states: self.states.clone() }
    }
}

impl<K: Object> ControllerHandle<K> {
    pub fn cache(&self) -> &Cache<K> { &self.cache }

    pub fn queue(&self) -> &WorkQueue<ObjectKey> { &self.queue }

    pub fn worker_states(&self) -> Vec<WorkerState> { self.states.iter().map(|rx| *rx.borrow()).collect() }

    pub fn has_synced(&self) -> bool { self.cache.has_synced() }
}

fn build_queue(config: &ControllerConfig) -> WorkQueue<ObjectKey> {
    let limiter = controller_rate_limiter(
        config.retry_base_delay,
        config.retry_max_delay,
        config.queue_qps,
        config.queue_burst,
    );
    WorkQueue::new(config.name.clone(), limiter)
}

fn joined(res: Result<Result<(), ControllerError>, JoinError>) -> Result<(), ControllerError> {
    match res {
        Ok(r) => r,
        Err(e) => Err(ControllerError::Task(e.to_string())),
    }
}

impl<K, L, R> Controller<K, L, R>
where
    K: Object,
    L: ListerWatcher<K> + 'static,
    R: Reconciler<K> + 'static,
{
    pub fn new(lister: L, reconciler: R, config: ControllerConfig) -> Self {
        let (state_tx, state_rx) = (0..config.workers.max(1)).map(|_| watch::channel(WorkerState::Idle)).unzip();
        let queue = build_queue(&config);
        Self { lister, reconciler: Arc::new(reconciler), config, cache: Cache::new(), queue, state_tx, state_rx }
    }

    pub fn handle(&self) -> ControllerHandle<K> {
        ControllerHandle { cache: self.cache.clone(), queue: self.queue.clone(), states: self.state_rx.clone() }
    }

    pub fn cache(&self) -> &Cache<K> { &self.cache }

    pub fn queue(&self) -> &WorkQueue<ObjectKey> { &self.queue }

    /// Run until `shutdown` fires or the reflector gives up.
    ///
    /// Workers start only after the first listing has been loaded into the
    /// cache. On the way out the queue is shut down and in-flight reconciles
    /// are allowed to finish.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), ControllerError> {
        let Controller { lister, reconciler, config, cache, queue, state_tx, .. } = self;
        let mut idle_states = state_tx;
        let stop = shutdown.child_token();

        let (tx, rx) = mpsc::channel(config.delta_channel_cap);
        let reflector = Reflector::new(lister, cache.clone(), tx, &config);
        let mut reflector_task = tokio::spawn(reflector.run(stop.clone()));
        let handler_task = tokio::spawn(run_handler(rx, EnqueueHandler::new(queue.clone()), stop.clone()));

        info!(controller = %config.name, workers = idle_states.len(), "waiting for cache sync");
        let early = tokio::select! {
            _ = cache.wait_synced() => None,
            _ = stop.cancelled() => None,
            res = &mut reflector_task => Some(res),
        };

        let mut workers = JoinSet::new();
        let result = match early {
            Some(res) => joined(res),
            None => {
                if !stop.is_cancelled() {
                    info!(controller = %config.name, objects = cache.len(), "cache synced; starting workers");
                    for (id, state) in idle_states.drain(..).enumerate() {
                        let worker = Worker::new(
                            id,
                            queue.clone(),
                            cache.clone(),
                            Arc::clone(&reconciler),
                            config.not_ready_delay,
                            state,
                        );
                        workers.spawn(worker.run());
                    }
                }
                joined(reflector_task.await)
            }
        };

        stop.cancel();
        queue.shut_down();
        while let Some(res) = workers.join_next().await {
            if let Err(e) = res {
                warn!(error = %e, "worker task failed");
            }
        }
        for state in idle_states {
            state.send_replace(WorkerState::Stopped);
        }
        match handler_task.await {
            Ok(handled) => debug!(handled, "event handler drained"),
            Err(e) => warn!(error = %e, "event handler task failed"),
        }
        match &result {
            Ok(()) => info!(controller = %config.name, "controller stopped"),
            Err(e) => error!(controller = %config.name, error = %e, "controller failed"),
        }
        result
    }
}
