use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};
use vigil_core::{Delta, DeltaKind, ObjectKey};
use vigil_queue::WorkQueue;

/// Callbacks invoked for each delta, in delivery order. Implementations must
/// not block; the reflector waits on them through the delta channel.
pub trait EventHandler<K>: Send + Sync {
    fn on_add(&self, key: &ObjectKey, obj: &Arc<K>);
    fn on_update(&self, key: &ObjectKey, obj: &Arc<K>);
    /// `obj` is the last known state.
    fn on_delete(&self, key: &ObjectKey, obj: &Arc<K>);
    /// Periodic re-delivery of an unchanged object. Defaults to `on_update`.
    fn on_sync(&self, key: &ObjectKey, obj: &Arc<K>) { self.on_update(key, obj) }
}

/// Turns every change into a work item for its key.
#[derive(Clone)]
pub struct EnqueueHandler {
    queue: WorkQueue<ObjectKey>,
}

impl EnqueueHandler {
    pub fn new(queue: WorkQueue<ObjectKey>) -> Self { Self { queue } }
}

impl<K> EventHandler<K> for EnqueueHandler {
    fn on_add(&self, key: &ObjectKey, _obj: &Arc<K>) {
        trace!(key = %key, "added");
        self.queue.add(key.clone());
    }

    fn on_update(&self, key: &ObjectKey, _obj: &Arc<K>) {
        trace!(key = %key, "updated");
        self.queue.add(key.clone());
    }

    fn on_delete(&self, key: &ObjectKey, _obj: &Arc<K>) {
        trace!(key = %key, "deleted");
        self.queue.add(key.clone());
    }

    fn on_sync(&self, key: &ObjectKey, _obj: &Arc<K>) { self.queue.add(key.clone()); }
}

pub fn dispatch<K, H: EventHandler<K> + ?Sized>(handler: &H, delta: &Delta<K>) {
    match delta.kind {
        DeltaKind::Added => handler.on_add(&delta.key, &delta.object),
        DeltaKind::Updated => handler.on_update(&delta.key, &delta.object),
        DeltaKind::Deleted => handler.on_delete(&delta.key, &delta.object),
        DeltaKind::Synced => handler.on_sync(&delta.key, &delta.object),
    }
}

/// Drain the delta channel into `handler` until shutdown or the sender closes.
/// Returns the number of deltas dispatched.
pub async fn run_handler<K, H>(mut rx: mpsc::Receiver<Delta<K>>, handler: H, shutdown: CancellationToken) -> u64
where
    H: EventHandler<K>,
{
    let mut handled = 0u64;
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            next = rx.recv() => match next {
                Some(delta) => {
                    dispatch(&handler, &delta);
                    handled += 1;
                }
                None => break,
            },
        }
    }
    debug!(handled, "event handler stopped");
    handled
}
