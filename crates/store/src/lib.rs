//! Vigil store: the local object cache mirrored from the remote store.
//!
//! Only the reflector writes; workers read. Snapshots are handed out as
//! `Arc<K>` and never mutated in place, so a reader holding one keeps a
//! consistent view while the cache moves on.

#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use metrics::gauge;
use rustc_hash::FxHashMap;
use tokio::sync::watch;
use tracing::debug;
use vigil_core::{resource_version, Delta, DeltaKind, Object, ObjectKey};

struct State<K> {
    items: FxHashMap<ObjectKey, Arc<K>>,
    epoch: u64,
}

struct Shared<K> {
    state: Mutex<State<K>>,
    epoch_tx: watch::Sender<u64>,
    synced_tx: watch::Sender<bool>,
}

/// Key → latest known snapshot. Cheap to clone; clones share the same map.
pub struct Cache<K> {
    shared: Arc<Shared<K>>,
}

impl<K> Clone for Cache<K> {
    fn clone(&self) -> Self { Self { shared: Arc::clone(&self.shared) } }
}

impl<K: Object> Default for Cache<K> {
    fn default() -> Self { Self::new() }
}

impl<K: Object> Cache<K> {
    pub fn new() -> Self {
        let (epoch_tx, _) = watch::channel(0u64);
        let (synced_tx, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State { items: FxHashMap::default(), epoch: 0 }),
                epoch_tx,
                synced_tx,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State<K>> {
        // A panic while holding the lock cannot leave the map half-written.
        self.shared.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, key: &ObjectKey) -> Option<Arc<K>> { self.lock().items.get(key).cloned() }

    pub fn contains(&self, key: &ObjectKey) -> bool { self.lock().items.contains_key(key) }

    pub fn list(&self) -> Vec<Arc<K>> { self.lock().items.values().cloned().collect() }

    pub fn keys(&self) -> Vec<ObjectKey> { self.lock().items.keys().cloned().collect() }

    /// Every cached `(key, snapshot)` pair, taken under one lock.
    pub fn entries(&self) -> Vec<(ObjectKey, Arc<K>)> {
        self.lock().items.iter().map(|(k, v)| (k.clone(), Arc::clone(v))).collect()
    }

    pub fn len(&self) -> usize { self.lock().items.len() }

    pub fn is_empty(&self) -> bool { self.lock().items.is_empty() }

    /// Apply one delta. Writes replace the stored snapshot wholesale; deletes remove the entry.
    pub fn apply(&self, delta: &Delta<K>) {
        let mut st = self.lock();
        match delta.kind {
            DeltaKind::Added | DeltaKind::Updated | DeltaKind::Synced => {
                st.items.insert(delta.key.clone(), Arc::clone(&delta.object));
            }
            DeltaKind::Deleted => {
                st.items.remove(&delta.key);
            }
        }
        self.bump(&mut st);
    }

    /// Replace the whole content with a fresh listing and return the deltas that
    /// bring a consumer of the old content up to date: added and changed objects
    /// in listing order, then deletions sorted by key.
    pub fn replace(&self, listed: Vec<(ObjectKey, K)>) -> Vec<Delta<K>> {
        // Duplicate keys in one listing: the later entry wins, the first position is kept.
        let mut order: Vec<(ObjectKey, Arc<K>)> = Vec::with_capacity(listed.len());
        let mut pos: FxHashMap<ObjectKey, usize> = FxHashMap::default();
        for (key, obj) in listed {
            match pos.get(&key) {
                Some(&i) => order[i].1 = Arc::new(obj),
                None => {
                    pos.insert(key.clone(), order.len());
                    order.push((key, Arc::new(obj)));
                }
            }
        }

        let mut st = self.lock();
        let mut next: FxHashMap<ObjectKey, Arc<K>> = FxHashMap::default();
        let mut deltas = Vec::new();
        for (key, obj) in order {
            let kind = match st.items.get(&key) {
                None => Some(DeltaKind::Added),
                Some(old) if changed(old.as_ref(), obj.as_ref()) => Some(DeltaKind::Updated),
                Some(_) => None,
            };
            if let Some(kind) = kind {
                deltas.push(Delta::new(kind, key.clone(), Arc::clone(&obj)));
            }
            next.insert(key, obj);
        }
        let mut gone: Vec<(ObjectKey, Arc<K>)> = st
            .items
            .iter()
            .filter(|(k, _)| !next.contains_key(*k))
            .map(|(k, v)| (k.clone(), Arc::clone(v)))
            .collect();
        gone.sort_by(|a, b| a.0.cmp(&b.0));
        for (key, obj) in gone {
            deltas.push(Delta::new(DeltaKind::Deleted, key, obj));
        }
        st.items = next;
        self.bump(&mut st);
        debug!(items = st.items.len(), deltas = deltas.len(), epoch = st.epoch, "cache replaced");
        drop(st);
        self.shared.synced_tx.send_replace(true);
        deltas
    }

    fn bump(&self, st: &mut State<K>) {
        st.epoch = st.epoch.saturating_add(1);
        gauge!("cache_objects", st.items.len() as f64);
        self.shared.epoch_tx.send_replace(st.epoch);
    }

    /// Number of mutations applied so far.
    pub fn epoch(&self) -> u64 { self.lock().epoch }

    pub fn subscribe_epoch(&self) -> watch::Receiver<u64> { self.shared.epoch_tx.subscribe() }

    /// True once the first full listing has been loaded.
    pub fn has_synced(&self) -> bool { *self.shared.synced_tx.borrow() }

    pub async fn wait_synced(&self) {
        let mut rx = self.shared.synced_tx.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

fn changed<K: Object>(old: &K, new: &K) -> bool {
    match (resource_version(old), resource_version(new)) {
        (Some(a), Some(b)) => a != b,
        _ => true,
    }
}
