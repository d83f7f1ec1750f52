#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::channel::mpsc;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::api::ObjectMeta;
use vigil_controller::ControllerConfig;
use vigil_core::{ListPage, ListerWatcher, Selector, TransportError, WatchEvent, WatchStream};

type Tx = mpsc::UnboundedSender<Result<WatchEvent<Pod>, TransportError>>;

#[derive(Default)]
struct State {
    objects: BTreeMap<String, Pod>,
    rv: u64,
    watchers: Vec<Tx>,
    list_failures: u32,
    failing_watches: bool,
    lists: u32,
    watches: u32,
}

/// In-memory remote store with scriptable failures. Clones share state.
#[derive(Clone, Default)]
pub struct FakeStore {
    state: Arc<Mutex<State>>,
}

pub fn pod(ns: &str, name: &str, rv: u64) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(ns.to_string()),
            resource_version: Some(rv.to_string()),
            ..Default::default()
        },
        ..Default::default()
    }
}

/// Small delays everywhere so scenarios finish quickly on a real clock.
pub fn fast_config() -> ControllerConfig {
    ControllerConfig {
        resync_period: Duration::ZERO,
        workers: 2,
        retry_base_delay: Duration::from_millis(10),
        retry_max_delay: Duration::from_secs(1),
        queue_qps: 1000.0,
        queue_burst: 1000,
        not_ready_delay: Duration::from_millis(20),
        watch_backoff_base: Duration::from_millis(5),
        watch_backoff_max: Duration::from_millis(20),
        ..ControllerConfig::default()
    }
}

impl FakeStore {
    fn lock(&self) -> std::sync::MutexGuard<'_, State> { self.state.lock().unwrap() }

    fn broadcast(st: &mut State, ev: WatchEvent<Pod>) {
        st.watchers.retain(|tx| tx.unbounded_send(Ok(ev.clone())).is_ok());
    }

    fn bump(st: &mut State) -> u64 {
        st.rv += 1;
        st.rv
    }

    pub fn create(&self, ns: &str, name: &str) -> Pod {
        let mut st = self.lock();
        let rv = Self::bump(&mut st);
        let p = pod(ns, name, rv);
        st.objects.insert(format!("{ns}/{name}"), p.clone());
        Self::broadcast(&mut st, WatchEvent::Added(p.clone()));
        p
    }

    pub fn update(&self, ns: &str, name: &str) -> Pod {
        let mut st = self.lock();
        let rv = Self::bump(&mut st);
        let p = pod(ns, name, rv);
        st.objects.insert(format!("{ns}/{name}"), p.clone());
        Self::broadcast(&mut st, WatchEvent::Modified(p.clone()));
        p
    }

    pub fn delete(&self, ns: &str, name: &str) {
        let mut st = self.lock();
        if let Some(p) = st.objects.remove(&format!("{ns}/{name}")) {
            Self::broadcast(&mut st, WatchEvent::Deleted(p));
        }
    }

    /// Change the store without notifying watchers, as if the event was missed.
    pub fn create_silently(&self, ns: &str, name: &str) {
        let mut st = self.lock();
        let rv = Self::bump(&mut st);
        st.objects.insert(format!("{ns}/{name}"), pod(ns, name, rv));
    }

    pub fn delete_silently(&self, ns: &str, name: &str) { self.lock().objects.remove(&format!("{ns}/{name}")); }

    /// Send a raw event to every open watch.
    pub fn push(&self, ev: WatchEvent<Pod>) { Self::broadcast(&mut self.lock(), ev); }

    /// End every open watch stream.
    pub fn disconnect(&self) { self.lock().watchers.clear(); }

    /// Fail every open watch with an expired cursor.
    pub fn expire(&self) {
        let mut st = self.lock();
        for tx in st.watchers.drain(..) {
            let _ = tx.unbounded_send(Err(TransportError::Expired("too old resource version".into())));
        }
    }

    pub fn fail_lists(&self, n: u32) { self.lock().list_failures = n; }

    /// Every watch opened from now on fails with its first item.
    pub fn fail_watches(&self, on: bool) { self.lock().failing_watches = on; }

    pub fn lists(&self) -> u32 { self.lock().lists }

    pub fn watches(&self) -> u32 { self.lock().watches }

    pub fn open_watches(&self) -> usize { self.lock().watchers.len() }
}

#[async_trait::async_trait]
impl ListerWatcher<Pod> for FakeStore {
    async fn list(&self, _selector: &Selector) -> Result<ListPage<Pod>, TransportError> {
        let mut st = self.lock();
        st.lists += 1;
        if st.list_failures > 0 {
            st.list_failures -= 1;
            return Err(TransportError::List("connection refused".into()));
        }
        Ok(ListPage { items: st.objects.values().cloned().collect(), cursor: st.rv.to_string() })
    }

    async fn watch(&self, _selector: &Selector, _cursor: &str) -> Result<WatchStream<Pod>, TransportError> {
        let mut st = self.lock();
        st.watches += 1;
        let (tx, rx) = mpsc::unbounded();
        if st.failing_watches {
            let _ = tx.unbounded_send(Err(TransportError::Watch("connection reset".into())));
        } else {
            st.watchers.push(tx);
        }
        Ok(rx.boxed())
    }
}

/// Poll `cond` until it holds or `timeout` passes.
pub async fn eventually(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if cond() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
