mod common;

use std::time::Duration;

use common::{fast_config, pod, FakeStore};
use k8s_openapi::api::core::v1::Pod;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use vigil_controller::{ControllerConfig, ControllerError, Reflector};
use vigil_core::{Delta, DeltaKind, ObjectKey, WatchEvent};
use vigil_store::Cache;

struct Running {
    cache: Cache<Pod>,
    rx: mpsc::Receiver<Delta<Pod>>,
    stop: CancellationToken,
    task: JoinHandle<Result<(), ControllerError>>,
}

fn start(store: &FakeStore, config: ControllerConfig) -> Running {
    let cache = Cache::new();
    let (tx, rx) = mpsc::channel(64);
    let stop = CancellationToken::new();
    let reflector = Reflector::new(store.clone(), cache.clone(), tx, &config);
    let task = tokio::spawn(reflector.run(stop.clone()));
    Running { cache, rx, stop, task }
}

async fn next(rx: &mut mpsc::Receiver<Delta<Pod>>) -> (DeltaKind, String) {
    let d = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("delta within timeout")
        .expect("channel open");
    (d.kind, d.key.as_str().to_string())
}

async fn watching(store: &FakeStore, n: u32) {
    assert!(common::eventually(Duration::from_secs(2), || store.watches() >= n && store.open_watches() > 0).await);
}

#[tokio::test]
async fn initial_list_fills_cache_before_watch() {
    let store = FakeStore::default();
    store.create("ns", "pod-a");
    store.create("ns", "pod-b");
    let mut r = start(&store, fast_config());

    let mut seen = vec![next(&mut r.rx).await, next(&mut r.rx).await];
    seen.sort_by(|a, b| a.1.cmp(&b.1));
    assert_eq!(seen, vec![(DeltaKind::Added, "ns/pod-a".into()), (DeltaKind::Added, "ns/pod-b".into())]);
    assert!(r.cache.has_synced());
    assert_eq!(r.cache.len(), 2);

    watching(&store, 1).await;
    r.stop.cancel();
    assert!(r.task.await.unwrap().is_ok());
}

#[tokio::test]
async fn watch_events_update_cache_then_forward() {
    let store = FakeStore::default();
    let mut r = start(&store, fast_config());
    watching(&store, 1).await;

    store.create("ns", "pod-a");
    assert_eq!(next(&mut r.rx).await, (DeltaKind::Added, "ns/pod-a".into()));
    assert!(r.cache.contains(&ObjectKey::from("ns/pod-a")));

    let updated = store.update("ns", "pod-a");
    assert_eq!(next(&mut r.rx).await, (DeltaKind::Updated, "ns/pod-a".into()));
    let cached = r.cache.get(&ObjectKey::from("ns/pod-a")).unwrap();
    assert_eq!(cached.metadata.resource_version, updated.metadata.resource_version);

    store.delete("ns", "pod-a");
    assert_eq!(next(&mut r.rx).await, (DeltaKind::Deleted, "ns/pod-a".into()));
    assert!(r.cache.is_empty());
    r.stop.cancel();
}

#[tokio::test]
async fn missed_delete_surfaces_after_reconnect() {
    let store = FakeStore::default();
    store.create("ns", "pod-a");
    store.create("ns", "pod-b");
    let mut r = start(&store, fast_config());
    next(&mut r.rx).await;
    next(&mut r.rx).await;
    watching(&store, 1).await;

    // pod-b goes away unseen, then the watch drops.
    store.delete_silently("ns", "pod-b");
    store.disconnect();

    let (kind, key) = next(&mut r.rx).await;
    assert_eq!((kind, key.as_str()), (DeltaKind::Deleted, "ns/pod-b"));
    assert!(!r.cache.contains(&ObjectKey::from("ns/pod-b")));
    assert!(r.cache.contains(&ObjectKey::from("ns/pod-a")));
    assert!(store.lists() >= 2);

    // Unchanged pod-a produced nothing on relist.
    assert!(r.rx.try_recv().is_err());
    r.stop.cancel();
}

#[tokio::test]
async fn expired_cursor_relists_and_picks_up_missed_adds() {
    let store = FakeStore::default();
    let mut r = start(&store, fast_config());
    watching(&store, 1).await;

    store.create_silently("ns", "pod-c");
    store.expire();

    assert_eq!(next(&mut r.rx).await, (DeltaKind::Added, "ns/pod-c".into()));
    watching(&store, 2).await;
    r.stop.cancel();
}

#[tokio::test]
async fn resync_redelivers_cached_objects_without_touching_cache() {
    let store = FakeStore::default();
    store.create("ns", "pod-a");
    let mut r = start(&store, ControllerConfig { resync_period: Duration::from_millis(50), ..fast_config() });
    assert_eq!(next(&mut r.rx).await, (DeltaKind::Added, "ns/pod-a".into()));
    let epoch = r.cache.epoch();

    assert_eq!(next(&mut r.rx).await, (DeltaKind::Synced, "ns/pod-a".into()));
    assert_eq!(next(&mut r.rx).await, (DeltaKind::Synced, "ns/pod-a".into()));
    assert_eq!(r.cache.epoch(), epoch);
    r.stop.cancel();
}

#[tokio::test]
async fn nameless_object_is_dropped_and_stream_continues() {
    let store = FakeStore::default();
    let mut r = start(&store, fast_config());
    watching(&store, 1).await;

    let mut nameless = pod("ns", "x", 1);
    nameless.metadata.name = None;
    store.push(WatchEvent::Added(nameless));
    store.push(WatchEvent::Bookmark("5".into()));
    store.create("ns", "pod-a");

    assert_eq!(next(&mut r.rx).await, (DeltaKind::Added, "ns/pod-a".into()));
    assert_eq!(r.cache.len(), 1);
    assert_eq!(store.watches(), 1);
    r.stop.cancel();
}

#[tokio::test]
async fn list_failures_are_retried_until_success() {
    let store = FakeStore::default();
    store.create("ns", "pod-a");
    store.fail_lists(3);
    let mut r = start(&store, fast_config());

    assert_eq!(next(&mut r.rx).await, (DeltaKind::Added, "ns/pod-a".into()));
    assert_eq!(store.lists(), 4);
    r.stop.cancel();
    assert!(r.task.await.unwrap().is_ok());
}

#[tokio::test]
async fn retry_ceiling_is_fatal() {
    let store = FakeStore::default();
    store.fail_lists(u32::MAX);
    let r = start(&store, ControllerConfig { relist_max_retries: Some(2), ..fast_config() });

    let res = tokio::time::timeout(Duration::from_secs(2), r.task).await.unwrap().unwrap();
    match res {
        Err(ControllerError::RetriesExhausted { attempts, source }) => {
            assert_eq!(attempts, 3);
            assert!(!source.is_expired());
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(store.lists(), 3);
    assert!(!r.cache.has_synced());
}

#[tokio::test]
async fn watch_that_fails_at_once_counts_toward_ceiling() {
    let store = FakeStore::default();
    store.create("ns", "pod-a");
    store.fail_watches(true);
    let mut r = start(&store, ControllerConfig { relist_max_retries: Some(2), ..fast_config() });
    assert_eq!(next(&mut r.rx).await, (DeltaKind::Added, "ns/pod-a".into()));

    let res = tokio::time::timeout(Duration::from_secs(2), r.task).await.expect("gives up").unwrap();
    match res {
        Err(ControllerError::RetriesExhausted { attempts, source }) => {
            assert_eq!(attempts, 3);
            assert!(source.to_string().contains("connection reset"));
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(store.lists(), 3);
    assert_eq!(store.watches(), 3);
}

#[tokio::test]
async fn watch_that_delivers_events_clears_failures() {
    let store = FakeStore::default();
    store.fail_watches(true);
    let mut r = start(&store, ControllerConfig { relist_max_retries: Some(3), ..fast_config() });
    assert!(common::eventually(Duration::from_secs(2), || store.watches() >= 2).await);

    store.fail_watches(false);
    watching(&store, 3).await;
    let healthy_at = store.watches();
    store.create("ns", "pod-a");
    assert_eq!(next(&mut r.rx).await, (DeltaKind::Added, "ns/pod-a".into()));

    // The delivered event reset the count, so two more failures stay under the ceiling.
    store.fail_watches(true);
    store.disconnect();
    assert!(common::eventually(Duration::from_secs(2), || store.watches() >= healthy_at + 2).await);
    assert!(!r.task.is_finished());
    r.stop.cancel();
    assert!(r.task.await.unwrap().is_ok());
}

#[tokio::test]
async fn shutdown_during_backoff_returns_promptly() {
    let store = FakeStore::default();
    store.fail_lists(u32::MAX);
    let config = ControllerConfig {
        watch_backoff_base: Duration::from_secs(60),
        watch_backoff_max: Duration::from_secs(60),
        ..fast_config()
    };
    let r = start(&store, config);
    assert!(common::eventually(Duration::from_secs(2), || store.lists() == 1).await);

    r.stop.cancel();
    let res = tokio::time::timeout(Duration::from_secs(1), r.task).await.expect("stops promptly");
    assert!(res.unwrap().is_ok());
}
