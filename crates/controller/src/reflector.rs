//! Reflector: keeps the cache mirrored from a `ListerWatcher` and forwards
//! every change as a delta.
//!
//! One cycle is list, replace cache, watch until the stream ends or fails.
//! Any end of the watch triggers a fresh list, so events missed while
//! disconnected surface as the diff between the old cache and the new listing.
//! Periodic resync is served from the same loop, so it never races the
//! watch for cache writes.

use std::future;
use std::time::Duration;

use futures::StreamExt;
use metrics::counter;
use tokio::sync::mpsc;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use vigil_core::{resource_version, Delta, DeltaKind, ListPage, ListerWatcher, Object, Selector, TransportError, WatchEvent};
use vigil_store::Cache;

use crate::config::ControllerConfig;
use crate::decoder::{decode, key_listing, record_key_error, Decoded};
use crate::ControllerError;

/// Doubling delay between failed list/watch attempts, reset after a good cycle.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    next: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        let max = max.max(base);
        Self { base, max, next: base }
    }

    pub fn next_delay(&mut self) -> Duration {
        let d = self.next;
        self.next = self.next.saturating_mul(2).min(self.max);
        d
    }

    pub fn reset(&mut self) { self.next = self.base; }
}

/// A watch that delivers nothing and closes sooner than this counts as a failed attempt.
const MIN_HEALTHY_WATCH: Duration = Duration::from_secs(1);

enum Step {
    Continue,
    Stop,
}

pub struct Reflector<K, L> {
    lister: L,
    selector: Selector,
    cache: Cache<K>,
    deltas: mpsc::Sender<Delta<K>>,
    resync_period: Duration,
    backoff: Backoff,
    max_retries: Option<u32>,
}

impl<K, L> Reflector<K, L>
where
    K: Object,
    L: ListerWatcher<K>,
{
    pub fn new(lister: L, cache: Cache<K>, deltas: mpsc::Sender<Delta<K>>, config: &ControllerConfig) -> Self {
        Self {
            lister,
            selector: config.selector.clone(),
            cache,
            deltas,
            resync_period: config.resync_period,
            backoff: Backoff::new(config.watch_backoff_base, config.watch_backoff_max),
            max_retries: config.relist_max_retries,
        }
    }

    /// Run until `shutdown` fires, the delta consumer goes away, or the
    /// configured number of consecutive failures is exceeded.
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<(), ControllerError> {
        let mut resync = resync_timer(self.resync_period);
        let mut failures: u32 = 0;
        info!(selector = ?self.selector, resync_secs = self.resync_period.as_secs(), "reflector starting");

        loop {
            let listed = tokio::select! {
                _ = shutdown.cancelled() => break,
                r = self.lister.list(&self.selector) => r,
            };
            let page = match listed {
                Ok(page) => page,
                Err(e) => {
                    failures = failures.saturating_add(1);
                    self.on_failure(failures, e)?;
                    match self.pause(&shutdown, &mut resync).await {
                        Step::Continue => continue,
                        Step::Stop => break,
                    }
                }
            };
            let cursor = page.cursor.clone();
            if let Step::Stop = self.relist(page).await {
                break;
            }

            let opened = tokio::select! {
                _ = shutdown.cancelled() => break,
                r = self.lister.watch(&self.selector, &cursor) => r,
            };
            let mut stream = match opened {
                Ok(s) => s,
                Err(e) => {
                    failures = failures.saturating_add(1);
                    self.on_failure(failures, e)?;
                    match self.pause(&shutdown, &mut resync).await {
                        Step::Continue => continue,
                        Step::Stop => break,
                    }
                }
            };
            debug!(cursor = %cursor, "watching");

            let mut cursor = cursor;
            let opened_at = Instant::now();
            let mut healthy = false;
            let mut ended: Option<TransportError> = None;
            let step = loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break Step::Stop,
                    _ = tick(&mut resync) => {
                        if let Step::Stop = self.resync().await {
                            break Step::Stop;
                        }
                    }
                    ev = stream.next() => match ev {
                        Some(Ok(ev)) => {
                            if !healthy {
                                healthy = true;
                                failures = 0;
                                self.backoff.reset();
                            }
                            if let Step::Stop = self.on_event(ev, &mut cursor).await {
                                break Step::Stop;
                            }
                        }
                        Some(Err(e)) if e.is_expired() => {
                            info!(cursor = %cursor, "watch cursor expired; relisting");
                            ended = Some(e);
                            break Step::Continue;
                        }
                        Some(Err(e)) => {
                            warn!(error = %e, cursor = %cursor, "watch stream failed; relisting");
                            ended = Some(e);
                            break Step::Continue;
                        }
                        None => {
                            debug!(cursor = %cursor, "watch stream ended; relisting");
                            break Step::Continue;
                        }
                    },
                }
            };
            drop(stream);
            if let Step::Stop = step {
                break;
            }
            counter!("reflector_relists_total", 1u64);
            if !healthy {
                if opened_at.elapsed() >= MIN_HEALTHY_WATCH {
                    // Quiet but stable connection.
                    failures = 0;
                    self.backoff.reset();
                } else {
                    match ended {
                        Some(e) if e.is_expired() => {}
                        other => {
                            let err = other.unwrap_or_else(|| TransportError::Watch("watch closed before any event".into()));
                            failures = failures.saturating_add(1);
                            self.on_failure(failures, err)?;
                        }
                    }
                }
            }
            if let Step::Stop = self.pause(&shutdown, &mut resync).await {
                break;
            }
        }
        info!("reflector stopped");
        Ok(())
    }

    fn on_failure(&self, failures: u32, err: TransportError) -> Result<(), ControllerError> {
        counter!("reflector_list_errors_total", 1u64);
        match self.max_retries {
            Some(max) if failures > max => {
                error!(error = %err, failures, "list/watch keeps failing; giving up");
                Err(ControllerError::RetriesExhausted { attempts: failures, source: err })
            }
            _ => {
                warn!(error = %err, failures, "list/watch failed; backing off");
                Ok(())
            }
        }
    }

    /// Sleep out the backoff delay, still serving resync ticks.
    async fn pause(&mut self, shutdown: &CancellationToken, resync: &mut Option<Interval>) -> Step {
        let delay = self.backoff.next_delay();
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return Step::Stop,
                _ = &mut sleep => return Step::Continue,
                _ = tick(resync) => {
                    if let Step::Stop = self.resync().await {
                        return Step::Stop;
                    }
                }
            }
        }
    }

    async fn relist(&self, page: ListPage<K>) -> Step {
        counter!("reflector_lists_total", 1u64);
        let listed = page.items.len();
        let deltas = self.cache.replace(key_listing(page.items));
        info!(listed, changes = deltas.len(), cursor = %page.cursor, "listed");
        for delta in deltas {
            if let Step::Stop = self.emit(delta).await {
                return Step::Stop;
            }
        }
        Step::Continue
    }

    async fn on_event(&self, ev: WatchEvent<K>, cursor: &mut String) -> Step {
        match decode(&self.cache, ev) {
            Ok(Decoded::Bookmark(next)) => {
                *cursor = next;
                Step::Continue
            }
            Ok(Decoded::Delta(delta)) => {
                if let Some(rv) = resource_version(delta.object.as_ref()) {
                    *cursor = rv.to_string();
                }
                counter!("reflector_watch_events_total", 1u64, "kind" => delta.kind.as_str());
                self.cache.apply(&delta);
                self.emit(delta).await
            }
            Err(e) => {
                record_key_error(&e);
                Step::Continue
            }
        }
    }

    /// Re-deliver every cached object as `Synced`. The cache is left untouched.
    async fn resync(&self) -> Step {
        let entries = self.cache.entries();
        counter!("reflector_resyncs_total", 1u64);
        debug!(objects = entries.len(), "resync");
        for (key, obj) in entries {
            if let Step::Stop = self.emit(Delta::new(DeltaKind::Synced, key, obj)).await {
                return Step::Stop;
            }
        }
        Step::Continue
    }

    async fn emit(&self, delta: Delta<K>) -> Step {
        match self.deltas.send(delta).await {
            Ok(()) => Step::Continue,
            Err(_) => {
                debug!("delta consumer gone");
                Step::Stop
            }
        }
    }
}

fn resync_timer(period: Duration) -> Option<Interval> {
    if period.is_zero() {
        return None;
    }
    let mut t = tokio::time::interval_at(Instant::now() + period, period);
    t.set_missed_tick_behavior(MissedTickBehavior::Delay);
    Some(t)
}

async fn tick(timer: &mut Option<Interval>) {
    match timer {
        Some(t) => {
            t.tick().await;
        }
        None => future::pending::<()>().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_to_cap_and_resets() {
        let mut b = Backoff::new(Duration::from_millis(800), Duration::from_secs(3));
        let seen: Vec<u128> = (0..5).map(|_| b.next_delay().as_millis()).collect();
        assert_eq!(seen, vec![800, 1600, 3000, 3000, 3000]);
        b.reset();
        assert_eq!(b.next_delay(), Duration::from_millis(800));
    }
}
