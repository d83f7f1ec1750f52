//! Controller configuration, read from `VIGIL_*` environment variables.

use std::str::FromStr;
use std::time::Duration;

use tracing::warn;
use vigil_core::Selector;

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Name used for the work queue's metrics and logs.
    pub name: String,
    pub selector: Selector,
    /// Zero disables periodic resync.
    pub resync_period: Duration,
    pub workers: usize,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
    /// Overall retry throughput across all keys.
    pub queue_qps: f64,
    pub queue_burst: u32,
    /// Delay used when the reconciler answers `Outcome::Retry`.
    pub not_ready_delay: Duration,
    pub watch_backoff_base: Duration,
    pub watch_backoff_max: Duration,
    /// Consecutive list/watch failures tolerated; `None` retries forever.
    pub relist_max_retries: Option<u32>,
    pub delta_channel_cap: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            name: "vigil".to_string(),
            selector: Selector::default(),
            resync_period: Duration::from_secs(30 * 60),
            workers: 2,
            retry_base_delay: Duration::from_millis(5),
            retry_max_delay: Duration::from_secs(1000),
            queue_qps: 10.0,
            queue_burst: 100,
            not_ready_delay: Duration::from_secs(1),
            watch_backoff_base: Duration::from_millis(800),
            watch_backoff_max: Duration::from_secs(30),
            relist_max_retries: None,
            delta_channel_cap: 2048,
        }
    }
}

fn parse<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse::<T>() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(key, value = %raw, "invalid value; using default");
            None
        }
    }
}

impl ControllerConfig {
    pub fn from_env() -> Self { Self::from_lookup(|k| std::env::var(k).ok()) }

    /// Build from an arbitrary variable source; unset or unparsable values keep defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let d = Self::default();
        let selector = match lookup("VIGIL_SELECTOR").filter(|s| !s.trim().is_empty()) {
            Some(expr) => Selector::labels(expr.trim()),
            None => d.selector.clone(),
        };
        Self {
            name: d.name,
            selector,
            resync_period: parse(&lookup, "VIGIL_RESYNC_SECS").map(Duration::from_secs).unwrap_or(d.resync_period),
            workers: parse::<usize>(&lookup, "VIGIL_WORKERS").unwrap_or(d.workers).max(1),
            retry_base_delay: parse(&lookup, "VIGIL_RETRY_BASE_MS").map(Duration::from_millis).unwrap_or(d.retry_base_delay),
            retry_max_delay: parse(&lookup, "VIGIL_RETRY_MAX_SECS").map(Duration::from_secs).unwrap_or(d.retry_max_delay),
            queue_qps: parse::<f64>(&lookup, "VIGIL_QUEUE_QPS").filter(|q| *q > 0.0).unwrap_or(d.queue_qps),
            queue_burst: parse(&lookup, "VIGIL_QUEUE_BURST").unwrap_or(d.queue_burst),
            not_ready_delay: parse(&lookup, "VIGIL_NOT_READY_MS").map(Duration::from_millis).unwrap_or(d.not_ready_delay),
            watch_backoff_base: parse(&lookup, "VIGIL_WATCH_BACKOFF_BASE_MS").map(Duration::from_millis).unwrap_or(d.watch_backoff_base),
            watch_backoff_max: parse(&lookup, "VIGIL_WATCH_BACKOFF_MAX_SECS").map(Duration::from_secs).unwrap_or(d.watch_backoff_max),
            relist_max_retries: parse(&lookup, "VIGIL_RELIST_MAX_RETRIES").or(d.relist_max_retries),
            delta_channel_cap: parse::<usize>(&lookup, "VIGIL_QUEUE_CAP").unwrap_or(d.delta_channel_cap).max(1),
        }
    }
}
