//! Retry delay policies consulted by `WorkQueue::add_rate_limited`.

use std::hash::Hash;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rustc_hash::FxHashMap;
use tokio::time::Instant;

/// Decides how long an item waits before it is retried.
pub trait RateLimiter<T>: Send + Sync {
    /// Delay for the next retry of `item`; records the attempt.
    fn when(&self, item: &T) -> Duration;
    /// Drop retry state for `item`.
    fn forget(&self, item: &T);
    /// Retries recorded for `item` since the last `forget`.
    fn num_requeues(&self, item: &T) -> u32;
}

fn lock<S>(m: &Mutex<S>) -> MutexGuard<'_, S> { m.lock().unwrap_or_else(PoisonError::into_inner) }

/// Per-item `base * 2^failures`, capped at `max`.
pub struct ExponentialFailureRateLimiter<T> {
    base: Duration,
    max: Duration,
    failures: Mutex<FxHashMap<T, u32>>,
}

impl<T: Eq + Hash> ExponentialFailureRateLimiter<T> {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max: max.max(base), failures: Mutex::new(FxHashMap::default()) }
    }

    fn delay_for(&self, exp: u32) -> Duration {
        if exp >= 64 {
            return self.max;
        }
        let nanos = self.base.as_nanos().saturating_mul(1u128 << exp);
        match u64::try_from(nanos) {
            Ok(n) => Duration::from_nanos(n).min(self.max),
            Err(_) => self.max,
        }
    }
}

impl<T: Clone + Eq + Hash + Send + Sync> RateLimiter<T> for ExponentialFailureRateLimiter<T> {
    fn when(&self, item: &T) -> Duration {
        let exp = {
            let mut failures = lock(&self.failures);
            let n = failures.entry(item.clone()).or_insert(0);
            let exp = *n;
            *n = n.saturating_add(1);
            exp
        };
        self.delay_for(exp)
    }

    fn forget(&self, item: &T) { lock(&self.failures).remove(item); }

    fn num_requeues(&self, item: &T) -> u32 { lock(&self.failures).get(item).copied().unwrap_or(0) }
}

struct Bucket {
    tokens: f64,
    last: Instant,
}

/// Overall throughput limit shared by every item: `qps` sustained, `burst` at once.
pub struct TokenBucketRateLimiter {
    qps: f64,
    burst: f64,
    max_delay: Option<Duration>,
    bucket: Mutex<Bucket>,
}

impl TokenBucketRateLimiter {
    pub fn new(qps: f64, burst: u32) -> Self {
        let burst = f64::from(burst.max(1));
        Self {
            qps: if qps > 0.0 { qps } else { 1.0 },
            burst,
            max_delay: None,
            bucket: Mutex::new(Bucket { tokens: burst, last: Instant::now() }),
        }
    }

    /// Bound the debt so no reservation waits longer than `max`.
    pub fn with_max_delay(mut self, max: Duration) -> Self {
        self.max_delay = Some(max);
        self
    }
}

impl<T> RateLimiter<T> for TokenBucketRateLimiter {
    fn when(&self, _item: &T) -> Duration {
        let mut b = lock(&self.bucket);
        let now = Instant::now();
        let refill = now.saturating_duration_since(b.last).as_secs_f64() * self.qps;
        b.tokens = (b.tokens + refill).min(self.burst);
        b.last = now;
        // Reserve a token even when the bucket is empty; the debt is the wait.
        b.tokens -= 1.0;
        if let Some(max) = self.max_delay {
            b.tokens = b.tokens.max(-max.as_secs_f64() * self.qps);
        }
        if b.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-b.tokens / self.qps)
        }
    }

    fn forget(&self, _item: &T) {}

    fn num_requeues(&self, _item: &T) -> u32 { 0 }
}

/// Longest delay among its members.
pub struct MaxOfRateLimiter<T> {
    limiters: Vec<Box<dyn RateLimiter<T>>>,
}

impl<T> MaxOfRateLimiter<T> {
    pub fn new(limiters: Vec<Box<dyn RateLimiter<T>>>) -> Self { Self { limiters } }
}

impl<T> RateLimiter<T> for MaxOfRateLimiter<T> {
    fn when(&self, item: &T) -> Duration {
        // Every member records the attempt, so no short-circuit.
        self.limiters.iter().map(|l| l.when(item)).max().unwrap_or(Duration::ZERO)
    }

    fn forget(&self, item: &T) {
        for l in &self.limiters {
            l.forget(item);
        }
    }

    fn num_requeues(&self, item: &T) -> u32 {
        self.limiters.iter().map(|l| l.num_requeues(item)).max().unwrap_or(0)
    }
}

/// Per-item exponential backoff from `base` to `max`, combined with an overall
/// `qps` / `burst` bucket. No delay exceeds `max`.
pub fn controller_rate_limiter<T>(base: Duration, max: Duration, qps: f64, burst: u32) -> MaxOfRateLimiter<T>
where
    T: Clone + Eq + Hash + Send + Sync + 'static,
{
    let max = max.max(base);
    MaxOfRateLimiter::new(vec![
        Box::new(ExponentialFailureRateLimiter::new(base, max)),
        Box::new(TokenBucketRateLimiter::new(qps, burst).with_max_delay(max)),
    ])
}

/// 5ms to 1000s per item, 10 qps / 100 burst overall.
pub fn default_controller_rate_limiter<T>() -> MaxOfRateLimiter<T>
where
    T: Clone + Eq + Hash + Send + Sync + 'static,
{
    controller_rate_limiter(Duration::from_millis(5), Duration::from_secs(1000), 10.0, 100)
}
