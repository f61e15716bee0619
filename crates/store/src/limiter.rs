//! Requeue rate limiting: per-item exponential backoff combined with a
//! process-wide token bucket. The effective delay is the max of the two.

use std::hash::Hash;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use rustc_hash::FxHashMap;

pub trait RateLimiter<T>: Send + Sync {
    /// Delay before `item` may be requeued. Mutates limiter state.
    fn when(&self, item: &T) -> Duration;
    /// Drop all per-item state for `item`.
    fn forget(&self, item: &T);
    /// Requeue count since the last `forget`.
    fn retries(&self, item: &T) -> u32;
}

/// `base * 2^failures`, capped at `max`, tracked per item.
pub struct ItemExponentialBackoff<T> {
    base: Duration,
    max: Duration,
    failures: Mutex<FxHashMap<T, u32>>,
}

impl<T: Eq + Hash + Clone> ItemExponentialBackoff<T> {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max, failures: Mutex::new(FxHashMap::default()) }
    }
}

impl<T: Eq + Hash + Clone + Send + Sync> RateLimiter<T> for ItemExponentialBackoff<T> {
    fn when(&self, item: &T) -> Duration {
        let mut failures = self.failures.lock().unwrap();
        let count = failures.entry(item.clone()).or_insert(0);
        let exp = (*count).min(31);
        *count += 1;
        self.base
            .checked_mul(1u32 << exp)
            .map(|d| d.min(self.max))
            .unwrap_or(self.max)
    }

    fn forget(&self, item: &T) {
        self.failures.lock().unwrap().remove(item);
    }

    fn retries(&self, item: &T) -> u32 {
        self.failures.lock().unwrap().get(item).copied().unwrap_or(0)
    }
}

struct BucketState {
    tokens: f64,
    last: Instant,
}

/// Process-wide token bucket on requeue rate; not per-item. Tokens may go
/// negative, which turns into a wait (reservation semantics).
pub struct TokenBucket {
    rate: f64,
    burst: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    pub fn new(rate: f64, burst: u32) -> Self {
        let burst = f64::from(burst.max(1));
        Self { rate, burst, state: Mutex::new(BucketState { tokens: burst, last: Instant::now() }) }
    }
}

impl<T> RateLimiter<T> for TokenBucket {
    fn when(&self, _item: &T) -> Duration {
        if !self.rate.is_finite() || self.rate <= 0.0 {
            return Duration::ZERO;
        }
        let mut state = self.state.lock().unwrap();
        let now = Instant::now();
        let refill = now.duration_since(state.last).as_secs_f64() * self.rate;
        state.tokens = (state.tokens + refill).min(self.burst);
        state.last = now;
        state.tokens -= 1.0;
        if state.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-state.tokens / self.rate)
        }
    }

    fn forget(&self, _item: &T) {}

    fn retries(&self, _item: &T) -> u32 {
        0
    }
}

/// Worst-of composition: the effective delay is the max across limiters;
/// forgetting and counting fan out to all of them.
pub struct MaxOfLimiter<T> {
    limiters: Vec<Box<dyn RateLimiter<T>>>,
}

impl<T> MaxOfLimiter<T> {
    pub fn new(limiters: Vec<Box<dyn RateLimiter<T>>>) -> Self {
        Self { limiters }
    }
}

impl<T: Send + Sync> RateLimiter<T> for MaxOfLimiter<T> {
    fn when(&self, item: &T) -> Duration {
        self.limiters.iter().map(|l| l.when(item)).max().unwrap_or(Duration::ZERO)
    }

    fn forget(&self, item: &T) {
        for l in &self.limiters {
            l.forget(item);
        }
    }

    fn retries(&self, item: &T) -> u32 {
        self.limiters.iter().map(|l| l.retries(item)).max().unwrap_or(0)
    }
}

/// The composite used by the engine: per-item exponential backoff capped by a
/// global token bucket on requeue rate.
pub fn default_limiter<T: Eq + Hash + Clone + Send + Sync + 'static>(
    base: Duration,
    max: Duration,
    rate: f64,
    burst: u32,
) -> MaxOfLimiter<T> {
    MaxOfLimiter::new(vec![
        Box::new(ItemExponentialBackoff::new(base, max)),
        Box::new(TokenBucket::new(rate, burst)),
    ])
}
