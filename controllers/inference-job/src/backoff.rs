//! # Retry rate limiting
//!
//! Provides the failure-driven delay applied by the work queue when a key is
//! re-added after a failed sync. Two limits combine, and the longer delay wins:
//!
//! - `ItemExponentialBackoff`: each key backs off independently,
//!   `base * 2^failures` capped at `max` (5ms, 10ms, 20ms, ... up to 1000s).
//!   A successful sync forgets the key and the next failure starts again
//!   from `base`.
//! - `BucketRateLimiter`: a token bucket shared by all keys (10 retries/s,
//!   burst of 100) so a mass failure cannot hammer the API server.

use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

/// Default delay for the first retry of a key
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(5);

/// Default ceiling for any single retry delay
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(1000);

/// Exponential backoff calculator tracking consecutive failures per key.
///
/// Not synchronized on its own; the work queue keeps it behind its lock.
#[derive(Debug, Clone)]
pub struct ItemExponentialBackoff {
    base: Duration,
    max: Duration,
    failures: HashMap<String, u32>,
}

impl ItemExponentialBackoff {
    /// Create a backoff with the given first delay and ceiling.
    #[must_use]
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            failures: HashMap::new(),
        }
    }

    /// Record a failure for `key` and return how long to wait before retrying it.
    pub fn next_delay(&mut self, key: &str) -> Duration {
        let failures = self.failures.entry(key.to_string()).or_insert(0);
        let delay = Self::calculate_for_failures(*failures, self.base, self.max);
        *failures = failures.saturating_add(1);
        delay
    }

    /// Number of consecutive failures recorded for `key`.
    pub fn num_requeues(&self, key: &str) -> u32 {
        self.failures.get(key).copied().unwrap_or(0)
    }

    /// Clear the failure history of `key`.
    pub fn forget(&mut self, key: &str) {
        self.failures.remove(key);
    }

    /// Longest delay this backoff ever yields.
    pub fn max_delay(&self) -> Duration {
        self.max
    }

    /// Calculate the delay for a given number of prior failures (stateless).
    ///
    /// `failures == 0` yields `base`; each further failure doubles it, capped at `max`.
    #[must_use]
    pub fn calculate_for_failures(failures: u32, base: Duration, max: Duration) -> Duration {
        let Some(factor) = 1u32.checked_shl(failures) else {
            return max;
        };
        base.checked_mul(factor).map_or(max, |delay| delay.min(max))
    }
}

impl Default for ItemExponentialBackoff {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY)
    }
}

/// Default sustained retry rate of the overall bucket, per second
pub const DEFAULT_QPS: u32 = 10;

/// Default burst size of the overall bucket
pub const DEFAULT_BURST: u32 = 100;

/// Token bucket shared by every key.
///
/// Each retry reserves one token. While tokens remain the retry may go
/// immediately; past that the bucket runs into debt and each reservation
/// waits until its token will have been refilled.
#[derive(Debug, Clone)]
pub struct BucketRateLimiter {
    qps: f64,
    burst: f64,
    tokens: f64,
    last: Instant,
}

impl BucketRateLimiter {
    /// Create a full bucket refilling at `qps` tokens per second.
    ///
    /// `qps` is clamped to at least 1.
    #[must_use]
    pub fn new(qps: u32, burst: u32) -> Self {
        let burst = f64::from(burst);
        Self {
            qps: f64::from(qps.max(1)),
            burst,
            tokens: burst,
            last: Instant::now(),
        }
    }

    /// Reserve a token and return how long the caller must wait for it.
    pub fn reserve(&mut self) -> Duration {
        self.reserve_at(Instant::now())
    }

    fn reserve_at(&mut self, now: Instant) -> Duration {
        let elapsed = now.saturating_duration_since(self.last).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.qps).min(self.burst);
        self.last = now;
        self.tokens -= 1.0;
        if self.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-self.tokens / self.qps)
        }
    }
}

impl Default for BucketRateLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_QPS, DEFAULT_BURST)
    }
}

/// Per-key backoff combined with the overall bucket.
#[derive(Debug, Clone, Default)]
pub struct RateLimiter {
    item: ItemExponentialBackoff,
    overall: BucketRateLimiter,
}

impl RateLimiter {
    /// Combine a per-key backoff with an overall bucket.
    #[must_use]
    pub fn new(item: ItemExponentialBackoff, overall: BucketRateLimiter) -> Self {
        Self { item, overall }
    }

    /// Record a failure for `key` and return the longer of the per-key and overall delays.
    pub fn when(&mut self, key: &str) -> Duration {
        let item = self.item.next_delay(key);
        let overall = self.overall.reserve();
        item.max(overall)
    }

    /// Number of consecutive failures recorded for `key`.
    pub fn num_requeues(&self, key: &str) -> u32 {
        self.item.num_requeues(key)
    }

    /// Clear the failure history of `key`.
    pub fn forget(&mut self, key: &str) {
        self.item.forget(key);
    }

    /// Longest per-key delay.
    pub fn max_delay(&self) -> Duration {
        self.item.max_delay()
    }
}

impl From<ItemExponentialBackoff> for RateLimiter {
    fn from(item: ItemExponentialBackoff) -> Self {
        Self::new(item, BucketRateLimiter::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_sequence() {
        let mut backoff = ItemExponentialBackoff::new(Duration::from_millis(5), Duration::from_secs(1000));

        assert_eq!(backoff.next_delay("default/a"), Duration::from_millis(5));
        assert_eq!(backoff.next_delay("default/a"), Duration::from_millis(10));
        assert_eq!(backoff.next_delay("default/a"), Duration::from_millis(20));
        assert_eq!(backoff.next_delay("default/a"), Duration::from_millis(40));
        assert_eq!(backoff.num_requeues("default/a"), 4);
    }

    #[test]
    fn test_keys_back_off_independently() {
        let mut backoff = ItemExponentialBackoff::default();

        backoff.next_delay("default/a");
        backoff.next_delay("default/a");

        assert_eq!(backoff.next_delay("default/b"), DEFAULT_BASE_DELAY);
        assert_eq!(backoff.num_requeues("default/a"), 2);
        assert_eq!(backoff.num_requeues("default/b"), 1);
    }

    #[test]
    fn test_max_cap() {
        let mut backoff = ItemExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(10));

        assert_eq!(backoff.next_delay("k"), Duration::from_secs(1));
        assert_eq!(backoff.next_delay("k"), Duration::from_secs(2));
        assert_eq!(backoff.next_delay("k"), Duration::from_secs(4));
        assert_eq!(backoff.next_delay("k"), Duration::from_secs(8));
        // Next would be 16s, but should be capped at 10s
        assert_eq!(backoff.next_delay("k"), Duration::from_secs(10));
        assert_eq!(backoff.next_delay("k"), Duration::from_secs(10));
    }

    #[test]
    fn test_forget_resets() {
        let mut backoff = ItemExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(60));

        backoff.next_delay("k");
        backoff.next_delay("k");
        backoff.forget("k");

        assert_eq!(backoff.num_requeues("k"), 0);
        assert_eq!(backoff.next_delay("k"), Duration::from_secs(1));
    }

    #[test]
    fn test_large_failure_counts_saturate() {
        let max = Duration::from_secs(1000);
        assert_eq!(
            ItemExponentialBackoff::calculate_for_failures(200, Duration::from_millis(5), max),
            max
        );
        assert_eq!(
            ItemExponentialBackoff::calculate_for_failures(u32::MAX, Duration::from_secs(1), max),
            max
        );
    }

    #[test]
    fn test_bucket_allows_burst_then_paces() {
        let mut bucket = BucketRateLimiter::new(10, 3);
        let now = bucket.last;

        assert_eq!(bucket.reserve_at(now), Duration::ZERO);
        assert_eq!(bucket.reserve_at(now), Duration::ZERO);
        assert_eq!(bucket.reserve_at(now), Duration::ZERO);
        assert_eq!(bucket.reserve_at(now), Duration::from_millis(100));
        assert_eq!(bucket.reserve_at(now), Duration::from_millis(200));
    }

    #[test]
    fn test_bucket_refills_over_time_up_to_burst() {
        let mut bucket = BucketRateLimiter::new(10, 2);
        let start = bucket.last;
        bucket.reserve_at(start);
        bucket.reserve_at(start);
        assert_eq!(bucket.reserve_at(start), Duration::from_millis(100));

        // Long idle periods refill to the burst size, not beyond
        let later = start + Duration::from_secs(60);
        assert_eq!(bucket.reserve_at(later), Duration::ZERO);
        assert_eq!(bucket.reserve_at(later), Duration::ZERO);
        assert!(bucket.reserve_at(later) > Duration::ZERO);
    }

    #[test]
    fn test_rate_limiter_takes_longer_delay() {
        let mut limiter = RateLimiter::new(
            ItemExponentialBackoff::new(Duration::from_millis(5), Duration::from_secs(1000)),
            BucketRateLimiter::new(1, 1),
        );

        // First failure: bucket has a token, per-key backoff wins
        assert_eq!(limiter.when("default/a"), Duration::from_millis(5));
        // Bucket is drained: a different key is paced by the overall limit
        assert!(limiter.when("default/b") >= Duration::from_millis(900));
        assert_eq!(limiter.num_requeues("default/a"), 1);
        assert_eq!(limiter.num_requeues("default/b"), 1);
    }

    #[test]
    fn test_many_keys_failing_at_once_are_paced() {
        let mut limiter = RateLimiter::default();
        let delays: Vec<_> = (0..150).map(|i| limiter.when(&format!("default/job-{i}"))).collect();

        assert!(delays[..DEFAULT_BURST as usize].iter().all(|d| *d == DEFAULT_BASE_DELAY));
        assert!(delays[149] >= Duration::from_secs(4));
    }
}
