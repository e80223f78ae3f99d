//! Per-resource token-bucket admission control.
//!
//! Every resource key (typically a model name) gets its own bucket on
//! first use, refilled continuously at `requests_per_minute / 60` tokens
//! per second up to `requests_per_minute` tokens. [`RateLimiter::acquire`]
//! suspends the caller until a token is available.
//!
//! Independently of the buckets, [`RateLimiter::record_error`] remembers
//! when a resource last rejected a call, and [`RateLimiter::wait_time`]
//! turns that into an escalating wait for callers that want to back off
//! harder after an upstream rate-limit response.
//!
//! Waiters on one key are admitted in arrival order: each bucket has a fair
//! queue lock that a waiter holds while it sleeps for the next token.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::retry::{RetryConfig, RetryPolicy};
use crate::Result;
use crate::telemetry;

/// Configuration for the rate limiter.
///
/// ```rust
/// # use skjold::RateLimitConfig;
/// # use std::time::Duration;
/// let config = RateLimitConfig::new()
///     .requests_per_minute(60)
///     .min_wait(Duration::from_secs(30));
/// ```
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Bucket capacity and refill rate (per minute). 0 disables limiting. Default: 20.
    pub requests_per_minute: u32,
    /// Attempts allowed by [`with_rate_limit`]. Default: 3.
    pub max_retries: u32,
    /// Floor returned by [`RateLimiter::wait_time`]. Default: 60s.
    pub min_wait: Duration,
    /// Ceiling returned by [`RateLimiter::wait_time`]. Default: 1h.
    pub max_wait: Duration,
    /// Wait per minute elapsed since the last error. Default: 60s.
    pub base_wait: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: 20,
            max_retries: 3,
            min_wait: Duration::from_secs(60),
            max_wait: Duration::from_secs(3600),
            base_wait: Duration::from_secs(60),
        }
    }
}

impl RateLimitConfig {
    /// Create a new config with sensible defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bucket capacity and refill rate per minute. 0 disables limiting.
    pub fn requests_per_minute(mut self, n: u32) -> Self {
        self.requests_per_minute = n;
        self
    }

    /// Attempts allowed by [`with_rate_limit`].
    pub fn max_retries(mut self, n: u32) -> Self {
        self.max_retries = n;
        self
    }

    /// Floor returned by [`RateLimiter::wait_time`].
    pub fn min_wait(mut self, wait: Duration) -> Self {
        self.min_wait = wait;
        self
    }

    /// Ceiling returned by [`RateLimiter::wait_time`].
    pub fn max_wait(mut self, wait: Duration) -> Self {
        self.max_wait = wait;
        self
    }

    /// Wait per minute elapsed since the last recorded error.
    pub fn base_wait(mut self, wait: Duration) -> Self {
        self.base_wait = wait;
        self
    }
}

/// Point-in-time view of one bucket.
#[derive(Debug, Clone)]
pub struct BucketSnapshot {
    /// Tokens per second.
    pub rate: f64,
    pub capacity: f64,
    pub tokens: f64,
    /// Time until the next token, if the bucket is currently empty.
    pub estimated_wait: Option<Duration>,
}

#[derive(Debug)]
struct TokenBucket {
    rate: f64,
    capacity: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn full(rate: f64, capacity: f64) -> Self {
        Self {
            rate,
            capacity,
            tokens: capacity,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(self.capacity);
        self.last_refill = now;
    }

    fn try_consume(&mut self, now: Instant) -> bool {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    fn estimated_wait(&self) -> Option<Duration> {
        (self.tokens < 1.0).then(|| Duration::from_secs_f64((1.0 - self.tokens) / self.rate))
    }

    /// How long a denied caller sleeps before trying again.
    fn poll_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.rate)
    }
}

struct BucketSlot {
    /// Held by a waiter for as long as it waits; tokio mutexes are fair,
    /// which gives FIFO admission per key.
    queue: tokio::sync::Mutex<()>,
    bucket: Mutex<TokenBucket>,
}

impl BucketSlot {
    fn bucket(&self) -> MutexGuard<'_, TokenBucket> {
        self.bucket.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Token-bucket rate limiter keyed by resource.
pub struct RateLimiter {
    config: RateLimitConfig,
    buckets: DashMap<String, Arc<BucketSlot>>,
    last_error: DashMap<String, Instant>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            buckets: DashMap::new(),
            last_error: DashMap::new(),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    fn is_unlimited(&self) -> bool {
        self.config.requests_per_minute == 0
    }

    fn slot(&self, key: &str) -> Arc<BucketSlot> {
        if let Some(slot) = self.buckets.get(key) {
            return Arc::clone(&slot);
        }
        let rpm = f64::from(self.config.requests_per_minute);
        let slot = self
            .buckets
            .entry(key.to_owned())
            .or_insert_with(|| {
                debug!(resource = key, requests_per_minute = rpm, "creating token bucket");
                Arc::new(BucketSlot {
                    queue: tokio::sync::Mutex::new(()),
                    bucket: Mutex::new(TokenBucket::full(rpm / 60.0, rpm)),
                })
            });
        Arc::clone(&slot)
    }

    /// Wait until a token for `key` is available and consume it.
    pub async fn acquire(&self, key: &str) {
        if self.is_unlimited() {
            return;
        }
        let slot = self.slot(key);
        let _turn = slot.queue.lock().await;
        let mut waited = false;
        loop {
            let interval = {
                let mut bucket = slot.bucket();
                if bucket.try_consume(Instant::now()) {
                    return;
                }
                bucket.poll_interval()
            };
            if !waited {
                waited = true;
                metrics::counter!(telemetry::RATE_LIMIT_WAITS_TOTAL, "resource" => key.to_owned())
                    .increment(1);
                debug!(
                    resource = key,
                    interval_ms = interval.as_millis() as u64,
                    "rate limited, waiting for token"
                );
            }
            tokio::time::sleep(interval).await;
        }
    }

    /// Take a token for `key` if one is available right now.
    ///
    /// Returns `false` when the bucket is empty or other callers are
    /// already queued for it.
    pub fn try_acquire(&self, key: &str) -> bool {
        if self.is_unlimited() {
            return true;
        }
        let slot = self.slot(key);
        let Ok(_turn) = slot.queue.try_lock() else {
            return false;
        };
        slot.bucket().try_consume(Instant::now())
    }

    /// Current state of the bucket for `key` (created full if absent).
    pub fn snapshot(&self, key: &str) -> BucketSnapshot {
        if self.is_unlimited() {
            return BucketSnapshot {
                rate: f64::INFINITY,
                capacity: f64::INFINITY,
                tokens: f64::INFINITY,
                estimated_wait: None,
            };
        }
        let slot = self.slot(key);
        let mut bucket = slot.bucket();
        bucket.refill(Instant::now());
        BucketSnapshot {
            rate: bucket.rate,
            capacity: bucket.capacity,
            tokens: bucket.tokens,
            estimated_wait: bucket.estimated_wait(),
        }
    }

    /// Remember that `key` just rejected a call.
    pub fn record_error(&self, key: &str) {
        self.last_error.insert(key.to_owned(), Instant::now());
        metrics::counter!(telemetry::RATE_LIMIT_ERRORS_TOTAL, "resource" => key.to_owned())
            .increment(1);
        warn!(resource = key, "recorded rate limit error");
    }

    /// Suggested wait before calling `key` again.
    ///
    /// `min_wait` when there is no recorded error or the last one is more
    /// recent than `min_wait`; otherwise `base_wait` per minute elapsed since
    /// the error, capped at `max_wait`.
    pub fn wait_time(&self, key: &str) -> Duration {
        let Some(last_error) = self.last_error.get(key).map(|at| *at) else {
            return self.config.min_wait;
        };
        let since = last_error.elapsed();
        if since < self.config.min_wait {
            return self.config.min_wait;
        }
        let scaled = self.config.base_wait.as_secs_f64() * (since.as_secs_f64() / 60.0);
        Duration::try_from_secs_f64(scaled)
            .unwrap_or(self.config.max_wait)
            .min(self.config.max_wait)
    }

    /// Retry policy for calls guarded by this limiter.
    ///
    /// `max_retries` attempts, backing off from `min_wait` up to `max_wait`.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            RetryConfig::new()
                .max_attempts(self.config.max_retries)
                .base_delay(self.config.min_wait)
                .max_delay(self.config.max_wait),
        )
    }
}

/// Acquire a token for `key`, then run `op` under the limiter's retry policy.
///
/// Every failed attempt is recorded with [`RateLimiter::record_error`].
pub async fn with_rate_limit<F, Fut, T>(limiter: &RateLimiter, key: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    limiter.acquire(key).await;
    limiter
        .retry_policy()
        .execute(&[], || {
            let attempt = op();
            async move {
                let outcome = attempt.await;
                if outcome.is_err() {
                    limiter.record_error(key);
                }
                outcome
            }
        })
        .await
}
