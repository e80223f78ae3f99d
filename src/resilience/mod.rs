//! Admission control and retry.
//!
//! - [`RateLimiter`]: per-resource token buckets plus error-driven backoff.
//! - [`RetryPolicy`]: bounded attempts with per-attempt timeout and
//!   exponential backoff.
//!
//! [`with_rate_limit`] combines the two the way rate-limited upstream calls
//! need them: one token, then retries paced by the limiter's wait bounds.

pub mod rate_limit;
pub mod retry;

pub use rate_limit::{BucketSnapshot, RateLimitConfig, RateLimiter, with_rate_limit};
pub use retry::{RetryConfig, RetryPolicy, Retrying};
