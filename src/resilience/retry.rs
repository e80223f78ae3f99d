//! Retry configuration, delay calculation, and the retry wrapper.
//!
//! [`RetryPolicy::execute`] runs an async operation with a per-attempt
//! timeout and deterministic exponential backoff. [`RetryPolicy::wrap`]
//! turns an operation into a [`Retrying`] value for callers that prefer
//! to compose the wrapped operation once and call it repeatedly.

use std::future::Future;
use std::time::Duration;

use tracing::{error, warn};

use crate::telemetry;
use crate::{ErrorKind, Result, SkjoldError};

/// Configuration for retry behaviour.
///
/// Uses exponential backoff without jitter, so delays depend only on the
/// attempt index:
///
/// ```rust
/// # use skjold::RetryConfig;
/// # use std::time::Duration;
/// let config = RetryConfig::new()
///     .max_attempts(5)
///     .base_delay(Duration::from_millis(200))
///     .timeout(Duration::from_secs(30));
/// ```
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts (including the initial one).
    /// 1 = no retry. Default: 3.
    pub max_attempts: u32,
    /// Delay before the first retry. Default: 2s.
    pub base_delay: Duration,
    /// Maximum delay between retries (caps exponential growth). Default: 60s.
    pub max_delay: Duration,
    /// Deadline for each individual attempt. Default: 300s.
    pub timeout: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
            timeout: Duration::from_secs(300),
        }
    }
}

impl RetryConfig {
    /// Create a new config with sensible defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a config that disables retries (single attempt).
    pub fn disabled() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Set maximum attempts (including the initial one).
    pub fn max_attempts(mut self, n: u32) -> Self {
        self.max_attempts = n;
        self
    }

    /// Set the delay before the first retry.
    pub fn base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Set the maximum delay between retries.
    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set the per-attempt timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Calculate the delay after a failed attempt (0-indexed).
    ///
    /// `base_delay * 2^attempt`, capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt));
        delay.min(self.max_delay)
    }
}

/// Runs operations under a [`RetryConfig`].
#[derive(Debug, Clone, Default)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Execute an async operation with retry logic.
    ///
    /// Each attempt is bounded by `config.timeout`; an expired attempt
    /// becomes [`SkjoldError::Timeout`] and is retried like any other
    /// failure. Errors whose kind is in `excluded` are returned at once,
    /// unchanged. When every attempt fails, the last error is returned
    /// wrapped in [`SkjoldError::Generation`].
    pub async fn execute<F, Fut, T>(&self, excluded: &[ErrorKind], mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            let err = match tokio::time::timeout(self.config.timeout, op()).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(e)) => e,
                Err(_) => {
                    metrics::counter!(telemetry::TIMEOUTS_TOTAL).increment(1);
                    SkjoldError::Timeout(self.config.timeout)
                }
            };

            if err.is_any_of(excluded) {
                return Err(err);
            }

            attempt += 1;
            if attempt >= max_attempts {
                error!(attempts = attempt, error = %err, "all attempts failed");
                return Err(SkjoldError::Generation {
                    attempts: attempt,
                    source: Box::new(err),
                });
            }

            let delay = self.config.delay_for_attempt(attempt - 1);
            metrics::counter!(telemetry::RETRIES_TOTAL).increment(1);
            warn!(
                attempt,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "retrying after failed attempt"
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// Wrap an operation so every call runs under this policy.
    pub fn wrap<Op>(&self, op: Op) -> Retrying<Op> {
        Retrying {
            policy: self.clone(),
            excluded: Vec::new(),
            op,
        }
    }
}

/// An operation bound to a [`RetryPolicy`].
///
/// ```rust,no_run
/// # use skjold::{ErrorKind, RetryPolicy, Result};
/// # async fn fetch() -> Result<String> { Ok(String::new()) }
/// # async fn demo() -> Result<()> {
/// let fetch_with_retry = RetryPolicy::default()
///     .wrap(fetch)
///     .excluding([ErrorKind::InvalidResponse]);
/// let body = fetch_with_retry.call().await?;
/// # Ok(())
/// # }
/// ```
pub struct Retrying<Op> {
    policy: RetryPolicy,
    excluded: Vec<ErrorKind>,
    op: Op,
}

impl<Op> Retrying<Op> {
    /// Error kinds that abort without retry.
    pub fn excluding(mut self, kinds: impl IntoIterator<Item = ErrorKind>) -> Self {
        self.excluded.extend(kinds);
        self
    }

    /// Run the wrapped operation.
    pub async fn call<Fut, T>(&self) -> Result<T>
    where
        Op: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.policy.execute(&self.excluded, || (self.op)()).await
    }
}
