//! Builder for configuring guard instances

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;

use super::guard::{AvailabilityProbe, Guard, GuardParts, TokenCounter};
use crate::Result;
use crate::cache::{CacheBackend, CacheStore, DEFAULT_TTL};
use crate::config::Config;
use crate::monitor::{MetricsCollector, MetricsConfig};
use crate::resilience::{RateLimitConfig, RateLimiter, RetryConfig, RetryPolicy};
use crate::tasks::{TaskManager, TaskManagerConfig};

/// Main entry point for creating guard instances.
pub struct Skjold;

impl Skjold {
    /// Create a new builder for a guard producing `T`.
    pub fn builder<T>() -> GuardBuilder<T> {
        GuardBuilder::new()
    }
}

/// Builder for configuring guard instances.
///
/// Without a cache backend the guard runs uncached.
pub struct GuardBuilder<T> {
    cache_backend: Option<Arc<dyn CacheBackend>>,
    cache_ttl: Duration,
    rate_limit: RateLimitConfig,
    limiter: Option<Arc<RateLimiter>>,
    retry: RetryConfig,
    tasks: TaskManagerConfig,
    metrics: MetricsConfig,
    collector: Option<Arc<MetricsCollector>>,
    probe: Option<Arc<dyn AvailabilityProbe>>,
    token_counter: Option<TokenCounter<T>>,
}

impl<T> GuardBuilder<T> {
    pub fn new() -> Self {
        Self {
            cache_backend: None,
            cache_ttl: DEFAULT_TTL,
            rate_limit: RateLimitConfig::default(),
            limiter: None,
            retry: RetryConfig::default(),
            tasks: TaskManagerConfig::default(),
            metrics: MetricsConfig::default(),
            collector: None,
            probe: None,
            token_counter: None,
        }
    }

    /// Start from a loaded [`Config`], opening the configured cache backend.
    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self {
            cache_backend: config.cache.open_backend()?,
            cache_ttl: config.cache.ttl(),
            rate_limit: config.rate_limit.to_config(),
            retry: config.retry.to_config()?,
            tasks: config.tasks.to_config(),
            metrics: config.metrics.to_config(),
            ..Self::new()
        })
    }

    /// Cache results in `backend`.
    pub fn cache(mut self, backend: Arc<dyn CacheBackend>) -> Self {
        self.cache_backend = Some(backend);
        self
    }

    /// Disable caching.
    pub fn no_cache(mut self) -> Self {
        self.cache_backend = None;
        self
    }

    /// Time-to-live for cached results (default: 24 hours).
    pub fn cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    /// Token-bucket settings for a limiter owned by this guard.
    pub fn rate_limit(mut self, config: RateLimitConfig) -> Self {
        self.rate_limit = config;
        self
    }

    /// Share a limiter with other guards calling the same resources.
    /// Overrides [`rate_limit`](Self::rate_limit).
    pub fn limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    /// Attempts, backoff and per-attempt timeout.
    pub fn retry(mut self, config: RetryConfig) -> Self {
        self.retry = config;
        self
    }

    /// Reaper settings for submitted tasks.
    pub fn tasks(mut self, config: TaskManagerConfig) -> Self {
        self.tasks = config;
        self
    }

    /// Window size and sampling interval for a collector owned by this guard.
    pub fn metrics(mut self, config: MetricsConfig) -> Self {
        self.metrics = config;
        self
    }

    /// Record into an existing collector. Overrides [`metrics`](Self::metrics).
    pub fn collector(mut self, collector: Arc<MetricsCollector>) -> Self {
        self.collector = Some(collector);
        self
    }

    /// Check resource availability before the first attempt of every call.
    pub fn probe(mut self, probe: impl AvailabilityProbe + 'static) -> Self {
        self.probe = Some(Arc::new(probe));
        self
    }

    /// Count tokens in results for metrics (default: 0).
    pub fn token_counter(mut self, counter: impl Fn(&T) -> u64 + Send + Sync + 'static) -> Self {
        self.token_counter = Some(Arc::new(counter));
        self
    }
}

impl<T> GuardBuilder<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    /// Build the guard. Background loops start with [`Guard::start`].
    pub fn build(self) -> Result<Guard<T>> {
        let metrics = match self.collector {
            Some(collector) => collector,
            None => Arc::new(MetricsCollector::new(self.metrics)?),
        };
        let limiter = self
            .limiter
            .unwrap_or_else(|| Arc::new(RateLimiter::new(self.rate_limit)));

        Ok(Guard::from_parts(GuardParts {
            cache: self
                .cache_backend
                .map(|backend| CacheStore::new(backend, self.cache_ttl)),
            limiter,
            retry: RetryPolicy::new(self.retry),
            metrics,
            tasks: TaskManager::new(self.tasks),
            probe: self.probe,
            token_counter: self.token_counter,
        }))
    }
}

impl<T> Default for GuardBuilder<T> {
    fn default() -> Self {
        Self::new()
    }
}
