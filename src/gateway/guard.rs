//! The guarded call path: cache, probe, admission, retry, metrics.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::cache::{CacheStats, CacheStore};
use crate::monitor::{GenerationRecord, MetricsCollector, MetricsWindow, SystemMetrics};
use crate::resilience::{RateLimiter, RetryPolicy};
use crate::tasks::{TaskId, TaskManager, TaskStatus};
use crate::{ErrorKind, Result, SkjoldError};

/// Checks that a resource can serve requests before any attempt is made.
///
/// Implementations typically send a trivial request to the model.
#[async_trait]
pub trait AvailabilityProbe: Send + Sync {
    async fn check(&self, resource_key: &str) -> Result<()>;
}

/// Counts the tokens in a generated value for metrics.
pub type TokenCounter<T> = Arc<dyn Fn(&T) -> u64 + Send + Sync>;

/// One call through a [`Guard`].
#[derive(Debug, Clone)]
pub struct GuardedRequest {
    /// Logical cache key, usually the full generation input.
    pub cache_key: String,
    /// Rate limit bucket and metrics label, usually the model name.
    pub resource_key: String,
    /// Skip the cache read. The result is still written back.
    pub force_refresh: bool,
    /// Error kinds returned without retry.
    pub excluded: Vec<ErrorKind>,
}

impl GuardedRequest {
    pub fn new(cache_key: impl Into<String>, resource_key: impl Into<String>) -> Self {
        Self {
            cache_key: cache_key.into(),
            resource_key: resource_key.into(),
            force_refresh: false,
            excluded: Vec::new(),
        }
    }

    /// Skip the cache read for this call.
    pub fn force_refresh(mut self, force: bool) -> Self {
        self.force_refresh = force;
        self
    }

    /// Return errors of these kinds without retrying.
    pub fn excluding(mut self, kinds: impl IntoIterator<Item = ErrorKind>) -> Self {
        self.excluded.extend(kinds);
        self
    }
}

/// Everything a guard can report about itself.
#[derive(Debug, Clone, Serialize)]
pub struct GuardSnapshot {
    pub generation: MetricsWindow,
    /// `None` if sampling failed.
    pub system: Option<SystemMetrics>,
    /// `None` if caching is disabled.
    pub cache: Option<CacheStats>,
}

pub(super) struct GuardParts<T> {
    pub cache: Option<CacheStore<T>>,
    pub limiter: Arc<RateLimiter>,
    pub retry: RetryPolicy,
    pub metrics: Arc<MetricsCollector>,
    pub tasks: TaskManager<T>,
    pub probe: Option<Arc<dyn AvailabilityProbe>>,
    pub token_counter: Option<TokenCounter<T>>,
}

struct CallPath<T> {
    cache: Option<CacheStore<T>>,
    limiter: Arc<RateLimiter>,
    retry: RetryPolicy,
    metrics: Arc<MetricsCollector>,
    probe: Option<Arc<dyn AvailabilityProbe>>,
    token_counter: Option<TokenCounter<T>>,
}

impl<T> CallPath<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn tokens(&self, value: &T) -> u64 {
        self.token_counter.as_ref().map_or(0, |count| count(value))
    }

    async fn run<F, Fut>(&self, request: &GuardedRequest, op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let started = Instant::now();
        let resource = request.resource_key.as_str();

        if !request.force_refresh
            && let Some(cache) = &self.cache
            && let Some(hit) = cache.get(&request.cache_key).await
        {
            info!(resource, "returning cached result");
            self.metrics.record_generation(
                GenerationRecord::success(resource, started.elapsed())
                    .cache_hit(true)
                    .tokens(self.tokens(&hit)),
            );
            return Ok(hit);
        }

        let outcome = self.generate(request, op).await;
        let elapsed = started.elapsed();
        match &outcome {
            Ok(value) => {
                self.metrics.record_generation(
                    GenerationRecord::success(resource, elapsed).tokens(self.tokens(value)),
                );
                if let Some(cache) = &self.cache {
                    cache.set(&request.cache_key, value).await;
                }
                info!(resource, elapsed_ms = elapsed.as_millis() as u64, "generation succeeded");
            }
            Err(e) => {
                self.metrics
                    .record_generation(GenerationRecord::failure(resource, elapsed, e.to_string()));
                warn!(resource, error = %e, "generation failed");
            }
        }
        outcome
    }

    async fn generate<F, Fut>(&self, request: &GuardedRequest, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let resource = request.resource_key.as_str();

        if let Some(probe) = &self.probe {
            probe.check(resource).await.map_err(|e| match e {
                SkjoldError::ModelNotAvailable(_) => e,
                other => SkjoldError::ModelNotAvailable(format!("{resource}: {other}")),
            })?;
            debug!(resource, "availability probe passed");
        }

        let limiter = &self.limiter;
        self.retry
            .execute(&request.excluded, || {
                // Futures are lazy: nothing runs until admission below.
                let attempt = op();
                async move {
                    limiter.acquire(resource).await;
                    let outcome = attempt.await;
                    if let Err(e) = &outcome
                        && e.kind() == ErrorKind::RateLimit
                    {
                        limiter.record_error(resource);
                    }
                    outcome
                }
            })
            .await
    }
}

/// Reliability layer around a generation call producing `T`.
///
/// A call first checks the cache; on a miss it probes the resource, then
/// runs the operation under the retry policy with one rate-limit token per
/// attempt, records the outcome and writes a success back to the cache.
///
/// ```rust,no_run
/// # use skjold::{GuardedRequest, Skjold};
/// # async fn demo() -> skjold::Result<()> {
/// let guard = Skjold::builder::<String>().build()?;
/// guard.start();
///
/// let request = GuardedRequest::new("summarise: ...", "llama3");
/// let text = guard
///     .run(&request, || async { Ok("summary".to_string()) })
///     .await?;
///
/// guard.stop().await;
/// # Ok(())
/// # }
/// ```
pub struct Guard<T> {
    path: Arc<CallPath<T>>,
    tasks: TaskManager<T>,
}

impl<T> Guard<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    pub(super) fn from_parts(parts: GuardParts<T>) -> Self {
        Self {
            path: Arc::new(CallPath {
                cache: parts.cache,
                limiter: parts.limiter,
                retry: parts.retry,
                metrics: parts.metrics,
                probe: parts.probe,
                token_counter: parts.token_counter,
            }),
            tasks: parts.tasks,
        }
    }

    /// Run `op` through the full call path and await the result.
    ///
    /// `op` is called once per attempt; the future it returns is polled only
    /// after a rate-limit token has been acquired.
    pub async fn run<F, Fut>(&self, request: &GuardedRequest, op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.path.run(request, op).await
    }

    /// Run `op` through the full call path as a tracked background task.
    pub fn submit<F, Fut>(&self, request: GuardedRequest, op: F) -> TaskId
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let path = Arc::clone(&self.path);
        self.tasks
            .create_task(async move { path.run(&request, op).await })
    }

    pub fn status(&self, id: TaskId) -> Option<TaskStatus<T>> {
        self.tasks.get_status(id)
    }

    pub fn statuses(&self) -> HashMap<TaskId, TaskStatus<T>> {
        self.tasks.get_all_statuses()
    }

    /// Cancel a submitted task.
    pub fn cancel(&self, id: TaskId) -> bool {
        self.tasks.cancel(id)
    }

    /// Window metrics, a resource sample and cache stats.
    pub async fn snapshot(&self) -> GuardSnapshot {
        let system = match self.path.metrics.sample_system().await {
            Ok(system) => Some(system),
            Err(e) => {
                warn!(error = %e, "failed to sample system metrics");
                None
            }
        };
        let cache = match &self.path.cache {
            Some(cache) => Some(cache.stats().await),
            None => None,
        };
        GuardSnapshot {
            generation: self.path.metrics.window_metrics(),
            system,
            cache,
        }
    }

    /// Drop every cached result.
    pub async fn clear_cache(&self) {
        if let Some(cache) = &self.path.cache {
            cache.clear().await;
            info!(backend = cache.backend_name(), "cache cleared");
        }
    }

    /// Start the task reaper and the resource sampler.
    pub fn start(&self) {
        self.tasks.start();
        self.path.metrics.start_monitoring();
        info!("guard started");
    }

    /// Stop the background loops. Submitted tasks keep running.
    pub async fn stop(&self) {
        self.tasks.stop().await;
        self.path.metrics.stop_monitoring().await;
        info!("guard stopped");
    }

    /// Stop the background loops and cancel every submitted task.
    pub async fn shutdown(&self) {
        self.tasks.shutdown().await;
        self.path.metrics.stop_monitoring().await;
        info!("guard shut down");
    }

    pub fn cache(&self) -> Option<&CacheStore<T>> {
        self.path.cache.as_ref()
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.path.limiter
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.path.retry
    }

    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.path.metrics
    }

    pub fn tasks(&self) -> &TaskManager<T> {
        &self.tasks
    }
}
