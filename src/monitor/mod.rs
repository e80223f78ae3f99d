//! Generation metrics over a rolling window, plus periodic resource sampling.
//!
//! [`MetricsCollector`] keeps the last `window_size` generation records in
//! a ring buffer and derives a [`MetricsWindow`] from them on demand. Each
//! record is also forwarded to the `metrics` facade (see
//! [`telemetry`](crate::telemetry)) so an installed recorder sees totals that
//! outlive the window.

pub mod system;

pub use system::{SystemMetrics, SystemSampler};

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{Result, SkjoldError, telemetry};

/// Number of error messages reported in [`MetricsWindow::common_errors`].
const TOP_ERRORS: usize = 5;

/// Collector settings.
#[derive(Debug, Clone)]
pub struct MetricsConfig {
    /// Records kept in the rolling window. Default: 1000.
    pub window_size: usize,
    /// Interval between resource samples. Default: 60s.
    pub sample_interval: Duration,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            window_size: 1000,
            sample_interval: Duration::from_secs(60),
        }
    }
}

impl MetricsConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records kept in the rolling window.
    pub fn window_size(mut self, size: usize) -> Self {
        self.window_size = size;
        self
    }

    /// How often the background sampler logs resource usage.
    pub fn sample_interval(mut self, interval: Duration) -> Self {
        self.sample_interval = interval;
        self
    }
}

/// Outcome of one generation call, as reported by the caller.
#[derive(Debug, Clone)]
pub struct GenerationRecord {
    pub resource_key: String,
    pub duration: Duration,
    pub success: bool,
    pub error: Option<String>,
    pub tokens: u64,
    pub cache_hit: bool,
}

impl GenerationRecord {
    pub fn success(resource_key: impl Into<String>, duration: Duration) -> Self {
        Self {
            resource_key: resource_key.into(),
            duration,
            success: true,
            error: None,
            tokens: 0,
            cache_hit: false,
        }
    }

    pub fn failure(
        resource_key: impl Into<String>,
        duration: Duration,
        error: impl Into<String>,
    ) -> Self {
        Self {
            resource_key: resource_key.into(),
            duration,
            success: false,
            error: Some(error.into()),
            tokens: 0,
            cache_hit: false,
        }
    }

    /// Tokens produced by the call.
    pub fn tokens(mut self, tokens: u64) -> Self {
        self.tokens = tokens;
        self
    }

    /// Whether the result came from the cache.
    pub fn cache_hit(mut self, hit: bool) -> Self {
        self.cache_hit = hit;
        self
    }
}

/// One entry of the rolling window.
#[derive(Debug, Clone, Serialize)]
pub struct GenerationMetric {
    pub timestamp: DateTime<Utc>,
    pub duration_ms: f64,
    pub success: bool,
    pub error: Option<String>,
    pub resource_key: String,
    pub tokens: u64,
    pub cache_hit: bool,
}

impl From<GenerationRecord> for GenerationMetric {
    fn from(record: GenerationRecord) -> Self {
        Self {
            timestamp: Utc::now(),
            duration_ms: record.duration.as_secs_f64() * 1000.0,
            success: record.success,
            error: record.error,
            resource_key: record.resource_key,
            tokens: record.tokens,
            cache_hit: record.cache_hit,
        }
    }
}

/// How often an error message occurred in the window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorCount {
    pub message: String,
    pub count: usize,
}

/// Aggregates over the current window. Rates are fractions in `[0, 1]`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsWindow {
    pub window_size: usize,
    pub total_requests: usize,
    pub success_rate: f64,
    pub avg_duration_ms: f64,
    pub p95_duration_ms: f64,
    pub cache_hit_rate: f64,
    pub error_rate: f64,
    /// Most frequent non-empty error messages, most frequent first.
    pub common_errors: Vec<ErrorCount>,
}

impl MetricsWindow {
    fn empty(window_size: usize) -> Self {
        Self {
            window_size,
            total_requests: 0,
            success_rate: 0.0,
            avg_duration_ms: 0.0,
            p95_duration_ms: 0.0,
            cache_hit_rate: 0.0,
            error_rate: 0.0,
            common_errors: Vec::new(),
        }
    }

    fn compute<'a>(
        window_size: usize,
        records: impl ExactSizeIterator<Item = &'a GenerationMetric>,
    ) -> Self {
        let total = records.len();
        if total == 0 {
            return Self::empty(window_size);
        }

        let mut successes = 0usize;
        let mut cache_hits = 0usize;
        let mut durations = Vec::with_capacity(total);
        let mut errors: HashMap<&str, usize> = HashMap::new();
        for record in records {
            successes += usize::from(record.success);
            cache_hits += usize::from(record.cache_hit);
            durations.push(record.duration_ms);
            if let Some(message) = record.error.as_deref().filter(|m| !m.is_empty()) {
                *errors.entry(message).or_default() += 1;
            }
        }
        durations.sort_by(f64::total_cmp);

        let mut common_errors: Vec<ErrorCount> = errors
            .into_iter()
            .map(|(message, count)| ErrorCount {
                message: message.to_owned(),
                count,
            })
            .collect();
        common_errors.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.message.cmp(&b.message)));
        common_errors.truncate(TOP_ERRORS);

        let total_f = total as f64;
        Self {
            window_size,
            total_requests: total,
            success_rate: successes as f64 / total_f,
            avg_duration_ms: durations.iter().sum::<f64>() / total_f,
            p95_duration_ms: nearest_rank(&durations, 0.95),
            cache_hit_rate: cache_hits as f64 / total_f,
            error_rate: (total - successes) as f64 / total_f,
            common_errors,
        }
    }
}

/// Nearest-rank percentile of an ascending, non-empty slice.
fn nearest_rank(sorted: &[f64], percentile: f64) -> f64 {
    let rank = (percentile * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

/// sysinfo refreshes and `/proc` reads block, so they run on the blocking pool.
async fn sample_off_runtime(system: Arc<SystemSampler>) -> Result<SystemMetrics> {
    tokio::task::spawn_blocking(move || system.sample())
        .await
        .map_err(|e| SkjoldError::Operation(format!("system sampling task failed: {e}")))?
}

struct Sampler {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Records generation outcomes and samples process resources.
pub struct MetricsCollector {
    config: MetricsConfig,
    window: Mutex<VecDeque<GenerationMetric>>,
    system: Arc<SystemSampler>,
    sampler: Mutex<Option<Sampler>>,
}

impl MetricsCollector {
    pub fn new(config: MetricsConfig) -> Result<Self> {
        let capacity = config.window_size.max(1);
        Ok(Self {
            window: Mutex::new(VecDeque::with_capacity(capacity)),
            system: Arc::new(SystemSampler::new()?),
            sampler: Mutex::new(None),
            config,
        })
    }

    pub fn config(&self) -> &MetricsConfig {
        &self.config
    }

    /// Append a record, evicting the oldest once the window is full.
    pub fn record_generation(&self, record: GenerationRecord) {
        let metric = GenerationMetric::from(record);

        let status = if metric.success { "ok" } else { "error" };
        let resource = metric.resource_key.clone();
        metrics::counter!(
            telemetry::GENERATIONS_TOTAL,
            "resource" => resource.clone(),
            "status" => status
        )
        .increment(1);
        metrics::histogram!(telemetry::GENERATION_DURATION_SECONDS, "resource" => resource.clone())
            .record(metric.duration_ms / 1000.0);
        if metric.tokens > 0 {
            metrics::counter!(telemetry::TOKENS_TOTAL, "resource" => resource).increment(metric.tokens);
        }

        let mut window = self.window.lock().unwrap_or_else(PoisonError::into_inner);
        while window.len() >= self.config.window_size.max(1) {
            window.pop_front();
        }
        window.push_back(metric);
    }

    /// Aggregates over the records currently in the window.
    pub fn window_metrics(&self) -> MetricsWindow {
        let window = self.window.lock().unwrap_or_else(PoisonError::into_inner);
        MetricsWindow::compute(self.config.window_size, window.iter())
    }

    /// Copy of the records currently in the window, oldest first.
    pub fn records(&self) -> Vec<GenerationMetric> {
        let window = self.window.lock().unwrap_or_else(PoisonError::into_inner);
        window.iter().cloned().collect()
    }

    /// Sample resource usage now.
    pub fn system_metrics(&self) -> Result<SystemMetrics> {
        self.system.sample()
    }

    /// Sample resource usage on the blocking pool.
    pub async fn sample_system(&self) -> Result<SystemMetrics> {
        sample_off_runtime(Arc::clone(&self.system)).await
    }

    /// Await `work`, recording its duration and outcome under `resource_key`.
    pub async fn track<F, T>(&self, resource_key: &str, work: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let started = tokio::time::Instant::now();
        let outcome = work.await;
        let elapsed = started.elapsed();
        let record = match &outcome {
            Ok(_) => GenerationRecord::success(resource_key, elapsed),
            Err(e) => GenerationRecord::failure(resource_key, elapsed, e.to_string()),
        };
        self.record_generation(record);
        outcome
    }

    /// Start logging resource samples every `sample_interval`.
    /// Calling it again while running does nothing.
    ///
    /// # Panics
    ///
    /// Requires a tokio runtime context.
    pub fn start_monitoring(&self) {
        let mut slot = self.sampler.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            debug!("resource sampler already running");
            return;
        }

        let token = CancellationToken::new();
        let stop = token.clone();
        let system = Arc::clone(&self.system);
        let interval = self.config.sample_interval;
        let handle = tokio::spawn(async move {
            loop {
                match sample_off_runtime(Arc::clone(&system)).await {
                    Ok(m) => info!(
                        cpu_percent = m.cpu_percent,
                        memory_percent = m.memory_percent,
                        disk_usage_percent = m.disk_usage_percent,
                        open_files = m.open_files,
                        thread_count = m.thread_count,
                        "system metrics"
                    ),
                    Err(e) => error!(error = %e, "failed to sample system metrics"),
                }
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
            }
        });

        info!(interval_secs = interval.as_secs(), "metrics monitoring started");
        *slot = Some(Sampler { token, handle });
    }

    /// Stop the sampler and wait for it to exit.
    pub async fn stop_monitoring(&self) {
        let sampler = self
            .sampler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(Sampler { token, handle }) = sampler {
            token.cancel();
            if let Err(e) = handle.await {
                warn!(error = %e, "resource sampler ended abnormally");
            }
            info!("metrics monitoring stopped");
        }
    }
}

impl Drop for MetricsCollector {
    fn drop(&mut self) {
        let sampler = self
            .sampler
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(sampler) = sampler {
            sampler.token.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nearest_rank_picks_ceiling_rank() {
        let values: Vec<f64> = (1..=20).map(f64::from).collect();
        assert_eq!(nearest_rank(&values, 0.95), 19.0);
        assert_eq!(nearest_rank(&[7.0], 0.95), 7.0);
        let hundred: Vec<f64> = (1..=100).map(f64::from).collect();
        assert_eq!(nearest_rank(&hundred, 0.95), 95.0);
    }

    #[test]
    fn error_ties_sorted_by_message() {
        let metric = |error: &str| GenerationMetric {
            timestamp: Utc::now(),
            duration_ms: 1.0,
            success: false,
            error: Some(error.to_owned()),
            resource_key: "m".into(),
            tokens: 0,
            cache_hit: false,
        };
        let records = vec![metric("b"), metric("a"), metric("c"), metric("c"), metric("")];
        let window = MetricsWindow::compute(10, records.iter());
        let messages: Vec<&str> = window.common_errors.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(messages, vec!["c", "a", "b"]);
        assert_eq!(window.error_rate, 1.0);
    }
}
