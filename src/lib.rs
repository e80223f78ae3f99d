//! Skjold - reliability layer for slow, rate-limited generation calls
//!
//! This crate wraps an expensive upstream call (typically an LLM
//! invocation) in the machinery it needs to run in production: a TTL result
//! cache, per-resource token-bucket admission, retry with per-attempt
//! timeout and exponential backoff, background task tracking and rolling
//! metrics. It is payload-agnostic: the cached value is any serializable
//! `T` and the protected operation is any async closure returning
//! [`Result<T>`].
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use skjold::{FileBackend, GuardedRequest, RateLimitConfig, Skjold};
//!
//! #[tokio::main]
//! async fn main() -> skjold::Result<()> {
//!     let guard = Skjold::builder::<String>()
//!         .cache(Arc::new(FileBackend::new(".cache")?))
//!         .rate_limit(RateLimitConfig::new().requests_per_minute(20))
//!         .build()?;
//!     guard.start();
//!
//!     let request = GuardedRequest::new("transcript text", "llama3");
//!     let diagram = guard
//!         .run(&request, || async { Ok("generated".to_string()) })
//!         .await?;
//!     println!("{diagram}");
//!
//!     guard.stop().await;
//!     Ok(())
//! }
//! ```
//!
//! # Components
//!
//! Each piece is usable on its own:
//!
//! - [`CacheStore`]: keyed TTL cache over a pluggable [`CacheBackend`]
//! - [`RateLimiter`]: token bucket per resource key
//! - [`RetryPolicy`]: bounded attempts with timeout and backoff
//! - [`TaskManager`]: fire-and-forget tasks with pollable status
//! - [`MetricsCollector`]: rolling generation metrics and resource sampling
//!
//! [`Guard`] composes them; [`Config`] loads their settings from TOML and
//! the environment.

pub mod cache;
pub mod config;
pub mod error;
pub mod gateway;
pub mod monitor;
pub mod resilience;
pub mod tasks;
pub mod telemetry;
mod version;

// Re-export main types at crate root
pub use error::{ErrorKind, Result, SkjoldError};
pub use gateway::{
    AvailabilityProbe, Guard, GuardBuilder, GuardSnapshot, GuardedRequest, Skjold, TokenCounter,
};
pub use version::{BuildInfo, PKG_VERSION, version_string};

pub use cache::{
    CacheBackend, CacheCodec, CacheEntry, CacheStats, CacheStore, FileBackend, JsonCodec,
    MemoryBackend,
};
#[cfg(feature = "redis")]
pub use cache::RedisBackend;
pub use config::{CacheBackendKind, Config, RedisConfig, Secrets};
pub use monitor::{
    ErrorCount, GenerationMetric, GenerationRecord, MetricsCollector, MetricsConfig, MetricsWindow,
    SystemMetrics,
};
pub use resilience::{
    BucketSnapshot, RateLimitConfig, RateLimiter, RetryConfig, RetryPolicy, Retrying,
    with_rate_limit,
};
pub use tasks::{TaskId, TaskManager, TaskManagerConfig, TaskState, TaskStatus};
