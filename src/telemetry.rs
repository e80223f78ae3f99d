//! Telemetry metric name constants.
//!
//! Centralised metric names for skjold operations. Consumers install
//! their own `metrics` recorder (e.g. prometheus, statsd); without a
//! recorder installed, all metric calls are no-ops.
//!
//! # Metric naming conventions
//!
//! All metrics are prefixed with `skjold_`. Counters end in `_total`,
//! histograms use meaningful units (e.g. `_seconds`).
//!
//! # Common labels
//!
//! - `resource`: resource key the call was admitted against (e.g. a model name)
//! - `status`: outcome: "ok" or "error"
//! - `backend`: cache backend name ("file", "redis", "memory")

/// Total generations recorded by the metrics collector.
///
/// Labels: `resource`, `status` ("ok" | "error").
pub const GENERATIONS_TOTAL: &str = "skjold_generations_total";

/// Generation duration in seconds.
///
/// Labels: `resource`.
pub const GENERATION_DURATION_SECONDS: &str = "skjold_generation_duration_seconds";

/// Total tokens produced by generations.
///
/// Labels: `resource`.
pub const TOKENS_TOTAL: &str = "skjold_tokens_total";

/// Total retry attempts (not counting the initial attempt).
pub const RETRIES_TOTAL: &str = "skjold_retries_total";

/// Total attempts that hit the per-attempt timeout.
pub const TIMEOUTS_TOTAL: &str = "skjold_timeouts_total";

/// Total cache hits.
///
/// Labels: `backend`.
pub const CACHE_HITS_TOTAL: &str = "skjold_cache_hits_total";

/// Total cache misses (including expired and undecodable entries).
///
/// Labels: `backend`.
pub const CACHE_MISSES_TOTAL: &str = "skjold_cache_misses_total";

/// Total times a caller had to wait for a rate limiter token.
///
/// Labels: `resource`.
pub const RATE_LIMIT_WAITS_TOTAL: &str = "skjold_rate_limit_waits_total";

/// Total upstream rate-limit errors recorded.
///
/// Labels: `resource`.
pub const RATE_LIMIT_ERRORS_TOTAL: &str = "skjold_rate_limit_errors_total";

/// Total background tasks reaching a terminal state.
///
/// Labels: `status` ("completed" | "failed").
pub const TASKS_TOTAL: &str = "skjold_tasks_total";

/// Total terminal tasks removed by the reaper.
pub const TASKS_REAPED_TOTAL: &str = "skjold_tasks_reaped_total";
