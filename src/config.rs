//! Configuration loading.
//!
//! Configuration is loaded from TOML files with the following resolution order:
//! 1. explicit path (`--config <path>`)
//! 2. `$SKJOLD_CONFIG`
//! 3. `~/.skjold/config.toml` (user)
//! 4. `/etc/skjold/config.toml` (system)
//!
//! If none exists the built-in defaults are used. Environment variables are
//! applied on top of whatever was loaded (see [`Config::apply_env_overrides`]).
//!
//! Secrets are loaded separately with mandatory permission checks:
//! 1. `~/.skjold/secrets.toml` (user, must be 0600)
//! 2. `/etc/skjold/secrets.toml` (system, must be 0600)

use std::fmt::Display;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::cache::{CacheBackend, FileBackend, MAX_TTL, MemoryBackend};
use crate::monitor::MetricsConfig;
use crate::resilience::{RateLimitConfig, RetryConfig};
use crate::tasks::TaskManagerConfig;
use crate::{Result, SkjoldError};

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV_VAR: &str = "SKJOLD_CONFIG";

/// Full configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub cache: CacheConfig,
    pub rate_limit: RateLimitSettings,
    pub retry: RetrySettings,
    pub tasks: TaskSettings,
    pub metrics: MetricsSettings,
}

/// Which cache backend to use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackendKind {
    #[default]
    File,
    Redis,
    Memory,
    /// Caching disabled.
    #[serde(rename = "none")]
    Disabled,
}

/// Cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub backend: CacheBackendKind,
    /// Directory for the file backend (default: `.cache`).
    pub dir: PathBuf,
    /// Time-to-live in hours (default: 24).
    pub ttl_hours: u64,
    /// Entry bound for the memory backend (default: 10000).
    pub max_entries: u64,
    pub redis: RedisConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            backend: CacheBackendKind::File,
            dir: PathBuf::from(".cache"),
            ttl_hours: 24,
            max_entries: 10_000,
            redis: RedisConfig::default(),
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_hours.saturating_mul(3600))
    }

    /// Open the configured backend, or `None` when caching is disabled.
    pub fn open_backend(&self) -> Result<Option<Arc<dyn CacheBackend>>> {
        let backend: Arc<dyn CacheBackend> = match self.backend {
            CacheBackendKind::Disabled => return Ok(None),
            CacheBackendKind::File => Arc::new(FileBackend::new(&self.dir)?),
            CacheBackendKind::Memory => Arc::new(MemoryBackend::new(self.max_entries, self.ttl())),
            CacheBackendKind::Redis => open_redis(&self.redis)?,
        };
        debug!(backend = backend.name(), "opened cache backend");
        Ok(Some(backend))
    }
}

#[cfg(feature = "redis")]
fn open_redis(config: &RedisConfig) -> Result<Arc<dyn CacheBackend>> {
    Ok(Arc::new(crate::cache::RedisBackend::new(config)?))
}

#[cfg(not(feature = "redis"))]
fn open_redis(_config: &RedisConfig) -> Result<Arc<dyn CacheBackend>> {
    Err(SkjoldError::Configuration(
        "cache backend \"redis\" requires the `redis` feature".to_string(),
    ))
}

/// Redis connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    pub host: String,
    pub port: u16,
    pub db: i64,
    /// Loaded from secrets or `REDIS_PASSWORD`, never written back out.
    #[serde(skip_serializing)]
    pub password: Option<String>,
    /// Namespace prepended to every key (default: `skjold:`).
    pub prefix: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 6379,
            db: 0,
            password: None,
            prefix: "skjold:".to_string(),
        }
    }
}

/// Rate limiter settings, in whole seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitSettings {
    pub requests_per_minute: u32,
    pub max_retries: u32,
    pub min_wait_secs: u64,
    pub max_wait_secs: u64,
    pub base_wait_secs: u64,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            requests_per_minute: 20,
            max_retries: 3,
            min_wait_secs: 60,
            max_wait_secs: 3600,
            base_wait_secs: 60,
        }
    }
}

impl RateLimitSettings {
    pub fn to_config(&self) -> RateLimitConfig {
        RateLimitConfig::new()
            .requests_per_minute(self.requests_per_minute)
            .max_retries(self.max_retries)
            .min_wait(Duration::from_secs(self.min_wait_secs))
            .max_wait(Duration::from_secs(self.max_wait_secs))
            .base_wait(Duration::from_secs(self.base_wait_secs))
    }
}

/// Retry settings. Delays are fractional seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub base_delay_secs: f64,
    pub max_delay_secs: f64,
    pub timeout_secs: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_secs: 2.0,
            max_delay_secs: 60.0,
            timeout_secs: 300.0,
        }
    }
}

impl RetrySettings {
    pub fn to_config(&self) -> Result<RetryConfig> {
        Ok(RetryConfig::new()
            .max_attempts(self.max_attempts)
            .base_delay(seconds("retry.base_delay_secs", self.base_delay_secs)?)
            .max_delay(seconds("retry.max_delay_secs", self.max_delay_secs)?)
            .timeout(seconds("retry.timeout_secs", self.timeout_secs)?))
    }
}

fn seconds(field: &str, value: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(value).map_err(|e| {
        SkjoldError::Configuration(format!("{field} must be a non-negative number: {e}"))
    })
}

/// Task reaper settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskSettings {
    pub reap_interval_secs: u64,
    pub retention_secs: u64,
}

impl Default for TaskSettings {
    fn default() -> Self {
        Self {
            reap_interval_secs: 300,
            retention_secs: 3600,
        }
    }
}

impl TaskSettings {
    pub fn to_config(&self) -> TaskManagerConfig {
        TaskManagerConfig::new()
            .reap_interval(Duration::from_secs(self.reap_interval_secs))
            .retention(Duration::from_secs(self.retention_secs))
    }
}

/// Metrics collector settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsSettings {
    pub window_size: usize,
    pub sample_interval_secs: u64,
}

impl Default for MetricsSettings {
    fn default() -> Self {
        Self {
            window_size: 1000,
            sample_interval_secs: 60,
        }
    }
}

impl MetricsSettings {
    pub fn to_config(&self) -> MetricsConfig {
        MetricsConfig::new()
            .window_size(self.window_size)
            .sample_interval(Duration::from_secs(self.sample_interval_secs))
    }
}

impl Config {
    /// Load configuration from the standard locations, then apply environment
    /// overrides and, for the redis backend, the password from [`Secrets`].
    pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
        Self::load_with(explicit_path, |name| std::env::var(name).ok())
    }

    /// [`load`](Self::load) with an explicit environment lookup.
    pub fn load_with<E>(explicit_path: Option<&Path>, env: E) -> Result<Self>
    where
        E: Fn(&str) -> Option<String>,
    {
        let mut config = match Self::resolve_config_path(explicit_path, &env)? {
            Some(path) => {
                info!(path = %path.display(), "loading configuration");
                Self::from_file(&path)?
            }
            None => {
                debug!("no config file found, using defaults");
                Config::default()
            }
        };
        config.apply_env_overrides_with(&env)?;
        config.validate()?;

        // The secrets file takes precedence over REDIS_PASSWORD.
        if config.cache.backend == CacheBackendKind::Redis
            && let Some(secret) = Secrets::load()?.redis
        {
            config.cache.redis.password = Some(secret.password);
        }
        Ok(config)
    }

    /// Parse a config file without applying environment overrides.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            SkjoldError::Configuration(format!("Failed to read config file {path:?}: {e}"))
        })?;
        toml::from_str(&content).map_err(|e| {
            SkjoldError::Configuration(format!("Failed to parse config file {path:?}: {e}"))
        })
    }

    /// Resolve the config file path. `None` means use defaults.
    fn resolve_config_path<E>(explicit: Option<&Path>, env: &E) -> Result<Option<PathBuf>>
    where
        E: Fn(&str) -> Option<String>,
    {
        let named = explicit
            .map(Path::to_path_buf)
            .or_else(|| env(CONFIG_ENV_VAR).map(PathBuf::from));
        if let Some(path) = named {
            if path.exists() {
                return Ok(Some(path));
            }
            return Err(SkjoldError::Configuration(format!(
                "Config file not found: {path:?}"
            )));
        }

        // User config
        if let Some(home) = dirs::home_dir() {
            let user_config = home.join(".skjold").join("config.toml");
            if user_config.exists() {
                return Ok(Some(user_config));
            }
        }

        // System config
        let system_config = PathBuf::from("/etc/skjold/config.toml");
        if system_config.exists() {
            return Ok(Some(system_config));
        }

        Ok(None)
    }

    /// Apply overrides from the process environment.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_env_overrides_with(|name| std::env::var(name).ok())
    }

    /// Apply overrides from `env`. An unparseable value is an error.
    pub fn apply_env_overrides_with<E>(&mut self, env: E) -> Result<()>
    where
        E: Fn(&str) -> Option<String>,
    {
        if let Some(v) = parse_var(&env, "CACHE_TTL_HOURS")? {
            self.cache.ttl_hours = v;
        }
        if let Some(dir) = env("CACHE_DIR") {
            self.cache.dir = PathBuf::from(dir);
        }
        if let Some(host) = env("REDIS_HOST") {
            self.cache.redis.host = host;
        }
        if let Some(v) = parse_var(&env, "REDIS_PORT")? {
            self.cache.redis.port = v;
        }
        if let Some(v) = parse_var(&env, "REDIS_DB")? {
            self.cache.redis.db = v;
        }
        if let Some(password) = env("REDIS_PASSWORD") {
            self.cache.redis.password = Some(password);
        }
        if let Some(v) = parse_var(&env, "REQUESTS_PER_MINUTE")? {
            self.rate_limit.requests_per_minute = v;
        }
        if let Some(v) = parse_var(&env, "MAX_ATTEMPTS")? {
            self.retry.max_attempts = v;
        }
        if let Some(v) = parse_var(&env, "RETRY_BASE_DELAY")? {
            self.retry.base_delay_secs = v;
        }
        if let Some(v) = parse_var(&env, "MAX_RETRY_DELAY")? {
            self.retry.max_delay_secs = v;
        }
        if let Some(v) = parse_var(&env, "TIMEOUT_SECONDS")? {
            self.retry.timeout_secs = v;
        }
        if let Some(v) = parse_var(&env, "METRICS_WINDOW_SIZE")? {
            self.metrics.window_size = v;
        }
        Ok(())
    }

    /// Reject values the components cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.retry.max_attempts == 0 {
            return Err(SkjoldError::Configuration(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.metrics.window_size == 0 {
            return Err(SkjoldError::Configuration(
                "metrics.window_size must be at least 1".to_string(),
            ));
        }
        if self.cache.ttl() > MAX_TTL {
            return Err(SkjoldError::Configuration(format!(
                "cache.ttl_hours must not exceed {}",
                MAX_TTL.as_secs() / 3600
            )));
        }
        if self.rate_limit.min_wait_secs > self.rate_limit.max_wait_secs {
            return Err(SkjoldError::Configuration(
                "rate_limit.min_wait_secs must not exceed rate_limit.max_wait_secs".to_string(),
            ));
        }
        self.retry.to_config().map(|_| ())
    }

    /// Render as TOML. Secrets are never included.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| SkjoldError::Configuration(format!("Failed to render config: {e}")))
    }
}

fn parse_var<E, V>(env: &E, name: &str) -> Result<Option<V>>
where
    E: Fn(&str) -> Option<String>,
    V: FromStr,
    V::Err: Display,
{
    match env(name) {
        None => Ok(None),
        Some(raw) => raw.trim().parse().map(Some).map_err(|e| {
            SkjoldError::Configuration(format!("Invalid value {raw:?} for {name}: {e}"))
        }),
    }
}

/// Secrets configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Secrets {
    #[serde(default)]
    pub redis: Option<RedisSecret>,
}

/// Credentials for the redis cache.
#[derive(Debug, Clone, Deserialize)]
pub struct RedisSecret {
    pub password: String,
}

impl Secrets {
    /// Load secrets from the standard locations with permission checks.
    ///
    /// Resolution order:
    /// 1. `~/.skjold/secrets.toml` (if exists, must be 0600)
    /// 2. `/etc/skjold/secrets.toml` (if exists, must be 0600)
    ///
    /// Returns empty secrets if no file exists (the environment may still
    /// supply them).
    pub fn load() -> Result<Self> {
        if let Some(home) = dirs::home_dir() {
            let user_secrets = home.join(".skjold").join("secrets.toml");
            if user_secrets.exists() {
                return Self::load_from_file(&user_secrets);
            }
        }

        let system_secrets = PathBuf::from("/etc/skjold/secrets.toml");
        if system_secrets.exists() {
            return Self::load_from_file(&system_secrets);
        }

        Ok(Secrets::default())
    }

    /// Read a secrets file after checking its permissions.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        Self::check_permissions(path)?;
        let content = fs::read_to_string(path).map_err(|e| {
            SkjoldError::Configuration(format!("Failed to read secrets file {path:?}: {e}"))
        })?;
        toml::from_str(&content).map_err(|e| {
            SkjoldError::Configuration(format!("Failed to parse secrets file {path:?}: {e}"))
        })
    }

    /// Check that the secrets file has secure permissions (0600 or 0400).
    #[cfg(unix)]
    fn check_permissions(path: &Path) -> Result<()> {
        use std::os::unix::fs::PermissionsExt;

        let metadata = fs::metadata(path).map_err(|e| {
            SkjoldError::Configuration(format!("Failed to stat secrets file {path:?}: {e}"))
        })?;

        let mode = metadata.permissions().mode();
        // Reject if group or other bits are set
        if mode & 0o077 != 0 {
            return Err(SkjoldError::Configuration(format!(
                "Secrets file {path:?} has insecure permissions {:o}. Must be 0600 or 0400.",
                mode & 0o777
            )));
        }

        Ok(())
    }

    #[cfg(not(unix))]
    fn check_permissions(_path: &Path) -> Result<()> {
        Ok(())
    }

    /// Redis password from the secrets file, falling back to `REDIS_PASSWORD`.
    pub fn redis_password(&self) -> Option<String> {
        self.redis_password_with(|name| std::env::var(name).ok())
    }

    pub fn redis_password_with<E>(&self, env: E) -> Option<String>
    where
        E: Fn(&str) -> Option<String>,
    {
        self.redis
            .as_ref()
            .map(|s| s.password.clone())
            .or_else(|| env("REDIS_PASSWORD"))
    }
}
