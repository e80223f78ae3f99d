//! Result cache for generated values.
//!
//! [`CacheStore`] keeps serialized values under a hashed key with a fixed
//! time-to-live. It never fails its caller: a missing entry, an undecodable
//! entry or a broken backend all read as a miss, and write failures are
//! logged and dropped. The primary operation must keep working when the
//! cache does not.
//!
//! # Backends
//!
//! Storage is pluggable through [`CacheBackend`]:
//!
//! - [`FileBackend`]: one JSON file per entry, written atomically
//!   (temp file + rename).
//! - [`MemoryBackend`]: in-process moka cache.
//! - `RedisBackend`: remote store with native expiry and a key prefix
//!   (requires the `redis` feature).
//!
//! Every backend stores the same record layout:
//!
//! ```json
//! {"data": <value>, "created_at": "2025-01-01T00:00:00Z", "expires_at": "2025-01-02T00:00:00Z"}
//! ```
//!
//! Expiry is always checked against `expires_at` on read, even when the
//! backend also expires entries natively. A read that observes an expired
//! entry deletes it (lazy eviction; there is no background sweep).

pub mod backend;
pub mod codec;
pub mod file;
#[cfg(feature = "redis")]
pub mod remote;

pub use backend::{CacheBackend, MemoryBackend};
pub use codec::{CacheCodec, JsonCodec};
pub use file::FileBackend;
#[cfg(feature = "redis")]
pub use remote::RedisBackend;

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::telemetry;

/// Default time-to-live for cached values: 24 hours.
pub const DEFAULT_TTL: Duration = Duration::from_secs(24 * 3600);

/// Longest accepted time-to-live: 100 years. Native expiry in the memory
/// backend rejects anything near 1000 years.
pub const MAX_TTL: Duration = Duration::from_secs(100 * 365 * 24 * 3600);

/// Deletes in flight at once during [`CacheStore::clear`].
const CLEAR_CONCURRENCY: usize = 16;

/// A cached value together with its validity window.
///
/// `expires_at` is always `created_at + ttl`. The entry is valid while
/// `now <= expires_at`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry<T> {
    pub data: T,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl<T> CacheEntry<T> {
    /// Create an entry stamped now, expiring after `ttl`.
    pub fn new(data: T, ttl: Duration) -> Self {
        Self::created_at(data, Utc::now(), ttl)
    }

    /// Create an entry with an explicit creation time.
    pub fn created_at(data: T, created_at: DateTime<Utc>, ttl: Duration) -> Self {
        let expires_at = chrono::TimeDelta::from_std(ttl)
            .ok()
            .and_then(|delta| created_at.checked_add_signed(delta))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        Self {
            data,
            created_at,
            expires_at,
        }
    }

    /// Whether the entry is still valid at `now`.
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        now <= self.expires_at
    }

    /// Whether the entry has expired.
    pub fn is_expired(&self) -> bool {
        !self.is_valid_at(Utc::now())
    }
}

/// Point-in-time view of a cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    /// Backend name (e.g. `"file"`, `"redis"`).
    pub backend: &'static str,
    /// Entries currently stored, including expired ones not yet evicted.
    pub entries: usize,
}

/// Derive the storage identifier for a logical cache key.
///
/// SHA-256 of the key, lower-case hex. Keeps arbitrarily long or sensitive
/// keys out of file names and remote key spaces.
pub fn cache_id(key: &str) -> String {
    let digest = Sha256::digest(key.as_bytes());
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Typed TTL cache over a [`CacheBackend`].
///
/// `T` is the cached payload; `C` is the codec that turns it into JSON and
/// back. With the default [`JsonCodec`] any `Serialize + DeserializeOwned`
/// type works.
pub struct CacheStore<T, C = JsonCodec> {
    backend: Arc<dyn CacheBackend>,
    codec: C,
    ttl: Duration,
    _payload: PhantomData<fn() -> T>,
}

impl<T, C> CacheStore<T, C>
where
    C: CacheCodec<T> + Default,
{
    /// Create a store over `backend` using the default codec.
    pub fn new(backend: Arc<dyn CacheBackend>, ttl: Duration) -> Self {
        Self::with_codec(backend, ttl, C::default())
    }
}

impl<T, C> CacheStore<T, C>
where
    C: CacheCodec<T>,
{
    /// Create a store with an explicit codec.
    pub fn with_codec(backend: Arc<dyn CacheBackend>, ttl: Duration, codec: C) -> Self {
        Self {
            backend,
            codec,
            ttl,
            _payload: PhantomData,
        }
    }

    /// Time-to-live applied to new entries.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Name of the underlying backend.
    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Look up a value.
    ///
    /// Returns `None` on a miss, on an expired entry (which is then deleted)
    /// and on any read or decode failure.
    pub async fn get(&self, key: &str) -> Option<T> {
        let id = cache_id(key);
        let value = self.lookup(&id).await;
        let backend = self.backend.name();
        if value.is_some() {
            metrics::counter!(telemetry::CACHE_HITS_TOTAL, "backend" => backend).increment(1);
        } else {
            metrics::counter!(telemetry::CACHE_MISSES_TOTAL, "backend" => backend).increment(1);
        }
        value
    }

    async fn lookup(&self, id: &str) -> Option<T> {
        let bytes = match self.backend.read(id).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return None,
            Err(e) => {
                warn!(backend = self.backend.name(), id, error = %e, "cache read failed");
                return None;
            }
        };

        let entry: CacheEntry<serde_json::Value> = match serde_json::from_slice(&bytes) {
            Ok(entry) => entry,
            Err(e) => {
                debug!(id, error = %e, "undecodable cache record, treating as miss");
                return None;
            }
        };

        if entry.is_expired() {
            debug!(id, expires_at = %entry.expires_at, "cache entry expired");
            self.delete_quietly(id).await;
            return None;
        }

        match self.codec.decode(entry.data) {
            Ok(value) => Some(value),
            Err(e) => {
                debug!(id, error = %e, "cached payload does not match schema, treating as miss");
                None
            }
        }
    }

    /// Store a value, overwriting any previous entry for `key`.
    pub async fn set(&self, key: &str, value: &T) {
        let id = cache_id(key);
        let data = match self.codec.encode(value) {
            Ok(data) => data,
            Err(e) => {
                warn!(id = %id, error = %e, "failed to encode value for cache");
                return;
            }
        };
        let entry = CacheEntry::new(data, self.ttl);
        let bytes = match serde_json::to_vec(&entry) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(id = %id, error = %e, "failed to serialize cache record");
                return;
            }
        };
        if let Err(e) = self.backend.write(&id, &bytes, self.ttl).await {
            warn!(backend = self.backend.name(), id = %id, error = %e, "cache write failed");
        }
    }

    /// Remove the entry for `key`, if any. Best-effort.
    pub async fn invalidate(&self, key: &str) {
        self.delete_quietly(&cache_id(key)).await;
    }

    /// Remove every entry in this store's namespace. Best-effort.
    pub async fn clear(&self) {
        let ids = match self.backend.list_all().await {
            Ok(ids) => ids,
            Err(e) => {
                warn!(backend = self.backend.name(), error = %e, "failed to list cache entries");
                return;
            }
        };
        let failed = stream::iter(&ids)
            .map(|id| self.backend.delete(id))
            .buffer_unordered(CLEAR_CONCURRENCY)
            .filter(|outcome| std::future::ready(outcome.is_err()))
            .count()
            .await;
        if failed > 0 {
            warn!(
                backend = self.backend.name(),
                failed,
                total = ids.len(),
                "some cache entries could not be deleted"
            );
        }
    }

    /// Entry count and backend name.
    pub async fn stats(&self) -> CacheStats {
        let entries = match self.backend.list_all().await {
            Ok(ids) => ids.len(),
            Err(e) => {
                warn!(backend = self.backend.name(), error = %e, "failed to list cache entries");
                0
            }
        };
        CacheStats {
            backend: self.backend.name(),
            entries,
        }
    }

    /// Delete every expired or undecodable entry, returning how many were removed.
    pub async fn purge_expired(&self) -> usize {
        let ids = match self.backend.list_all().await {
            Ok(ids) => ids,
            Err(e) => {
                warn!(backend = self.backend.name(), error = %e, "failed to list cache entries");
                return 0;
            }
        };
        let now = Utc::now();
        let mut removed = 0;
        for id in ids {
            let stale = match self.backend.read(&id).await {
                Ok(Some(bytes)) => serde_json::from_slice::<CacheEntry<serde_json::Value>>(&bytes)
                    .map(|entry| !entry.is_valid_at(now))
                    .unwrap_or(true),
                // Vanished between list and read.
                Ok(None) => false,
                Err(_) => false,
            };
            if stale && self.backend.delete(&id).await.is_ok() {
                removed += 1;
            }
        }
        removed
    }

    async fn delete_quietly(&self, id: &str) {
        if let Err(e) = self.backend.delete(id).await {
            debug!(backend = self.backend.name(), id, error = %e, "cache delete failed");
        }
    }
}
