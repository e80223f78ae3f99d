//! Storage backend trait and the in-memory backend.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use moka::future::Cache;

use super::MAX_TTL;
use crate::Result;

/// Raw keyed storage underneath a [`CacheStore`](super::CacheStore).
///
/// Ids are already hashed (see [`cache_id`](super::cache_id)). Backends
/// store opaque bytes; expiry is decided by the store from the record
/// itself, `ttl` is only a hint for backends with native expiry.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Short backend name used in logs and metrics labels.
    fn name(&self) -> &'static str;

    /// Read the record stored under `id`.
    async fn read(&self, id: &str) -> Result<Option<Vec<u8>>>;

    /// Atomically replace the record stored under `id`.
    async fn write(&self, id: &str, bytes: &[u8], ttl: Duration) -> Result<()>;

    /// Delete the record stored under `id`. Deleting a missing id is not an error.
    async fn delete(&self, id: &str) -> Result<()>;

    /// Every id currently stored in this backend's namespace.
    async fn list_all(&self) -> Result<HashSet<String>>;
}

/// Default maximum number of entries held by [`MemoryBackend`].
const DEFAULT_MEMORY_MAX: u64 = 10_000;

/// In-process backend over a moka cache.
///
/// Entries are also dropped by moka after `ttl`, and by LRU once
/// `max_entries` is reached.
pub struct MemoryBackend {
    entries: Cache<String, Arc<Vec<u8>>>,
}

impl MemoryBackend {
    /// Create a backend bounded to `max_entries`, natively expiring after `ttl`.
    ///
    /// `ttl` is capped at [`MAX_TTL`].
    pub fn new(max_entries: u64, ttl: Duration) -> Self {
        let entries = Cache::builder()
            .max_capacity(max_entries)
            .time_to_live(ttl.min(MAX_TTL))
            .build();
        Self { entries }
    }

    /// Create a backend with the default capacity (10,000) and no native expiry.
    pub fn unbounded_ttl() -> Self {
        Self {
            entries: Cache::new(DEFAULT_MEMORY_MAX),
        }
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::unbounded_ttl()
    }
}

#[async_trait]
impl CacheBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn read(&self, id: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.get(id).await.map(|bytes| bytes.as_ref().clone()))
    }

    async fn write(&self, id: &str, bytes: &[u8], _ttl: Duration) -> Result<()> {
        self.entries
            .insert(id.to_owned(), Arc::new(bytes.to_vec()))
            .await;
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.entries.invalidate(id).await;
        Ok(())
    }

    async fn list_all(&self) -> Result<HashSet<String>> {
        Ok(self
            .entries
            .iter()
            .map(|(id, _)| id.as_ref().clone())
            .collect())
    }
}
