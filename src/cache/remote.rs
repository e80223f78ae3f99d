//! Redis backend with native expiry.
//!
//! Keys are namespaced with a prefix (default `skjold:`) so that `clear`
//! and `list_all` only ever touch this cache's entries.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info};

use super::CacheBackend;
use crate::config::RedisConfig;
use crate::{Result, SkjoldError};

/// Keys fetched per `SCAN` round trip.
const SCAN_BATCH: usize = 100;

/// Remote backend storing records with `SETEX`.
pub struct RedisBackend {
    client: ::redis::Client,
    prefix: String,
}

impl RedisBackend {
    /// Create a backend. Does not connect until first use; see [`ping`](Self::ping).
    pub fn new(config: &RedisConfig) -> Result<Self> {
        let info = ::redis::ConnectionInfo {
            addr: ::redis::ConnectionAddr::Tcp(config.host.clone(), config.port),
            redis: ::redis::RedisConnectionInfo {
                db: config.db,
                username: None,
                password: config.password.clone(),
            },
        };
        let client = ::redis::Client::open(info).map_err(redis_error)?;
        Ok(Self {
            client,
            prefix: config.prefix.clone(),
        })
    }

    /// Verify the server is reachable.
    pub async fn ping(&self) -> Result<()> {
        let mut conn = self.connection().await?;
        ::redis::cmd("PING")
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(redis_error)?;
        info!(prefix = %self.prefix, "connected to redis cache");
        Ok(())
    }

    async fn connection(&self) -> Result<::redis::aio::Connection> {
        self.client
            .get_async_connection()
            .await
            .map_err(redis_error)
    }

    fn key(&self, id: &str) -> String {
        format!("{}{}", self.prefix, id)
    }
}

fn redis_error(e: ::redis::RedisError) -> SkjoldError {
    SkjoldError::Cache(format!("redis: {e}"))
}

#[async_trait]
impl CacheBackend for RedisBackend {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn read(&self, id: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.connection().await?;
        ::redis::cmd("GET")
            .arg(self.key(id))
            .query_async::<_, Option<Vec<u8>>>(&mut conn)
            .await
            .map_err(redis_error)
    }

    async fn write(&self, id: &str, bytes: &[u8], ttl: Duration) -> Result<()> {
        let mut conn = self.connection().await?;
        // SETEX rejects a zero expiry.
        let secs = ttl.as_secs().max(1);
        ::redis::cmd("SETEX")
            .arg(self.key(id))
            .arg(secs)
            .arg(bytes)
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(redis_error)
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let mut conn = self.connection().await?;
        ::redis::cmd("DEL")
            .arg(self.key(id))
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(redis_error)
    }

    async fn list_all(&self) -> Result<HashSet<String>> {
        let mut conn = self.connection().await?;
        let pattern = format!("{}*", self.prefix);
        let mut ids = HashSet::new();
        let mut cursor: u64 = 0;
        loop {
            let (next, keys): (u64, Vec<String>) = ::redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await
                .map_err(redis_error)?;
            ids.extend(
                keys.into_iter()
                    .filter_map(|k| k.strip_prefix(&self.prefix).map(str::to_owned)),
            );
            if next == 0 {
                break;
            }
            cursor = next;
        }
        debug!(count = ids.len(), "listed redis cache keys");
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_prefixed() {
        let backend = RedisBackend::new(&RedisConfig::default()).unwrap();
        assert_eq!(backend.key("abc"), "skjold:abc");
    }

    /// Requires a local redis: `cargo test --features redis -- --ignored`
    #[tokio::test]
    #[ignore]
    async fn live_redis_roundtrip() {
        let backend = RedisBackend::new(&RedisConfig {
            prefix: "skjold-test:".into(),
            ..RedisConfig::default()
        })
        .unwrap();
        backend.ping().await.expect("redis must be running");

        backend
            .write("abc", b"payload", Duration::from_secs(30))
            .await
            .unwrap();
        assert_eq!(backend.read("abc").await.unwrap(), Some(b"payload".to_vec()));
        assert!(backend.list_all().await.unwrap().contains("abc"));

        backend.delete("abc").await.unwrap();
        assert_eq!(backend.read("abc").await.unwrap(), None);
    }
}
