//! Tests for `CacheStore` over the file and memory backends.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use skjold::cache::cache_id;
use skjold::{
    CacheBackend, CacheEntry, CacheStore, FileBackend, MemoryBackend, Result, SkjoldError,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Diagram {
    core_beliefs: Vec<String>,
    confidence: f64,
}

fn diagram() -> Diagram {
    Diagram {
        core_beliefs: vec!["I am unlovable".into()],
        confidence: 0.8,
    }
}

fn file_store(dir: &std::path::Path) -> (Arc<FileBackend>, CacheStore<Diagram>) {
    let backend = Arc::new(FileBackend::new(dir).unwrap());
    let store = CacheStore::new(backend.clone(), Duration::from_secs(3600));
    (backend, store)
}

/// Write a raw record whose validity window ended an hour ago.
async fn write_expired(backend: &dyn CacheBackend, key: &str, data: serde_json::Value) {
    let created = chrono::Utc::now() - chrono::TimeDelta::hours(2);
    let entry = CacheEntry::created_at(data, created, Duration::from_secs(3600));
    let bytes = serde_json::to_vec(&entry).unwrap();
    backend
        .write(&cache_id(key), &bytes, Duration::from_secs(60))
        .await
        .unwrap();
}

// ============================================================================
// File backend
// ============================================================================

#[tokio::test]
async fn set_then_get_returns_value() {
    let dir = tempfile::tempdir().unwrap();
    let (_, store) = file_store(dir.path());

    store.set("transcript one", &diagram()).await;
    assert_eq!(store.get("transcript one").await, Some(diagram()));
}

#[tokio::test]
async fn missing_key_is_miss() {
    let dir = tempfile::tempdir().unwrap();
    let (_, store) = file_store(dir.path());
    assert_eq!(store.get("never written").await, None);
}

#[tokio::test]
async fn record_is_named_by_key_hash() {
    let dir = tempfile::tempdir().unwrap();
    let (_, store) = file_store(dir.path());
    store.set("hello", &diagram()).await;

    let path = dir
        .path()
        .join("2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824.json");
    let raw: serde_json::Value = serde_json::from_slice(&std::fs::read(path).unwrap()).unwrap();
    assert_eq!(raw["data"]["confidence"], 0.8);
    assert!(raw["created_at"].is_string());
    assert!(raw["expires_at"].is_string());
}

#[tokio::test]
async fn set_overwrites_previous_value() {
    let dir = tempfile::tempdir().unwrap();
    let (_, store) = file_store(dir.path());

    store.set("k", &diagram()).await;
    let newer = Diagram {
        core_beliefs: vec![],
        confidence: 0.1,
    };
    store.set("k", &newer).await;
    assert_eq!(store.get("k").await, Some(newer));
    assert_eq!(store.stats().await.entries, 1);
}

#[tokio::test]
async fn expired_entry_is_miss_and_deleted() {
    let dir = tempfile::tempdir().unwrap();
    let (backend, store) = file_store(dir.path());
    write_expired(backend.as_ref(), "old", serde_json::to_value(diagram()).unwrap()).await;
    assert_eq!(store.stats().await.entries, 1);

    assert_eq!(store.get("old").await, None);
    assert_eq!(backend.read(&cache_id("old")).await.unwrap(), None);
}

#[tokio::test]
async fn short_ttl_runs_out_and_entry_is_deleted() {
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(FileBackend::new(dir.path()).unwrap());
    let store: CacheStore<Diagram> = CacheStore::new(backend.clone(), Duration::from_millis(50));

    store.set("brief", &diagram()).await;
    assert_eq!(store.get("brief").await, Some(diagram()));

    tokio::time::sleep(Duration::from_millis(120)).await;
    assert_eq!(store.get("brief").await, None);
    assert_eq!(backend.read(&cache_id("brief")).await.unwrap(), None);
}

#[tokio::test]
async fn corrupt_record_is_miss() {
    let dir = tempfile::tempdir().unwrap();
    let (_, store) = file_store(dir.path());
    std::fs::write(
        dir.path().join(format!("{}.json", cache_id("broken"))),
        b"{not json",
    )
    .unwrap();

    assert_eq!(store.get("broken").await, None);
}

#[tokio::test]
async fn schema_mismatch_is_miss() {
    let dir = tempfile::tempdir().unwrap();
    let backend: Arc<dyn CacheBackend> = Arc::new(FileBackend::new(dir.path()).unwrap());
    let strings: CacheStore<String> = CacheStore::new(backend.clone(), Duration::from_secs(60));
    let diagrams: CacheStore<Diagram> = CacheStore::new(backend, Duration::from_secs(60));

    strings.set("shared", &"plain text".to_string()).await;
    assert_eq!(diagrams.get("shared").await, None);
    assert_eq!(strings.get("shared").await.as_deref(), Some("plain text"));
}

#[tokio::test]
async fn invalidate_removes_one_entry() {
    let dir = tempfile::tempdir().unwrap();
    let (_, store) = file_store(dir.path());
    store.set("a", &diagram()).await;
    store.set("b", &diagram()).await;

    store.invalidate("a").await;
    // Invalidating twice is fine.
    store.invalidate("a").await;

    assert_eq!(store.get("a").await, None);
    assert!(store.get("b").await.is_some());
}

#[tokio::test]
async fn clear_removes_everything() {
    let dir = tempfile::tempdir().unwrap();
    let (_, store) = file_store(dir.path());
    for key in ["a", "b", "c"] {
        store.set(key, &diagram()).await;
    }
    assert_eq!(store.stats().await.entries, 3);

    store.clear().await;
    let stats = store.stats().await;
    assert_eq!(stats.backend, "file");
    assert_eq!(stats.entries, 0);
}

#[tokio::test]
async fn purge_removes_only_stale_entries() {
    let dir = tempfile::tempdir().unwrap();
    let (backend, store) = file_store(dir.path());
    store.set("fresh", &diagram()).await;
    write_expired(backend.as_ref(), "stale", serde_json::json!({})).await;
    std::fs::write(dir.path().join(format!("{}.json", cache_id("junk"))), b"junk").unwrap();

    assert_eq!(store.purge_expired().await, 2);
    assert_eq!(store.stats().await.entries, 1);
    assert!(store.get("fresh").await.is_some());
}

// ============================================================================
// Memory backend
// ============================================================================

#[tokio::test]
async fn memory_store_roundtrip_and_clear() {
    let store: CacheStore<Diagram> =
        CacheStore::new(Arc::new(MemoryBackend::default()), Duration::from_secs(60));
    store.set("k", &diagram()).await;
    assert_eq!(store.get("k").await, Some(diagram()));
    assert_eq!(store.backend_name(), "memory");

    store.clear().await;
    assert_eq!(store.get("k").await, None);
}

// ============================================================================
// Failing backend
// ============================================================================

struct BrokenBackend;

#[async_trait]
impl CacheBackend for BrokenBackend {
    fn name(&self) -> &'static str {
        "broken"
    }

    async fn read(&self, _id: &str) -> Result<Option<Vec<u8>>> {
        Err(SkjoldError::Cache("connection refused".into()))
    }

    async fn write(&self, _id: &str, _bytes: &[u8], _ttl: Duration) -> Result<()> {
        Err(SkjoldError::Cache("connection refused".into()))
    }

    async fn delete(&self, _id: &str) -> Result<()> {
        Err(SkjoldError::Cache("connection refused".into()))
    }

    async fn list_all(&self) -> Result<HashSet<String>> {
        Err(SkjoldError::Cache("connection refused".into()))
    }
}

#[tokio::test]
async fn backend_failures_never_reach_caller() {
    let store: CacheStore<Diagram> =
        CacheStore::new(Arc::new(BrokenBackend), Duration::from_secs(60));

    store.set("k", &diagram()).await;
    assert_eq!(store.get("k").await, None);
    store.invalidate("k").await;
    store.clear().await;
    assert_eq!(store.stats().await.entries, 0);
    assert_eq!(store.purge_expired().await, 0);
}
