//! TTL + LRU schema cache (C4) with fetch coalescing and stale-on-error.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use lru::LruCache;
use serde::{Deserialize, Serialize};

use crate::error::CacheError;
use crate::model::{now_secs, ToolSchema};
use crate::observability::{Observer, ObserverEvent};

#[derive(Debug, Clone, Copy)]
pub struct SchemaCacheConfig {
    pub capacity: usize,
    pub ttl_secs: u64,
}

impl Default for SchemaCacheConfig {
    fn default() -> Self {
        Self {
            capacity: 1000,
            ttl_secs: 24 * 60 * 60,
        }
    }
}

#[derive(Serialize, Deserialize, Default)]
struct PersistedCache {
    entries: Vec<ToolSchema>,
}

pub struct SchemaCache {
    config: SchemaCacheConfig,
    store: Mutex<LruCache<String, ToolSchema>>,
    fetch_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    persist_path: Option<PathBuf>,
    observer: Arc<dyn Observer>,
}

impl SchemaCache {
    pub fn new(config: SchemaCacheConfig, persist_path: Option<PathBuf>, observer: Arc<dyn Observer>) -> Self {
        let capacity = NonZeroUsize::new(config.capacity.max(1)).unwrap();
        let mut store = LruCache::new(capacity);

        if let Some(path) = &persist_path {
            if let Ok(bytes) = std::fs::read(path) {
                if let Ok(persisted) = serde_json::from_slice::<PersistedCache>(&bytes) {
                    for entry in persisted.entries {
                        store.put(entry.name.clone(), entry);
                    }
                } else {
                    tracing::warn!(path = %path.display(), "schema cache file corrupt, starting empty");
                }
            }
        }

        Self {
            config,
            store: Mutex::new(store),
            fetch_locks: Mutex::new(HashMap::new()),
            persist_path,
            observer,
        }
    }

    /// Returns the cached schema iff it has not expired.
    /// The default TTL new entries should be stamped with, per configuration.
    pub fn default_ttl_secs(&self) -> u64 {
        self.config.ttl_secs
    }

    pub fn get(&self, name: &str) -> Option<ToolSchema> {
        let mut store = self.store.lock().unwrap_or_else(|e| e.into_inner());
        let now = now_secs();
        match store.get(name) {
            Some(schema) if !schema.is_expired(now) => Some(schema.clone()),
            _ => None,
        }
    }

    fn get_stale(&self, name: &str) -> Option<ToolSchema> {
        let mut store = self.store.lock().unwrap_or_else(|e| e.into_inner());
        store.get(name).cloned()
    }

    fn insert(&self, schema: ToolSchema) {
        let mut store = self.store.lock().unwrap_or_else(|e| e.into_inner());
        store.put(schema.name.clone(), schema);
    }

    /// Bulk-populate from a fresh backend listing (C5's `listAllToolSchemas`
    /// bypasses per-tool coalescing since it fetches every tool in one
    /// round-trip; this just warms the cache for subsequent single-tool
    /// lookups).
    pub fn put(&self, schema: ToolSchema) {
        self.insert(schema);
    }

    pub fn invalidate(&self, name: &str) {
        let mut store = self.store.lock().unwrap_or_else(|e| e.into_inner());
        store.pop(name);
    }

    pub fn clear(&self) {
        let mut store = self.store.lock().unwrap_or_else(|e| e.into_inner());
        store.clear();
    }

    fn per_key_lock(&self, name: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.fetch_locks.lock().unwrap_or_else(|e| e.into_inner());
        locks
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Fetch-or-serve a schema, coalescing concurrent misses for the same
    /// key behind a per-key async lock: at most one `fetcher` call is ever
    /// in flight per key at a given instant, and joiners re-check the cache
    /// (now populated by the winner) rather than issuing a duplicate fetch.
    ///
    /// On fetcher failure, a stale (TTL-expired) entry is served if one
    /// exists; only a cold miss with a failing fetcher propagates the error.
    pub async fn get_or_fetch<F, Fut>(&self, name: &str, fetcher: F) -> Result<ToolSchema, CacheError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<ToolSchema, CacheError>>,
    {
        if let Some(schema) = self.get(name) {
            self.observer.record_event(&ObserverEvent::CacheHit { tool: name.into() });
            return Ok(schema);
        }

        let key_lock = self.per_key_lock(name);
        let _guard = key_lock.lock().await;

        if let Some(schema) = self.get(name) {
            self.observer.record_event(&ObserverEvent::CacheHit { tool: name.into() });
            return Ok(schema);
        }

        self.observer.record_event(&ObserverEvent::CacheMiss { tool: name.into() });
        match fetcher().await {
            Ok(schema) => {
                self.insert(schema.clone());
                self.persist_best_effort();
                Ok(schema)
            }
            Err(err) => {
                if let Some(stale) = self.get_stale(name) {
                    tracing::warn!(tool = name, error = %err, "schema fetch failed, serving stale entry");
                    Ok(stale)
                } else {
                    Err(err)
                }
            }
        }
    }

    fn persist_best_effort(&self) {
        let Some(path) = self.persist_path.clone() else {
            return;
        };
        let entries: Vec<ToolSchema> = {
            let store = self.store.lock().unwrap_or_else(|e| e.into_inner());
            store.iter().map(|(_, v)| v.clone()).collect()
        };
        tokio::spawn(async move {
            if let Err(e) = write_atomic(&path, &PersistedCache { entries }) {
                tracing::warn!(path = %path.display(), error = %e, "failed to persist schema cache");
            }
        });
    }
}

fn write_atomic(path: &PathBuf, cache: &PersistedCache) -> Result<(), CacheError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let bytes = serde_json::to_vec(cache)?;
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observability::NoopObserver;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn cache(ttl_secs: u64) -> SchemaCache {
        SchemaCache::new(
            SchemaCacheConfig {
                capacity: 10,
                ttl_secs,
            },
            None,
            Arc::new(NoopObserver),
        )
    }

    fn schema(name: &str, fetched_at: u64, ttl: u64) -> ToolSchema {
        ToolSchema {
            name: name.into(),
            description: None,
            input_schema: serde_json::json!({"type": "object"}),
            output_schema: None,
            fetched_at,
            ttl_secs: ttl,
        }
    }

    #[tokio::test]
    async fn get_or_fetch_populates_on_miss() {
        let c = cache(60);
        let s = c
            .get_or_fetch("t1", || async { Ok(schema("t1", now_secs(), 60)) })
            .await
            .unwrap();
        assert_eq!(s.name, "t1");
        assert!(c.get("t1").is_some());
    }

    #[tokio::test]
    async fn hit_returns_without_calling_fetcher() {
        let c = cache(60);
        let _ = c
            .get_or_fetch("t1", || async { Ok(schema("t1", now_secs(), 60)) })
            .await
            .unwrap();

        let calls = AtomicU32::new(0);
        let _ = c
            .get_or_fetch("t1", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(schema("t1", now_secs(), 60))
            })
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn concurrent_misses_coalesce_to_one_fetch() {
        let c = Arc::new(cache(60));
        let calls = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..10 {
            let c2 = c.clone();
            let calls2 = calls.clone();
            handles.push(tokio::spawn(async move {
                c2.get_or_fetch("t1", || async move {
                    calls2.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                    Ok(schema("t1", now_secs(), 60))
                })
                .await
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1, "fetcher must coalesce");
    }

    #[tokio::test]
    async fn stale_on_error_serves_expired_entry() {
        let c = cache(1);
        let _ = c
            .get_or_fetch("t1", || async { Ok(schema("t1", 0, 1)) })
            .await
            .unwrap();

        // Force expiry regardless of wall-clock timing in the test.
        c.insert(schema("t1", 0, 1));

        let result = c
            .get_or_fetch("t1", || async {
                Err(CacheError::FetchFailed {
                    name: "t1".into(),
                    source: "boom".into(),
                })
            })
            .await;
        assert!(result.is_ok(), "stale entry should be served on fetch failure");
    }

    #[tokio::test]
    async fn cold_miss_with_failing_fetcher_propagates_error() {
        let c = cache(60);
        let result = c
            .get_or_fetch("t1", || async {
                Err(CacheError::FetchFailed {
                    name: "t1".into(),
                    source: "boom".into(),
                })
            })
            .await;
        assert!(result.is_err());
    }

    #[test]
    fn invalidate_removes_entry() {
        let c = cache(60);
        c.insert(schema("t1", now_secs(), 60));
        assert!(c.get("t1").is_some());
        c.invalidate("t1");
        assert!(c.get("t1").is_none());
    }

    #[test]
    fn expired_entries_not_returned_by_get() {
        let c = cache(60);
        c.insert(schema("t1", 0, 1));
        assert!(c.get("t1").is_none());
        assert!(c.get_stale("t1").is_some());
    }

    #[test]
    fn atomic_write_then_reload_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("schema_cache.json");
        let c1 = SchemaCache::new(
            SchemaCacheConfig {
                capacity: 10,
                ttl_secs: 60,
            },
            Some(path.clone()),
            Arc::new(NoopObserver),
        );
        c1.insert(schema("t1", now_secs(), 60));
        write_atomic(
            &path,
            &PersistedCache {
                entries: vec![schema("t1", now_secs(), 60)],
            },
        )
        .unwrap();

        let c2 = SchemaCache::new(
            SchemaCacheConfig {
                capacity: 10,
                ttl_secs: 60,
            },
            Some(path),
            Arc::new(NoopObserver),
        );
        assert!(c2.get("t1").is_some());
    }
}
