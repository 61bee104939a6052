//! Tag-indexed cache with a build-once guard.
//!
//! Every entry is stored with a set of symbolic tags; the tag index lives
//! in the same KV store under `cache_tag:{tag}`. Invalidating a tag
//! removes every key that was written with it. Repositories declare the
//! tags for the entities they persist and invalidate them after commit.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::debug;

use crate::SharedKv;

const TAG_INDEX_PREFIX: &str = "cache_tag:";

/// Default entry lifetime where the caller does not specify one.
pub const DEFAULT_TTL: Duration = Duration::from_secs(300);

/// Tag-indexed cache facade over a [`crate::KvStore`].
#[derive(Clone)]
pub struct TaggedCache {
    store: SharedKv,
    /// Per-key build guards so an expensive producer runs at most once
    /// concurrently; other callers await it and re-read.
    building: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl TaggedCache {
    pub fn new(store: SharedKv) -> Self {
        Self {
            store,
            building: Arc::new(DashMap::new()),
        }
    }

    pub fn store(&self) -> &SharedKv {
        &self.store
    }

    pub async fn get(&self, key: &str) -> Option<String> {
        self.store.get(key).await
    }

    /// Store `value` under `key` and register it with every tag.
    pub async fn set(&self, key: &str, value: String, ttl: Duration, tags: &[String]) {
        self.store.set(key, value, ttl).await;
        for tag in tags {
            let index_key = format!("{TAG_INDEX_PREFIX}{tag}");
            // The index outlives the entry slightly so late invalidations
            // still find the key.
            self.store.sadd(&index_key, key, ttl * 2).await;
        }
    }

    pub async fn delete(&self, key: &str) {
        self.store.delete(key).await;
    }

    /// Remove every key that was stored with `tag`.
    pub async fn invalidate_tag(&self, tag: &str) {
        let index_key = format!("{TAG_INDEX_PREFIX}{tag}");
        let keys = self.store.smembers(&index_key).await;
        debug!(tag, count = keys.len(), "invalidating cache tag");
        for key in &keys {
            self.store.delete(key).await;
        }
        self.store.delete(&index_key).await;
    }

    pub async fn invalidate_tags(&self, tags: &[String]) {
        for tag in tags {
            self.invalidate_tag(tag).await;
        }
    }

    /// Read through the cache with a build-once guarantee: at most one
    /// caller runs `build` per key at a time, other concurrent callers
    /// wait for it and read the stored result.
    pub async fn get_or_build<F, Fut>(
        &self,
        key: &str,
        ttl: Duration,
        tags: &[String],
        build: F,
    ) -> Option<String>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Option<String>>,
    {
        if let Some(hit) = self.store.get(key).await {
            return Some(hit);
        }

        let guard = self
            .building
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _lock = guard.lock().await;

        // A concurrent producer may have filled the entry while we waited.
        if let Some(hit) = self.store.get(key).await {
            self.building.remove(key);
            return Some(hit);
        }

        let built = build().await;
        if let Some(value) = &built {
            self.set(key, value.clone(), ttl, tags).await;
        }
        self.building.remove(key);
        built
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::InMemoryKv;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn cache() -> TaggedCache {
        TaggedCache::new(Arc::new(InMemoryKv::new()))
    }

    #[tokio::test]
    async fn tagged_entries_disappear_with_their_tag() {
        let cache = cache();
        cache
            .set(
                "session_sid:abc",
                "{}".to_string(),
                Duration::from_secs(60),
                &["user_sessions:u1".to_string(), "session:list".to_string()],
            )
            .await;
        assert!(cache.get("session_sid:abc").await.is_some());

        cache.invalidate_tag("user_sessions:u1").await;
        assert!(cache.get("session_sid:abc").await.is_none());
    }

    #[tokio::test]
    async fn unrelated_tags_leave_entries_alone() {
        let cache = cache();
        cache
            .set("a", "1".to_string(), Duration::from_secs(60), &["t1".to_string()])
            .await;
        cache
            .set("b", "2".to_string(), Duration::from_secs(60), &["t2".to_string()])
            .await;
        cache.invalidate_tag("t1").await;
        assert!(cache.get("a").await.is_none());
        assert!(cache.get("b").await.is_some());
    }

    #[tokio::test]
    async fn get_or_build_runs_the_producer_once() {
        let cache = cache();
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_build("expensive", Duration::from_secs(60), &[], || {
                        let calls = calls.clone();
                        async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(20)).await;
                            Some("built".to_string())
                        }
                    })
                    .await
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap().as_deref(), Some("built"));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_builds_are_not_cached() {
        let cache = cache();
        let miss = cache
            .get_or_build("absent", Duration::from_secs(60), &[], || async { None })
            .await;
        assert!(miss.is_none());
        assert!(cache.get("absent").await.is_none());
    }
}
