//! In-memory `KvStore` backed by `DashMap`, with lazy TTL eviction.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::{BoxFuture, KvOp, KvStore};

/// Default backend for tests and single-node deployments.
///
/// Entries store their deadline and are evicted on access, the same lazy
/// strategy the TTL cache uses elsewhere in the stack.
#[derive(Default)]
pub struct InMemoryKv {
    values: DashMap<String, (String, Instant)>,
    sets: DashMap<String, (HashSet<String>, Instant)>,
}

impl InMemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    fn live_value(&self, key: &str) -> Option<String> {
        if let Some(entry) = self.values.get(key) {
            let (value, deadline) = entry.value();
            if Instant::now() < *deadline {
                return Some(value.clone());
            }
            drop(entry);
            self.values.remove(key);
        }
        None
    }

    fn live_set(&self, key: &str) -> Option<HashSet<String>> {
        if let Some(entry) = self.sets.get(key) {
            let (members, deadline) = entry.value();
            if Instant::now() < *deadline {
                return Some(members.clone());
            }
            drop(entry);
            self.sets.remove(key);
        }
        None
    }

    fn apply(&self, op: KvOp) {
        match op {
            KvOp::SetEx { key, value, ttl } => {
                self.values.insert(key, (value, Instant::now() + ttl));
            }
            KvOp::SAdd { key, member, ttl } => {
                let deadline = Instant::now() + ttl;
                let mut entry = self
                    .sets
                    .entry(key)
                    .or_insert_with(|| (HashSet::new(), deadline));
                entry.value_mut().0.insert(member);
                entry.value_mut().1 = deadline;
            }
            KvOp::SRem { key, member } => {
                if let Some(mut entry) = self.sets.get_mut(&key) {
                    entry.value_mut().0.remove(&member);
                }
            }
            KvOp::Del { key } => {
                self.values.remove(&key);
                self.sets.remove(&key);
            }
        }
    }
}

impl KvStore for InMemoryKv {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Option<String>> {
        Box::pin(async move { self.live_value(key) })
    }

    fn set<'a>(&'a self, key: &'a str, value: String, ttl: Duration) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            self.values.insert(key.to_string(), (value, Instant::now() + ttl));
        })
    }

    fn delete<'a>(&'a self, key: &'a str) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            self.values.remove(key);
            self.sets.remove(key);
        })
    }

    fn delete_prefix<'a>(&'a self, prefix: &'a str) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            self.values.retain(|k, _| !k.starts_with(prefix));
            self.sets.retain(|k, _| !k.starts_with(prefix));
        })
    }

    fn scan_prefix<'a>(&'a self, prefix: &'a str) -> BoxFuture<'a, Vec<String>> {
        Box::pin(async move {
            let now = Instant::now();
            let mut keys: Vec<String> = self
                .values
                .iter()
                .filter(|e| e.key().starts_with(prefix) && now < e.value().1)
                .map(|e| e.key().clone())
                .collect();
            keys.extend(
                self.sets
                    .iter()
                    .filter(|e| e.key().starts_with(prefix) && now < e.value().1)
                    .map(|e| e.key().clone()),
            );
            keys.sort();
            keys
        })
    }

    fn sadd<'a>(&'a self, key: &'a str, member: &'a str, ttl: Duration) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            self.apply(KvOp::SAdd {
                key: key.to_string(),
                member: member.to_string(),
                ttl,
            });
        })
    }

    fn srem<'a>(&'a self, key: &'a str, member: &'a str) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            self.apply(KvOp::SRem {
                key: key.to_string(),
                member: member.to_string(),
            });
        })
    }

    fn smembers<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Vec<String>> {
        Box::pin(async move {
            let mut members: Vec<String> = self
                .live_set(key)
                .map(|s| s.into_iter().collect())
                .unwrap_or_default();
            members.sort();
            members
        })
    }

    fn run_batch(&self, ops: Vec<KvOp>) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            for op in ops {
                self.apply(op);
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_then_get_round_trips() {
        let kv = InMemoryKv::new();
        kv.set("task:w1", "{}".to_string(), Duration::from_secs(60)).await;
        assert_eq!(kv.get("task:w1").await.as_deref(), Some("{}"));
    }

    #[tokio::test]
    async fn expired_entries_are_gone() {
        let kv = InMemoryKv::new();
        kv.set("k", "v".to_string(), Duration::from_millis(10)).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(kv.get("k").await, None);
    }

    #[tokio::test]
    async fn sets_accumulate_and_remove_members() {
        let kv = InMemoryKv::new();
        kv.sadd("task_idx:all", "w1", Duration::from_secs(60)).await;
        kv.sadd("task_idx:all", "w2", Duration::from_secs(60)).await;
        assert_eq!(kv.smembers("task_idx:all").await, vec!["w1", "w2"]);
        kv.srem("task_idx:all", "w1").await;
        assert_eq!(kv.smembers("task_idx:all").await, vec!["w2"]);
    }

    #[tokio::test]
    async fn delete_prefix_clears_namespace() {
        let kv = InMemoryKv::new();
        kv.set("ws:typing:c:u1", "1".to_string(), Duration::from_secs(60)).await;
        kv.set("ws:typing:c:u2", "1".to_string(), Duration::from_secs(60)).await;
        kv.set("other", "1".to_string(), Duration::from_secs(60)).await;
        kv.delete_prefix("ws:typing:").await;
        assert!(kv.get("ws:typing:c:u1").await.is_none());
        assert!(kv.get("other").await.is_some());
    }

    #[tokio::test]
    async fn scan_prefix_lists_live_keys() {
        let kv = InMemoryKv::new();
        kv.set("ws:typing:ch:u1", "1".to_string(), Duration::from_secs(60)).await;
        kv.set("ws:typing:ch:u2", "1".to_string(), Duration::from_secs(60)).await;
        let keys = kv.scan_prefix("ws:typing:ch:").await;
        assert_eq!(keys, vec!["ws:typing:ch:u1", "ws:typing:ch:u2"]);
    }

    #[tokio::test]
    async fn batch_applies_all_operations() {
        let kv = InMemoryKv::new();
        kv.run_batch(vec![
            KvOp::SetEx {
                key: "task:w1".into(),
                value: "{}".into(),
                ttl: Duration::from_secs(60),
            },
            KvOp::SAdd {
                key: "task_idx:all".into(),
                member: "w1".into(),
                ttl: Duration::from_secs(60),
            },
        ])
        .await;
        assert!(kv.get("task:w1").await.is_some());
        assert_eq!(kv.smembers("task_idx:all").await, vec!["w1"]);
    }
}
