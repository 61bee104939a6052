//! Redis-backed `KvStore` over a managed connection.

use std::time::Duration;

use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::warn;

use crate::{BoxFuture, KvOp, KvStore};

/// Distributed backend. All failures are logged and degrade to cache
/// misses; the store is never the system of record.
#[derive(Clone)]
pub struct RedisKv {
    manager: ConnectionManager,
}

impl RedisKv {
    pub async fn connect(url: &str) -> Result<Self, redis::RedisError> {
        let client = redis::Client::open(url)?;
        let manager = ConnectionManager::new(client).await?;
        Ok(Self { manager })
    }

    pub fn from_manager(manager: ConnectionManager) -> Self {
        Self { manager }
    }

    fn ttl_secs(ttl: Duration) -> u64 {
        ttl.as_secs().max(1)
    }
}

impl KvStore for RedisKv {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Option<String>> {
        Box::pin(async move {
            let mut con = self.manager.clone();
            match con.get::<_, Option<String>>(key).await {
                Ok(value) => value,
                Err(e) => {
                    warn!(key, error = %e, "redis get failed");
                    None
                }
            }
        })
    }

    fn set<'a>(&'a self, key: &'a str, value: String, ttl: Duration) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let mut con = self.manager.clone();
            if let Err(e) = con.set_ex::<_, _, ()>(key, value, Self::ttl_secs(ttl)).await {
                warn!(key, error = %e, "redis set failed");
            }
        })
    }

    fn delete<'a>(&'a self, key: &'a str) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let mut con = self.manager.clone();
            if let Err(e) = con.del::<_, ()>(key).await {
                warn!(key, error = %e, "redis del failed");
            }
        })
    }

    fn delete_prefix<'a>(&'a self, prefix: &'a str) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let keys = self.scan_prefix(prefix).await;
            if keys.is_empty() {
                return;
            }
            let mut con = self.manager.clone();
            if let Err(e) = con.del::<_, ()>(keys).await {
                warn!(prefix, error = %e, "redis prefix delete failed");
            }
        })
    }

    fn scan_prefix<'a>(&'a self, prefix: &'a str) -> BoxFuture<'a, Vec<String>> {
        Box::pin(async move {
            let mut con = self.manager.clone();
            let pattern = format!("{prefix}*");
            let mut keys = Vec::new();
            match con.scan_match::<_, String>(&pattern).await {
                Ok(mut iter) => {
                    while let Some(key) = iter.next_item().await {
                        keys.push(key);
                    }
                }
                Err(e) => warn!(prefix, error = %e, "redis scan failed"),
            }
            keys.sort();
            keys
        })
    }

    fn sadd<'a>(&'a self, key: &'a str, member: &'a str, ttl: Duration) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let mut con = self.manager.clone();
            let result: Result<(), redis::RedisError> = redis::pipe()
                .sadd(key, member)
                .ignore()
                .expire(key, Self::ttl_secs(ttl) as i64)
                .ignore()
                .query_async(&mut con)
                .await;
            if let Err(e) = result {
                warn!(key, error = %e, "redis sadd failed");
            }
        })
    }

    fn srem<'a>(&'a self, key: &'a str, member: &'a str) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let mut con = self.manager.clone();
            if let Err(e) = con.srem::<_, _, ()>(key, member).await {
                warn!(key, error = %e, "redis srem failed");
            }
        })
    }

    fn smembers<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Vec<String>> {
        Box::pin(async move {
            let mut con = self.manager.clone();
            match con.smembers::<_, Vec<String>>(key).await {
                Ok(mut members) => {
                    members.sort();
                    members
                }
                Err(e) => {
                    warn!(key, error = %e, "redis smembers failed");
                    Vec::new()
                }
            }
        })
    }

    fn run_batch(&self, ops: Vec<KvOp>) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let mut pipe = redis::pipe();
            pipe.atomic();
            for op in &ops {
                match op {
                    KvOp::SetEx { key, value, ttl } => {
                        pipe.set_ex(key, value, Self::ttl_secs(*ttl)).ignore();
                    }
                    KvOp::SAdd { key, member, ttl } => {
                        pipe.sadd(key, member).ignore();
                        pipe.expire(key, Self::ttl_secs(*ttl) as i64).ignore();
                    }
                    KvOp::SRem { key, member } => {
                        pipe.srem(key, member).ignore();
                    }
                    KvOp::Del { key } => {
                        pipe.del(key).ignore();
                    }
                }
            }
            let mut con = self.manager.clone();
            if let Err(e) = pipe.query_async::<()>(&mut con).await {
                warn!(ops = ops.len(), error = %e, "redis batch failed");
            }
        })
    }
}
