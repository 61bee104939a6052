//! Key/value store abstraction and the tag-indexed cache built on it.
//!
//! [`KvStore`] is the pluggable backend trait: the in-memory
//! [`InMemoryKv`] is the default and test backend, [`RedisKv`] is the
//! distributed one. Namespaced keys (`perm:*`, `session:*`, `task:*`,
//! `task_idx:*`, `ws:typing:*`) all live behind this trait.
//!
//! Backend failures degrade instead of propagating: a read miss is a
//! cache miss, a write failure is logged. Callers treat the store as an
//! accelerator, never as the system of record.

mod memory;
mod redis_store;
mod tagged;

pub use memory::InMemoryKv;
pub use redis_store::RedisKv;
pub use tagged::TaggedCache;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// One mutation in a batched write. Batches are applied as a single
/// pipeline on Redis; the in-memory backend applies them in order.
#[derive(Debug, Clone)]
pub enum KvOp {
    SetEx { key: String, value: String, ttl: Duration },
    SAdd { key: String, member: String, ttl: Duration },
    SRem { key: String, member: String },
    Del { key: String },
}

/// Pluggable key/value backend.
pub trait KvStore: Send + Sync + 'static {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Option<String>>;
    fn set<'a>(&'a self, key: &'a str, value: String, ttl: Duration) -> BoxFuture<'a, ()>;
    fn delete<'a>(&'a self, key: &'a str) -> BoxFuture<'a, ()>;
    /// Remove every key starting with `prefix`.
    fn delete_prefix<'a>(&'a self, prefix: &'a str) -> BoxFuture<'a, ()>;
    /// Keys currently present under `prefix`.
    fn scan_prefix<'a>(&'a self, prefix: &'a str) -> BoxFuture<'a, Vec<String>>;
    fn sadd<'a>(&'a self, key: &'a str, member: &'a str, ttl: Duration) -> BoxFuture<'a, ()>;
    fn srem<'a>(&'a self, key: &'a str, member: &'a str) -> BoxFuture<'a, ()>;
    fn smembers<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Vec<String>>;
    /// Apply a batch of operations in one round trip.
    fn run_batch(&self, ops: Vec<KvOp>) -> BoxFuture<'_, ()>;
}

/// Shared handle used throughout the workspace.
pub type SharedKv = Arc<dyn KvStore>;
