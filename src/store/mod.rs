//! KV/Queue store abstraction (§6 "KV/Queue store contract").
//!
//! Every durable piece of state in the core — job records, queues, user indices, circuit
//! state, worker health, the DLQ, and active alerts — goes through this trait. `RedisStore` is
//! the production backend; `MemoryStore` is used by tests and by the demo binary when no
//! `SCRIBEQ_REDIS_URL` is configured.

mod memory_store;
mod redis_store;

pub use memory_store::MemoryStore;
pub use redis_store::RedisStore;

use crate::error::StoreError;
use async_trait::async_trait;
use std::time::Duration;

/// Durable strings, lists, sorted sets, and hashes, plus the one atomic primitive
/// (`compare_and_set_string`) the Job Store needs for `markStarted`.
#[async_trait]
pub trait KvStore: Send + Sync + std::fmt::Debug {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError>;
    async fn del(&self, key: &str) -> Result<(), StoreError>;
    async fn exists(&self, key: &str) -> Result<bool, StoreError>;

    /// Atomically set `key` to `new` iff its current value equals `expected` (or the key is
    /// absent and `expected` is `None`). Backed by Redis `EVAL` in production; this is the
    /// "scripted operation" option for `markStarted` described in §4.5/§6.
    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&str>,
        new: &str,
    ) -> Result<bool, StoreError>;

    async fn list_push_right(&self, key: &str, value: &str) -> Result<(), StoreError>;
    async fn list_pop_left(&self, key: &str) -> Result<Option<String>, StoreError>;
    async fn list_remove(&self, key: &str, value: &str) -> Result<(), StoreError>;
    async fn list_len(&self, key: &str) -> Result<usize, StoreError>;
    async fn list_range(&self, key: &str, offset: usize, limit: usize) -> Result<Vec<String>, StoreError>;

    async fn set_add(&self, key: &str, member: &str) -> Result<(), StoreError>;
    async fn set_remove(&self, key: &str, member: &str) -> Result<(), StoreError>;
    async fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError>;

    /// Sorted set used for delayed-retry scheduling and DLQ retention scans.
    async fn zset_add(&self, key: &str, member: &str, score: f64) -> Result<(), StoreError>;
    async fn zset_remove(&self, key: &str, member: &str) -> Result<(), StoreError>;
    /// Members with score <= `max_score`, ascending.
    async fn zset_range_by_score(&self, key: &str, max_score: f64) -> Result<Vec<String>, StoreError>;

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>, StoreError>;
    async fn hash_set(&self, key: &str, field: &str, value: &str) -> Result<(), StoreError>;
    async fn hash_get_all(&self, key: &str) -> Result<Vec<(String, String)>, StoreError>;
    async fn hash_del(&self, key: &str, field: &str) -> Result<(), StoreError>;
}

/// Serialize a value to JSON for storage, wrapping the error in [`StoreError`].
pub fn encode<T: serde::Serialize>(value: &T) -> Result<String, StoreError> {
    serde_json::to_string(value).map_err(StoreError::Serialization)
}

/// Deserialize a value previously written with [`encode`].
pub fn decode<T: serde::de::DeserializeOwned>(raw: &str) -> Result<T, StoreError> {
    serde_json::from_str(raw).map_err(StoreError::Serialization)
}
