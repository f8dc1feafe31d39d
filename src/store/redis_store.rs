//! Redis-backed `KvStore`, the production implementation of the store contract.

use super::KvStore;
use crate::error::StoreError;
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::time::Duration;
use tracing::warn;

/// Atomically sets `key` to `new` iff its current value equals `expected`, or the key is
/// absent and `expected` is empty. Mirrors `KvStore::compare_and_set`'s `Option<&str>`
/// contract: the sentinel empty string stands in for "absent" since `redis::Script` args
/// are plain byte strings.
const COMPARE_AND_SET_SCRIPT: &str = r#"
local current = redis.call('GET', KEYS[1])
if current == false then current = '' end
if current == ARGV[1] then
    redis.call('SET', KEYS[1], ARGV[2])
    return 1
else
    return 0
end
"#;

/// Connects to Redis via `ConnectionManager`, which reconnects transparently on transient
/// network failures instead of requiring callers to retry at the connection level.
#[derive(Debug, Clone)]
pub struct RedisStore {
    manager: ConnectionManager,
}

impl RedisStore {
    /// Open a connection to `redis_url` and wrap it in a `ConnectionManager`.
    pub async fn connect(redis_url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        let manager = client
            .get_connection_manager()
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        Ok(Self { manager })
    }

    fn conn(&self) -> ConnectionManager {
        self.manager.clone()
    }
}

#[async_trait]
impl KvStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.conn()
            .get(key)
            .await
            .map_err(|e| StoreError::Command(e.to_string()))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        let mut conn = self.conn();
        match ttl {
            Some(ttl) => conn
                .set_ex(key, value, ttl.as_secs().max(1))
                .await
                .map_err(|e| StoreError::Command(e.to_string())),
            None => conn
                .set(key, value)
                .await
                .map_err(|e| StoreError::Command(e.to_string())),
        }
    }

    async fn del(&self, key: &str) -> Result<(), StoreError> {
        self.conn()
            .del(key)
            .await
            .map_err(|e| StoreError::Command(e.to_string()))
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        self.conn()
            .exists(key)
            .await
            .map_err(|e| StoreError::Command(e.to_string()))
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&str>,
        new: &str,
    ) -> Result<bool, StoreError> {
        let expected = expected.unwrap_or("");
        let mut conn = self.conn();
        let result: i32 = redis::Script::new(COMPARE_AND_SET_SCRIPT)
            .key(key)
            .arg(expected)
            .arg(new)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| StoreError::Command(e.to_string()))?;
        Ok(result == 1)
    }

    async fn list_push_right(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.conn()
            .rpush(key, value)
            .await
            .map_err(|e| StoreError::Command(e.to_string()))
    }

    async fn list_pop_left(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.conn()
            .lpop(key, None)
            .await
            .map_err(|e| StoreError::Command(e.to_string()))
    }

    async fn list_remove(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let _: i32 = self
            .conn()
            .lrem(key, 0, value)
            .await
            .map_err(|e| StoreError::Command(e.to_string()))?;
        Ok(())
    }

    async fn list_len(&self, key: &str) -> Result<usize, StoreError> {
        self.conn()
            .llen(key)
            .await
            .map_err(|e| StoreError::Command(e.to_string()))
    }

    async fn list_range(&self, key: &str, offset: usize, limit: usize) -> Result<Vec<String>, StoreError> {
        let stop = offset as isize + limit as isize - 1;
        self.conn()
            .lrange(key, offset as isize, stop)
            .await
            .map_err(|e| StoreError::Command(e.to_string()))
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<(), StoreError> {
        let _: i32 = self
            .conn()
            .sadd(key, member)
            .await
            .map_err(|e| StoreError::Command(e.to_string()))?;
        Ok(())
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<(), StoreError> {
        let _: i32 = self
            .conn()
            .srem(key, member)
            .await
            .map_err(|e| StoreError::Command(e.to_string()))?;
        Ok(())
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError> {
        self.conn()
            .smembers(key)
            .await
            .map_err(|e| StoreError::Command(e.to_string()))
    }

    async fn zset_add(&self, key: &str, member: &str, score: f64) -> Result<(), StoreError> {
        let _: i32 = self
            .conn()
            .zadd(key, member, score)
            .await
            .map_err(|e| StoreError::Command(e.to_string()))?;
        Ok(())
    }

    async fn zset_remove(&self, key: &str, member: &str) -> Result<(), StoreError> {
        let _: i32 = self
            .conn()
            .zrem(key, member)
            .await
            .map_err(|e| StoreError::Command(e.to_string()))?;
        Ok(())
    }

    async fn zset_range_by_score(&self, key: &str, max_score: f64) -> Result<Vec<String>, StoreError> {
        self.conn()
            .zrangebyscore(key, "-inf", max_score)
            .await
            .map_err(|e| StoreError::Command(e.to_string()))
    }

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>, StoreError> {
        self.conn()
            .hget(key, field)
            .await
            .map_err(|e| StoreError::Command(e.to_string()))
    }

    async fn hash_set(&self, key: &str, field: &str, value: &str) -> Result<(), StoreError> {
        self.conn()
            .hset(key, field, value)
            .await
            .map_err(|e| StoreError::Command(e.to_string()))
    }

    async fn hash_get_all(&self, key: &str) -> Result<Vec<(String, String)>, StoreError> {
        self.conn()
            .hgetall(key)
            .await
            .map_err(|e| StoreError::Command(e.to_string()))
    }

    async fn hash_del(&self, key: &str, field: &str) -> Result<(), StoreError> {
        let _: i32 = self
            .conn()
            .hdel(key, field)
            .await
            .map_err(|e| StoreError::Command(e.to_string()))?;
        Ok(())
    }
}

/// Logs a connection failure once rather than letting `ConnectionManager`'s silent retries
/// mask a persistently unreachable Redis instance.
pub fn log_connect_failure(redis_url: &str, err: &StoreError) {
    warn!(redis_url, error = %err, "failed to establish redis connection");
}
