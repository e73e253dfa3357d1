//! Redis-backed queue store.
//!
//! Lists map to LPUSH/RPUSH/LPOP/BLPOP, the scheduled set to a ZSET and the
//! processing and worker tables to HASHes. All commands are single-key and
//! atomic on the server.
//!
//! Blocking pops run on their own connection so that a BLPOP waiting for
//! work never stalls the commands multiplexed on the shared connection.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use super::QueueStore;
use crate::error::StoreError;

/// Redis store with automatic reconnection.
#[derive(Clone)]
pub struct RedisStore {
    /// Connection for regular commands.
    redis: ConnectionManager,
    /// Connection reserved for blocking pops.
    blocking: ConnectionManager,
}

impl RedisStore {
    /// Connects to Redis.
    ///
    /// # Arguments
    ///
    /// * `redis_url` - Redis connection URL (e.g., "redis://localhost:6379")
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Connection` if the connection fails.
    pub async fn connect(redis_url: &str) -> Result<Self, StoreError> {
        let client =
            redis::Client::open(redis_url).map_err(|e| StoreError::Connection(e.to_string()))?;

        let redis = ConnectionManager::new(client.clone())
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        let blocking = ConnectionManager::new(client)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        Ok(Self { redis, blocking })
    }

    /// Creates a store from existing connection managers.
    pub fn from_connections(redis: ConnectionManager, blocking: ConnectionManager) -> Self {
        Self { redis, blocking }
    }
}

#[async_trait]
impl QueueStore for RedisStore {
    async fn push_back(&self, list: &str, value: &str) -> Result<(), StoreError> {
        let mut conn = self.redis.clone();
        conn.rpush::<_, _, ()>(list, value).await?;
        Ok(())
    }

    async fn push_front(&self, list: &str, value: &str) -> Result<(), StoreError> {
        let mut conn = self.redis.clone();
        conn.lpush::<_, _, ()>(list, value).await?;
        Ok(())
    }

    async fn pop_front(&self, list: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.redis.clone();
        let value: Option<String> = conn.lpop(list, None).await?;
        Ok(value)
    }

    async fn pop_front_blocking(
        &self,
        list: &str,
        timeout: Duration,
    ) -> Result<Option<String>, StoreError> {
        let mut conn = self.blocking.clone();
        // BLPOP accepts fractional seconds; zero would block forever.
        let timeout_secs = timeout.as_secs_f64().max(0.01);

        let result: Option<(String, String)> = redis::cmd("BLPOP")
            .arg(list)
            .arg(timeout_secs)
            .query_async(&mut conn)
            .await?;

        Ok(result.map(|(_, value)| value))
    }

    async fn range(
        &self,
        list: &str,
        start: isize,
        stop: isize,
    ) -> Result<Vec<String>, StoreError> {
        let mut conn = self.redis.clone();
        let values: Vec<String> = conn.lrange(list, start, stop).await?;
        Ok(values)
    }

    async fn remove(&self, list: &str, value: &str) -> Result<usize, StoreError> {
        let mut conn = self.redis.clone();
        let removed: usize = conn.lrem(list, 1, value).await?;
        Ok(removed)
    }

    async fn len(&self, list: &str) -> Result<usize, StoreError> {
        let mut conn = self.redis.clone();
        let len: usize = conn.llen(list).await?;
        Ok(len)
    }

    async fn sorted_add(&self, set: &str, member: &str, score: f64) -> Result<(), StoreError> {
        let mut conn = self.redis.clone();
        conn.zadd::<_, _, _, ()>(set, member, score).await?;
        Ok(())
    }

    async fn sorted_range_to(
        &self,
        set: &str,
        max_score: f64,
    ) -> Result<Vec<String>, StoreError> {
        let mut conn = self.redis.clone();
        let members: Vec<String> = conn.zrangebyscore(set, "-inf", max_score).await?;
        Ok(members)
    }

    async fn sorted_remove(&self, set: &str, member: &str) -> Result<bool, StoreError> {
        let mut conn = self.redis.clone();
        let removed: usize = conn.zrem(set, member).await?;
        Ok(removed > 0)
    }

    async fn sorted_len(&self, set: &str) -> Result<usize, StoreError> {
        let mut conn = self.redis.clone();
        let len: usize = conn.zcard(set).await?;
        Ok(len)
    }

    async fn hash_set(&self, hash: &str, field: &str, value: &str) -> Result<(), StoreError> {
        let mut conn = self.redis.clone();
        conn.hset::<_, _, _, ()>(hash, field, value).await?;
        Ok(())
    }

    async fn hash_delete(&self, hash: &str, field: &str) -> Result<bool, StoreError> {
        let mut conn = self.redis.clone();
        let removed: usize = conn.hdel(hash, field).await?;
        Ok(removed > 0)
    }

    async fn hash_get_all(&self, hash: &str) -> Result<HashMap<String, String>, StoreError> {
        let mut conn = self.redis.clone();
        let entries: HashMap<String, String> = conn.hgetall(hash).await?;
        Ok(entries)
    }

    async fn hash_len(&self, hash: &str) -> Result<usize, StoreError> {
        let mut conn = self.redis.clone();
        let len: usize = conn.hlen(hash).await?;
        Ok(len)
    }

    async fn delete(&self, keys: &[&str]) -> Result<(), StoreError> {
        if keys.is_empty() {
            return Ok(());
        }

        let mut conn = self.redis.clone();
        let mut pipe = redis::pipe();
        for key in keys {
            pipe.del(*key).ignore();
        }
        pipe.query_async::<_, ()>(&mut conn).await?;

        Ok(())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.redis.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}
