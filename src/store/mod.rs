//! Durable queue store abstraction.
//!
//! The delivery engine only needs a handful of key-value primitives, each
//! atomic on its own. No multi-key transactions are assumed.
//!
//! - **Lists** (main, retry, dead letter): push to either end, pop from the head
//! - **Sorted set** (scheduled): add / range-by-score / remove, score = due Unix time
//! - **Hashes** (processing, workers): set / delete / get-all
//!
//! Two backends are provided:
//!
//! - [`RedisStore`]: production backend using a Redis connection manager
//! - [`MemoryStore`]: in-process backend with the same semantics, for tests
//!   and single-node runs
//!
//! A task popped by one worker instance is invisible to every other instance;
//! that single guarantee is what makes horizontal scaling safe.

mod memory;
mod redis_store;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::StoreError;

pub use self::memory::MemoryStore;
pub use self::redis_store::RedisStore;

/// Primitive operations on the durable store.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Appends a value to the tail of a list.
    async fn push_back(&self, list: &str, value: &str) -> Result<(), StoreError>;

    /// Prepends a value to the head of a list.
    async fn push_front(&self, list: &str, value: &str) -> Result<(), StoreError>;

    /// Pops the head of a list without blocking.
    async fn pop_front(&self, list: &str) -> Result<Option<String>, StoreError>;

    /// Pops the head of a list, waiting up to `timeout` for a value.
    ///
    /// Callers must not cancel this future: a value popped by the store whose
    /// response is dropped is lost.
    async fn pop_front_blocking(
        &self,
        list: &str,
        timeout: Duration,
    ) -> Result<Option<String>, StoreError>;

    /// Returns list entries between `start` and `stop` inclusive (negative = from tail).
    async fn range(&self, list: &str, start: isize, stop: isize)
        -> Result<Vec<String>, StoreError>;

    /// Removes the first occurrence of `value`. Returns the number removed.
    async fn remove(&self, list: &str, value: &str) -> Result<usize, StoreError>;

    async fn len(&self, list: &str) -> Result<usize, StoreError>;

    /// Adds a member to a sorted set with the given score.
    async fn sorted_add(&self, set: &str, member: &str, score: f64) -> Result<(), StoreError>;

    /// Returns members with score <= `max_score`, lowest score first.
    async fn sorted_range_to(&self, set: &str, max_score: f64)
        -> Result<Vec<String>, StoreError>;

    /// Removes a member. Returns `true` if this call removed it.
    async fn sorted_remove(&self, set: &str, member: &str) -> Result<bool, StoreError>;

    async fn sorted_len(&self, set: &str) -> Result<usize, StoreError>;

    async fn hash_set(&self, hash: &str, field: &str, value: &str) -> Result<(), StoreError>;

    /// Removes a field. Returns `true` if the field existed.
    async fn hash_delete(&self, hash: &str, field: &str) -> Result<bool, StoreError>;

    async fn hash_get_all(&self, hash: &str) -> Result<HashMap<String, String>, StoreError>;

    async fn hash_len(&self, hash: &str) -> Result<usize, StoreError>;

    /// Deletes whole keys. Missing keys are ignored.
    async fn delete(&self, keys: &[&str]) -> Result<(), StoreError>;

    /// Checks connectivity.
    async fn ping(&self) -> Result<(), StoreError>;
}
