//! In-process queue store.
//!
//! Mirrors the Redis semantics closely enough for the full pipeline to run
//! without a server: FIFO lists, a score-ordered set with insertion order as
//! the tie-breaker, plain hashes, and blocking pops woken by pushes.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::QueueStore;
use crate::error::StoreError;

#[derive(Default)]
struct State {
    lists: HashMap<String, VecDeque<String>>,
    sorted: HashMap<String, Vec<(f64, String)>>,
    hashes: HashMap<String, HashMap<String, String>>,
}

/// Store kept entirely in memory. Cheap to create, one per test.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
    pushed: Notify,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn try_pop(&self, list: &str) -> Option<String> {
        self.state().lists.get_mut(list).and_then(VecDeque::pop_front)
    }
}

/// Resolves Redis-style inclusive, possibly negative, bounds against `len`.
fn resolve_range(len: usize, start: isize, stop: isize) -> Option<(usize, usize)> {
    let len = len as isize;
    let start = if start < 0 { (len + start).max(0) } else { start };
    let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
    if len == 0 || start > stop || start >= len {
        return None;
    }
    Some((start as usize, stop as usize))
}

#[async_trait]
impl QueueStore for MemoryStore {
    async fn push_back(&self, list: &str, value: &str) -> Result<(), StoreError> {
        self.state()
            .lists
            .entry(list.to_string())
            .or_default()
            .push_back(value.to_string());
        self.pushed.notify_waiters();
        Ok(())
    }

    async fn push_front(&self, list: &str, value: &str) -> Result<(), StoreError> {
        self.state()
            .lists
            .entry(list.to_string())
            .or_default()
            .push_front(value.to_string());
        self.pushed.notify_waiters();
        Ok(())
    }

    async fn pop_front(&self, list: &str) -> Result<Option<String>, StoreError> {
        Ok(self.try_pop(list))
    }

    async fn pop_front_blocking(
        &self,
        list: &str,
        timeout: Duration,
    ) -> Result<Option<String>, StoreError> {
        let deadline = Instant::now() + timeout;

        loop {
            // Register interest before checking so a concurrent push is not missed.
            let notified = self.pushed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(value) = self.try_pop(list) {
                return Ok(Some(value));
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn range(
        &self,
        list: &str,
        start: isize,
        stop: isize,
    ) -> Result<Vec<String>, StoreError> {
        let state = self.state();
        let Some(values) = state.lists.get(list) else {
            return Ok(Vec::new());
        };

        Ok(match resolve_range(values.len(), start, stop) {
            Some((from, to)) => values.range(from..=to).cloned().collect(),
            None => Vec::new(),
        })
    }

    async fn remove(&self, list: &str, value: &str) -> Result<usize, StoreError> {
        let mut state = self.state();
        let Some(values) = state.lists.get_mut(list) else {
            return Ok(0);
        };

        match values.iter().position(|v| v == value) {
            Some(index) => {
                values.remove(index);
                Ok(1)
            }
            None => Ok(0),
        }
    }

    async fn len(&self, list: &str) -> Result<usize, StoreError> {
        Ok(self.state().lists.get(list).map_or(0, VecDeque::len))
    }

    async fn sorted_add(&self, set: &str, member: &str, score: f64) -> Result<(), StoreError> {
        let mut state = self.state();
        let entries = state.sorted.entry(set.to_string()).or_default();
        entries.retain(|(_, m)| m != member);
        // Stable position after every entry with an equal or lower score.
        let index = entries.partition_point(|(s, _)| *s <= score);
        entries.insert(index, (score, member.to_string()));
        Ok(())
    }

    async fn sorted_range_to(
        &self,
        set: &str,
        max_score: f64,
    ) -> Result<Vec<String>, StoreError> {
        Ok(self
            .state()
            .sorted
            .get(set)
            .map(|entries| {
                entries
                    .iter()
                    .take_while(|(score, _)| *score <= max_score)
                    .map(|(_, member)| member.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn sorted_remove(&self, set: &str, member: &str) -> Result<bool, StoreError> {
        let mut state = self.state();
        let Some(entries) = state.sorted.get_mut(set) else {
            return Ok(false);
        };
        let before = entries.len();
        entries.retain(|(_, m)| m != member);
        Ok(entries.len() < before)
    }

    async fn sorted_len(&self, set: &str) -> Result<usize, StoreError> {
        Ok(self.state().sorted.get(set).map_or(0, Vec::len))
    }

    async fn hash_set(&self, hash: &str, field: &str, value: &str) -> Result<(), StoreError> {
        self.state()
            .hashes
            .entry(hash.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
        Ok(())
    }

    async fn hash_delete(&self, hash: &str, field: &str) -> Result<bool, StoreError> {
        Ok(self
            .state()
            .hashes
            .get_mut(hash)
            .is_some_and(|fields| fields.remove(field).is_some()))
    }

    async fn hash_get_all(&self, hash: &str) -> Result<HashMap<String, String>, StoreError> {
        Ok(self.state().hashes.get(hash).cloned().unwrap_or_default())
    }

    async fn hash_len(&self, hash: &str) -> Result<usize, StoreError> {
        Ok(self.state().hashes.get(hash).map_or(0, HashMap::len))
    }

    async fn delete(&self, keys: &[&str]) -> Result<(), StoreError> {
        let mut state = self.state();
        for key in keys {
            state.lists.remove(*key);
            state.sorted.remove(*key);
            state.hashes.remove(*key);
        }
        Ok(())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
