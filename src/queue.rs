//! Task queue client over the durable store.
//!
//! `TaskQueue` knows the key layout and the task encoding. It is shared by
//! producers (task submission), the worker loops and the admin manager.
//!
//! # Queue structure
//!
//! - `{prefix}:queue`: main list, tasks pushed to the tail, popped from the head
//! - `{prefix}:retry`: tasks waiting for another attempt
//! - `{prefix}:scheduled`: sorted set scored by due Unix timestamp
//! - `{prefix}:dead_letter`: tasks that exhausted their retries
//! - `{prefix}:processing`: hash of in-flight task ids
//! - `{prefix}:workers`: hash of registered workers

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::debug;
use uuid::Uuid;

use crate::config::QueueKeys;
use crate::error::{StoreError, TaskError};
use crate::store::QueueStore;
use crate::task::{ProcessingEntry, Task, TaskType};

/// Where a submitted task was placed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// Main list, deliverable now.
    Immediate,
    /// Scheduled set, deliverable at `scheduled_at`.
    Scheduled,
}

/// A task popped from one of the lists.
#[derive(Debug)]
pub enum Popped {
    Task(Task),
    /// Entry that could not be decoded. It has been removed from the store.
    Malformed { raw: String, error: TaskError },
}

/// Handle to the queues of one key prefix.
#[derive(Clone)]
pub struct TaskQueue {
    store: Arc<dyn QueueStore>,
    keys: QueueKeys,
}

impl TaskQueue {
    pub fn new(store: Arc<dyn QueueStore>, keys: QueueKeys) -> Self {
        Self { store, keys }
    }

    pub fn store(&self) -> &Arc<dyn QueueStore> {
        &self.store
    }

    pub fn keys(&self) -> &QueueKeys {
        &self.keys
    }

    /// Submits a task.
    ///
    /// Assigns an id when absent and fills in `max_retries` from
    /// `default_max_retries` when unset. Tasks due in the future go to the
    /// scheduled set (typed `scheduled`), everything else to the main list.
    /// Payload consistency is not checked here; it is checked at processing time.
    pub async fn add_task(
        &self,
        mut task: Task,
        default_max_retries: u32,
    ) -> Result<(Task, Placement), StoreError> {
        if task.id.is_empty() {
            task.id = Uuid::new_v4().to_string();
        }
        if task.max_retries.is_none() {
            task.max_retries = Some(default_max_retries);
        }

        let now = Utc::now();
        let placement = match task.scheduled_at.filter(|at| *at > now) {
            Some(at) => {
                task.task_type = TaskType::Scheduled;
                self.schedule(&task, at).await?;
                Placement::Scheduled
            }
            None => {
                self.push_main(&task).await?;
                Placement::Immediate
            }
        };

        debug!(task_id = %task.id, task_type = %task.task_type, ?placement, "Task submitted");
        Ok((task, placement))
    }

    /// Adds a task to the scheduled set, due at `at`.
    pub async fn schedule(&self, task: &Task, at: DateTime<Utc>) -> Result<(), StoreError> {
        let data = task.to_json()?;
        let score = due_score(at);
        self.store
            .sorted_add(&self.keys.scheduled, &data, score)
            .await
    }

    pub async fn push_main(&self, task: &Task) -> Result<(), StoreError> {
        let data = task.to_json()?;
        self.store.push_back(&self.keys.main, &data).await
    }

    /// Returns a task to the head of the main list so it keeps its position.
    pub async fn return_main(&self, task: &Task) -> Result<(), StoreError> {
        let data = task.to_json()?;
        self.store.push_front(&self.keys.main, &data).await
    }

    pub async fn push_retry(&self, task: &Task) -> Result<(), StoreError> {
        let data = task.to_json()?;
        self.store.push_back(&self.keys.retry, &data).await
    }

    pub async fn return_retry(&self, task: &Task) -> Result<(), StoreError> {
        let data = task.to_json()?;
        self.store.push_front(&self.keys.retry, &data).await
    }

    pub async fn push_dead_letter(&self, task: &Task) -> Result<(), StoreError> {
        let data = task.to_json()?;
        self.store.push_back(&self.keys.dead_letter, &data).await
    }

    /// Pops the head of a list, waiting up to `timeout`.
    pub async fn pop(&self, list: &str, timeout: Duration) -> Result<Option<Popped>, StoreError> {
        let Some(raw) = self.store.pop_front_blocking(list, timeout).await? else {
            return Ok(None);
        };

        Ok(Some(match Task::from_json(&raw) {
            Ok(task) => Popped::Task(task),
            Err(error) => Popped::Malformed { raw, error },
        }))
    }

    /// Records a task as in flight on `worker_id`.
    pub async fn mark_processing(&self, task: &Task, worker_id: &str) -> Result<(), StoreError> {
        let entry = ProcessingEntry::new(task, worker_id);
        let data = serde_json::to_string(&entry)?;
        self.store
            .hash_set(&self.keys.processing, &task.id, &data)
            .await
    }

    pub async fn clear_processing(&self, task_id: &str) -> Result<bool, StoreError> {
        self.store
            .hash_delete(&self.keys.processing, task_id)
            .await
    }

    /// Removes and returns every scheduled task due at or before `now`.
    ///
    /// Only members this call removed are returned, so concurrent instances
    /// never promote the same task twice. Undecodable members are removed and
    /// reported as malformed.
    pub async fn take_due(&self, now: DateTime<Utc>) -> Result<Vec<Popped>, StoreError> {
        let max_score = now.timestamp_millis() as f64 / 1000.0;
        // Due scores are rounded up, so a member at or below `max_score` is
        // never due later than `now`.
        let members = self
            .store
            .sorted_range_to(&self.keys.scheduled, max_score)
            .await?;

        let mut due = Vec::with_capacity(members.len());
        for raw in members {
            if !self.store.sorted_remove(&self.keys.scheduled, &raw).await? {
                continue;
            }
            due.push(match Task::from_json(&raw) {
                Ok(task) => Popped::Task(task),
                Err(error) => Popped::Malformed { raw, error },
            });
        }

        Ok(due)
    }
}

/// Unix seconds with millisecond fraction, rounded up to the next millisecond.
fn due_score(at: DateTime<Utc>) -> f64 {
    let micros = at.timestamp_micros();
    let millis = micros.div_euclid(1000) + i64::from(micros.rem_euclid(1000) != 0);
    millis as f64 / 1000.0
}
