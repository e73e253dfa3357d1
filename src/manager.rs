//! Administrative operations over the queues.
//!
//! `QueueManager` works directly on the store and does not need a running
//! worker. It backs the `stats`, `purge`, `requeue`, `dead-letters` and
//! `workers` CLI commands.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tracing::{info, warn};

use crate::config::QueueKeys;
use crate::error::StoreError;
use crate::queue::{Placement, TaskQueue};
use crate::store::QueueStore;
use crate::task::Task;
use crate::worker::WorkerRecord;

const DEFAULT_WORKER_TTL: Duration = Duration::from_secs(90);

/// Sizes of every queue structure.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub main: usize,
    pub retry: usize,
    pub scheduled: usize,
    pub dead_letter: usize,
    pub processing: usize,
    pub registered_workers: usize,
    /// Registered workers with a fresh heartbeat.
    pub live_workers: usize,
}

impl QueueStats {
    /// Tasks not yet in a terminal state.
    pub fn pending(&self) -> usize {
        self.main + self.retry + self.scheduled + self.processing
    }
}

/// Admin handle over one key prefix.
#[derive(Clone)]
pub struct QueueManager {
    queue: TaskQueue,
    worker_ttl: Duration,
}

impl QueueManager {
    pub fn new(store: Arc<dyn QueueStore>, keys: QueueKeys) -> Self {
        Self::from_queue(TaskQueue::new(store, keys))
    }

    pub fn from_queue(queue: TaskQueue) -> Self {
        Self {
            queue,
            worker_ttl: DEFAULT_WORKER_TTL,
        }
    }

    /// Heartbeat age beyond which a registered worker is not counted as live.
    /// Should match the workers' `heartbeat_ttl()`.
    pub fn with_worker_ttl(mut self, ttl: Duration) -> Self {
        self.worker_ttl = ttl;
        self
    }

    fn store(&self) -> &Arc<dyn QueueStore> {
        self.queue.store()
    }

    fn keys(&self) -> &QueueKeys {
        self.queue.keys()
    }

    /// Reads the size of every queue.
    pub async fn stats(&self) -> Result<QueueStats, StoreError> {
        let store = self.store();
        let keys = self.keys();

        Ok(QueueStats {
            main: store.len(&keys.main).await?,
            retry: store.len(&keys.retry).await?,
            scheduled: store.sorted_len(&keys.scheduled).await?,
            dead_letter: store.len(&keys.dead_letter).await?,
            processing: store.hash_len(&keys.processing).await?,
            registered_workers: store.hash_len(&keys.workers).await?,
            live_workers: self.live_workers().await?,
        })
    }

    /// Deletes every queue except the worker registry. Idempotent.
    pub async fn purge(&self) -> Result<(), StoreError> {
        self.store().delete(&self.keys().purgeable()).await?;
        warn!(queue = %self.keys().main, "Purged all queues");
        Ok(())
    }

    /// Moves up to `limit` dead letters back to the main list with their
    /// attempt count and last error reset. Returns how many were moved.
    ///
    /// Undecodable entries are put back at the tail and not counted.
    pub async fn requeue_dead_letters(&self, limit: usize) -> Result<usize, StoreError> {
        let store = self.store();
        let list = &self.keys().dead_letter;
        let mut requeued = 0;

        for _ in 0..limit {
            let Some(raw) = store.pop_front(list).await? else {
                break;
            };

            let mut task = match Task::from_json(&raw) {
                Ok(task) => task,
                Err(e) => {
                    warn!(error = %e, "Keeping undecodable dead letter");
                    store.push_back(list, &raw).await?;
                    continue;
                }
            };

            task.reset_for_requeue();
            if let Err(e) = self.queue.push_main(&task).await {
                store.push_front(list, &raw).await?;
                return Err(e);
            }
            requeued += 1;
        }

        if requeued > 0 {
            info!(count = requeued, "Requeued dead letters");
        }
        Ok(requeued)
    }

    /// Returns up to `limit` dead letters from the head without removing them.
    pub async fn dead_letters(&self, limit: usize) -> Result<Vec<Task>, StoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let stop = isize::try_from(limit).unwrap_or(isize::MAX) - 1;
        let raw = self.store().range(&self.keys().dead_letter, 0, stop).await?;

        Ok(raw
            .iter()
            .filter_map(|data| match Task::from_json(data) {
                Ok(task) => Some(task),
                Err(e) => {
                    warn!(error = %e, "Skipping undecodable dead letter");
                    None
                }
            })
            .collect())
    }

    /// Returns every registered worker, most recent heartbeat first.
    pub async fn workers(&self) -> Result<Vec<WorkerRecord>, StoreError> {
        let raw = self.store().hash_get_all(&self.keys().workers).await?;
        let mut workers: Vec<WorkerRecord> = raw
            .values()
            .filter_map(|data| serde_json::from_str(data).ok())
            .collect();
        workers.sort_by(|a, b| b.last_heartbeat.cmp(&a.last_heartbeat));
        Ok(workers)
    }

    /// Counts registered workers with a fresh heartbeat.
    pub async fn live_workers(&self) -> Result<usize, StoreError> {
        let now = Utc::now();
        Ok(self
            .workers()
            .await?
            .iter()
            .filter(|record| record.is_alive(now, self.worker_ttl))
            .count())
    }

    /// Submits a task without a running worker.
    pub async fn submit(
        &self,
        task: Task,
        default_max_retries: u32,
    ) -> Result<(Task, Placement), StoreError> {
        self.queue.add_task(task, default_max_retries).await
    }
}
