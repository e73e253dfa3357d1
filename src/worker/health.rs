//! Worker registry, heartbeat and store maintenance.
//!
//! Each worker keeps a record in the workers hash, refreshed every
//! `health_check_interval`. The cleanup loop reclaims processing entries
//! left behind by workers that stopped heartbeating, and trims dead letters
//! past their retention.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::{loop_interval, Shutdown, WorkerContext};
use crate::error::StoreError;
use crate::task::{ProcessingEntry, Task};

/// Error recorded on tasks reclaimed from a dead worker.
pub const STALLED_ERROR: &str = "processing stalled";

const TRIM_BATCH: isize = 100;

/// Lifecycle state published in the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Running,
    Stopping,
}

/// A worker's entry in the workers hash.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerRecord {
    pub worker_id: String,
    pub status: WorkerStatus,
    pub concurrency: usize,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub main_channel_depth: usize,
    pub retry_channel_depth: usize,
}

impl WorkerRecord {
    /// Whether the last heartbeat is within `ttl` of `now`.
    pub fn is_alive(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        age(now, self.last_heartbeat) <= ttl
    }
}

/// What one cleanup sweep did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    /// Processing entries removed.
    pub stuck_removed: usize,
    /// Removed entries whose task went back through the failure path.
    pub resubmitted: usize,
    pub dead_letters_trimmed: usize,
}

/// Elapsed time since `then`, zero if `then` is in the future.
fn age(now: DateTime<Utc>, then: DateTime<Utc>) -> Duration {
    now.signed_duration_since(then)
        .to_std()
        .unwrap_or(Duration::ZERO)
}

/// Number of tasks buffered in a channel.
pub(crate) fn channel_depth<T>(tx: &mpsc::Sender<T>) -> usize {
    tx.max_capacity() - tx.capacity()
}

/// Writes this worker's record and returns it for later heartbeats.
pub(crate) async fn register(
    ctx: &WorkerContext,
    status: WorkerStatus,
    (main_depth, retry_depth): (usize, usize),
) -> Result<WorkerRecord, StoreError> {
    let now = Utc::now();
    let record = WorkerRecord {
        worker_id: ctx.worker_id().to_string(),
        status,
        concurrency: ctx.config.concurrent_workers,
        started_at: now,
        last_heartbeat: now,
        main_channel_depth: main_depth,
        retry_channel_depth: retry_depth,
    };
    publish(ctx, &record).await?;

    info!(worker_id = %record.worker_id, "Worker registered");
    Ok(record)
}

async fn publish(ctx: &WorkerContext, record: &WorkerRecord) -> Result<(), StoreError> {
    let data = serde_json::to_string(record)?;
    ctx.queue
        .store()
        .hash_set(&ctx.config.keys.workers, &record.worker_id, &data)
        .await
}

/// Removes this worker's record.
pub(crate) async fn deregister(ctx: &WorkerContext) -> Result<bool, StoreError> {
    let removed = ctx
        .queue
        .store()
        .hash_delete(&ctx.config.keys.workers, ctx.worker_id())
        .await?;
    debug!(worker_id = %ctx.worker_id(), removed, "Worker deregistered");
    Ok(removed)
}

/// Reads every worker record, skipping undecodable ones.
async fn load_workers(ctx: &WorkerContext) -> Result<Vec<WorkerRecord>, StoreError> {
    let raw = ctx
        .queue
        .store()
        .hash_get_all(&ctx.config.keys.workers)
        .await?;

    Ok(raw
        .into_iter()
        .filter_map(|(worker_id, data)| match serde_json::from_str(&data) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!(worker_id = %worker_id, error = %e, "Skipping undecodable worker record");
                None
            }
        })
        .collect())
}

/// Heartbeat loop: refreshes the registry record and the queue gauges.
pub(crate) async fn run_heartbeat(
    ctx: Arc<WorkerContext>,
    mut record: WorkerRecord,
    main_tx: mpsc::Sender<Task>,
    retry_tx: mpsc::Sender<Task>,
    mut shutdown: Shutdown,
) {
    let mut ticker = loop_interval(ctx.config.health_check_interval);
    ticker.tick().await;

    loop {
        tokio::select! {
            biased;
            _ = shutdown.wait() => break,
            _ = ticker.tick() => {}
        }

        record.last_heartbeat = Utc::now();
        record.main_channel_depth = channel_depth(&main_tx);
        record.retry_channel_depth = channel_depth(&retry_tx);

        if let Err(e) = publish(&ctx, &record).await {
            error!(worker_id = %ctx.worker_id(), error = %e, "Failed to publish heartbeat");
        }
        if let Err(e) = update_gauges(&ctx).await {
            warn!(worker_id = %ctx.worker_id(), error = %e, "Failed to read queue depths");
        }
    }

    // Visible to admins until deregistration completes.
    record.status = WorkerStatus::Stopping;
    if let Err(e) = publish(&ctx, &record).await {
        debug!(worker_id = %ctx.worker_id(), error = %e, "Failed to publish stopping status");
    }
}

async fn update_gauges(ctx: &WorkerContext) -> Result<(), StoreError> {
    let store = ctx.queue.store();
    let keys = &ctx.config.keys;

    ctx.metrics
        .update_queue_depth("main", store.len(&keys.main).await?);
    ctx.metrics
        .update_queue_depth("retry", store.len(&keys.retry).await?);
    ctx.metrics
        .update_queue_depth("scheduled", store.sorted_len(&keys.scheduled).await?);
    ctx.metrics
        .update_queue_depth("dead_letter", store.len(&keys.dead_letter).await?);
    let in_flight = store.hash_len(&keys.processing).await?;
    ctx.metrics.update_queue_depth("processing", in_flight);
    ctx.metrics.update_in_flight(in_flight);

    Ok(())
}

/// Cleanup loop. The first sweep runs immediately.
pub(crate) async fn run_cleanup(ctx: Arc<WorkerContext>, mut shutdown: Shutdown) {
    let mut ticker = loop_interval(ctx.config.cleanup_interval);

    loop {
        tokio::select! {
            biased;
            _ = shutdown.wait() => break,
            _ = ticker.tick() => {
                cleanup(&ctx).await;
            }
        }
    }
}

/// Runs one maintenance sweep. Failures are logged and reflected as zero
/// counts in the report.
pub(crate) async fn cleanup(ctx: &WorkerContext) -> CleanupReport {
    let mut report = CleanupReport::default();

    match reclaim_stuck(ctx, &mut report).await {
        Ok(()) => {}
        Err(e) => error!(worker_id = %ctx.worker_id(), error = %e, "Stuck task cleanup failed"),
    }
    match trim_dead_letters(ctx).await {
        Ok(trimmed) => report.dead_letters_trimmed = trimmed,
        Err(e) => error!(worker_id = %ctx.worker_id(), error = %e, "Dead letter trim failed"),
    }

    if report != CleanupReport::default() {
        info!(
            worker_id = %ctx.worker_id(),
            stuck_removed = report.stuck_removed,
            resubmitted = report.resubmitted,
            dead_letters_trimmed = report.dead_letters_trimmed,
            "Cleanup sweep finished"
        );
    }

    report
}

/// Removes processing entries older than the stuck threshold. A task whose
/// owner no longer heartbeats goes back through the failure path; one whose
/// owner is alive is only unlisted.
async fn reclaim_stuck(ctx: &WorkerContext, report: &mut CleanupReport) -> Result<(), StoreError> {
    let now = Utc::now();
    let threshold = ctx.config.stuck_threshold();
    let ttl = ctx.config.heartbeat_ttl();

    let live: HashSet<String> = load_workers(ctx)
        .await?
        .into_iter()
        .filter(|record| record.is_alive(now, ttl))
        .map(|record| record.worker_id)
        .collect();

    let entries = ctx
        .queue
        .store()
        .hash_get_all(&ctx.config.keys.processing)
        .await?;

    for (task_id, data) in entries {
        let entry: ProcessingEntry = match serde_json::from_str(&data) {
            Ok(entry) => entry,
            Err(e) => {
                warn!(task_id = %task_id, error = %e, "Removing undecodable processing entry");
                if ctx.queue.clear_processing(&task_id).await? {
                    report.stuck_removed += 1;
                }
                continue;
            }
        };

        if age(now, entry.started_at) <= threshold {
            continue;
        }

        let orphaned = !live.contains(&entry.worker_id);
        let task = match (orphaned, entry.task.as_deref()) {
            (true, Some(raw)) => Task::from_json(raw).ok(),
            _ => None,
        };

        match task {
            Some(task) => {
                // Deleting the entry is the claim: only the sweep that removed
                // it resubmits the task.
                if !ctx.queue.clear_processing(&task_id).await? {
                    continue;
                }
                warn!(
                    task_id = %task_id,
                    owner = %entry.worker_id,
                    "Resubmitting task from dead worker"
                );
                if ctx
                    .handle_failure(task, STALLED_ERROR.to_string(), Duration::ZERO)
                    .await
                {
                    report.stuck_removed += 1;
                    report.resubmitted += 1;
                } else {
                    // Put the entry back so a later sweep can try again.
                    ctx.queue
                        .store()
                        .hash_set(&ctx.config.keys.processing, &task_id, &data)
                        .await?;
                }
            }
            None => {
                warn!(
                    task_id = %task_id,
                    owner = %entry.worker_id,
                    orphaned,
                    "Removing stuck processing entry"
                );
                if ctx.queue.clear_processing(&task_id).await? {
                    report.stuck_removed += 1;
                }
            }
        }
    }

    Ok(())
}

/// Removes dead letters that failed before the retention window. Entries are
/// appended in failure order, so the scan stops at the first fresh one.
async fn trim_dead_letters(ctx: &WorkerContext) -> Result<usize, StoreError> {
    let store = ctx.queue.store();
    let list = &ctx.config.keys.dead_letter;
    let now = Utc::now();
    let retention = ctx.config.dead_letter_retention;
    let mut trimmed = 0;

    loop {
        let batch = store.range(list, 0, TRIM_BATCH - 1).await?;
        if batch.is_empty() {
            return Ok(trimmed);
        }

        for raw in &batch {
            let expired = match Task::from_json(raw) {
                Ok(task) => age(now, task.dead_letter_since()) > retention,
                Err(_) => true,
            };
            if !expired {
                return Ok(trimmed);
            }
            trimmed += store.remove(list, raw).await?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::config::WorkerConfig;
    use crate::delivery::LogDelivery;
    use crate::metrics::MetricsCollector;
    use crate::queue::TaskQueue;
    use crate::store::{MemoryStore, QueueStore};
    use crate::task::{NotificationRequest, TaskType};
    use crate::worker::stats::SharedStats;

    fn context() -> (WorkerContext, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let config = WorkerConfig::new("worker-h", "h")
            .with_processing_timeout(Duration::from_secs(10))
            .with_health_check_interval(Duration::from_secs(10))
            .with_max_retries(3);
        let ctx = WorkerContext {
            queue: TaskQueue::new(store.clone(), config.keys.clone()),
            config,
            delivery: Arc::new(LogDelivery),
            stats: SharedStats::default(),
            metrics: MetricsCollector::new(),
        };
        (ctx, store)
    }

    fn task() -> Task {
        Task::single(NotificationRequest::new("u", "t", "m"))
    }

    async fn put_entry(store: &MemoryStore, task: &Task, owner: &str, age_secs: i64) {
        let mut entry = ProcessingEntry::new(task, owner);
        entry.started_at = Utc::now() - chrono::Duration::seconds(age_secs);
        store
            .hash_set("h:processing", &task.id, &serde_json::to_string(&entry).unwrap())
            .await
            .unwrap();
    }

    async fn put_worker(store: &MemoryStore, worker_id: &str, heartbeat_age_secs: i64) {
        let now = Utc::now();
        let record = WorkerRecord {
            worker_id: worker_id.to_string(),
            status: WorkerStatus::Running,
            concurrency: 1,
            started_at: now,
            last_heartbeat: now - chrono::Duration::seconds(heartbeat_age_secs),
            main_channel_depth: 0,
            retry_channel_depth: 0,
        };
        store
            .hash_set("h:workers", worker_id, &serde_json::to_string(&record).unwrap())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_register_and_deregister() {
        let (ctx, store) = context();

        let record = register(&ctx, WorkerStatus::Running, (2, 1)).await.unwrap();
        assert_eq!(record.main_channel_depth, 2);

        let workers = load_workers(&ctx).await.unwrap();
        assert_eq!(workers, vec![record]);

        assert!(deregister(&ctx).await.unwrap());
        assert_eq!(store.hash_len("h:workers").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_fresh_entries_are_kept() {
        let (ctx, store) = context();
        put_entry(&store, &task(), "worker-gone", 5).await;

        let report = cleanup(&ctx).await;

        assert_eq!(report, CleanupReport::default());
        assert_eq!(store.hash_len("h:processing").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_stuck_task_of_dead_worker_is_resubmitted() {
        let (ctx, store) = context();
        let t = task();
        put_worker(&store, "worker-gone", 120).await;
        put_entry(&store, &t, "worker-gone", 60).await;

        let report = cleanup(&ctx).await;

        assert_eq!(report.stuck_removed, 1);
        assert_eq!(report.resubmitted, 1);
        assert_eq!(store.hash_len("h:processing").await.unwrap(), 0);
        let retry = store.range("h:retry", 0, -1).await.unwrap();
        assert_eq!(retry.len(), 1);
        let retried = Task::from_json(&retry[0]).unwrap();
        assert_eq!(retried.id, t.id);
        assert_eq!(retried.task_type, TaskType::Retry);
        assert_eq!(retried.attempt_count, 1);
        assert_eq!(retried.last_error.as_deref(), Some(STALLED_ERROR));
    }

    /// Store that yields before every call, so concurrent sweeps interleave
    /// the way they do over a network round trip.
    struct YieldingStore(MemoryStore);

    #[async_trait::async_trait]
    impl QueueStore for YieldingStore {
        async fn push_back(&self, list: &str, value: &str) -> Result<(), StoreError> {
            tokio::task::yield_now().await;
            self.0.push_back(list, value).await
        }

        async fn push_front(&self, list: &str, value: &str) -> Result<(), StoreError> {
            tokio::task::yield_now().await;
            self.0.push_front(list, value).await
        }

        async fn pop_front(&self, list: &str) -> Result<Option<String>, StoreError> {
            tokio::task::yield_now().await;
            self.0.pop_front(list).await
        }

        async fn pop_front_blocking(
            &self,
            list: &str,
            timeout: Duration,
        ) -> Result<Option<String>, StoreError> {
            tokio::task::yield_now().await;
            self.0.pop_front_blocking(list, timeout).await
        }

        async fn range(
            &self,
            list: &str,
            start: isize,
            stop: isize,
        ) -> Result<Vec<String>, StoreError> {
            tokio::task::yield_now().await;
            self.0.range(list, start, stop).await
        }

        async fn remove(&self, list: &str, value: &str) -> Result<usize, StoreError> {
            tokio::task::yield_now().await;
            self.0.remove(list, value).await
        }

        async fn len(&self, list: &str) -> Result<usize, StoreError> {
            tokio::task::yield_now().await;
            self.0.len(list).await
        }

        async fn sorted_add(&self, set: &str, member: &str, score: f64) -> Result<(), StoreError> {
            tokio::task::yield_now().await;
            self.0.sorted_add(set, member, score).await
        }

        async fn sorted_range_to(
            &self,
            set: &str,
            max_score: f64,
        ) -> Result<Vec<String>, StoreError> {
            tokio::task::yield_now().await;
            self.0.sorted_range_to(set, max_score).await
        }

        async fn sorted_remove(&self, set: &str, member: &str) -> Result<bool, StoreError> {
            tokio::task::yield_now().await;
            self.0.sorted_remove(set, member).await
        }

        async fn sorted_len(&self, set: &str) -> Result<usize, StoreError> {
            tokio::task::yield_now().await;
            self.0.sorted_len(set).await
        }

        async fn hash_set(&self, hash: &str, field: &str, value: &str) -> Result<(), StoreError> {
            tokio::task::yield_now().await;
            self.0.hash_set(hash, field, value).await
        }

        async fn hash_delete(&self, hash: &str, field: &str) -> Result<bool, StoreError> {
            tokio::task::yield_now().await;
            self.0.hash_delete(hash, field).await
        }

        async fn hash_get_all(
            &self,
            hash: &str,
        ) -> Result<std::collections::HashMap<String, String>, StoreError> {
            tokio::task::yield_now().await;
            self.0.hash_get_all(hash).await
        }

        async fn hash_len(&self, hash: &str) -> Result<usize, StoreError> {
            tokio::task::yield_now().await;
            self.0.hash_len(hash).await
        }

        async fn delete(&self, keys: &[&str]) -> Result<(), StoreError> {
            tokio::task::yield_now().await;
            self.0.delete(keys).await
        }

        async fn ping(&self) -> Result<(), StoreError> {
            tokio::task::yield_now().await;
            self.0.ping().await
        }
    }

    #[tokio::test]
    async fn test_concurrent_sweeps_resubmit_stuck_task_once() {
        let store = Arc::new(YieldingStore(MemoryStore::new()));
        let sweeper = |worker_id: &str| {
            let config = WorkerConfig::new(worker_id, "h")
                .with_processing_timeout(Duration::from_secs(10))
                .with_health_check_interval(Duration::from_secs(10));
            WorkerContext {
                queue: TaskQueue::new(store.clone(), config.keys.clone()),
                config,
                delivery: Arc::new(LogDelivery),
                stats: SharedStats::default(),
                metrics: MetricsCollector::new(),
            }
        };
        let (a, b) = (sweeper("worker-a"), sweeper("worker-b"));
        let t = task();
        put_worker(&store.0, "worker-dead", 120).await;
        put_entry(&store.0, &t, "worker-dead", 60).await;

        let (first, second) = tokio::join!(cleanup(&a), cleanup(&b));

        assert_eq!(first.resubmitted + second.resubmitted, 1);
        assert_eq!(first.stuck_removed + second.stuck_removed, 1);
        let retry = store.0.range("h:retry", 0, -1).await.unwrap();
        assert_eq!(retry.len(), 1);
        assert_eq!(Task::from_json(&retry[0]).unwrap().id, t.id);
        assert_eq!(store.0.hash_len("h:processing").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_stuck_task_of_live_worker_is_only_unlisted() {
        let (ctx, store) = context();
        put_worker(&store, "worker-alive", 1).await;
        put_entry(&store, &task(), "worker-alive", 60).await;

        let report = cleanup(&ctx).await;

        assert_eq!(report.stuck_removed, 1);
        assert_eq!(report.resubmitted, 0);
        assert_eq!(store.len("h:retry").await.unwrap(), 0);
        assert_eq!(store.hash_len("h:processing").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_expired_dead_letters_are_trimmed_from_head() {
        let (ctx, store) = context();
        let mut old = task();
        old.created_at = Utc::now() - chrono::Duration::days(8);
        let fresh = task();
        let mut old_after_fresh = task();
        old_after_fresh.created_at = Utc::now() - chrono::Duration::days(9);

        store.push_back("h:dead_letter", "not json").await.unwrap();
        ctx.queue.push_dead_letter(&old).await.unwrap();
        ctx.queue.push_dead_letter(&fresh).await.unwrap();
        ctx.queue.push_dead_letter(&old_after_fresh).await.unwrap();

        let report = cleanup(&ctx).await;

        assert_eq!(report.dead_letters_trimmed, 2);
        let remaining = store.range("h:dead_letter", 0, -1).await.unwrap();
        assert_eq!(remaining.len(), 2);
        assert_eq!(Task::from_json(&remaining[0]).unwrap().id, fresh.id);
    }

    #[tokio::test]
    async fn test_recent_dead_letter_of_old_task_is_kept() {
        let (ctx, store) = context();
        let mut legacy = task();
        legacy.created_at = Utc::now() - chrono::Duration::days(9);
        let mut stale = task();
        stale.created_at = Utc::now() - chrono::Duration::days(30);
        stale.mark_dead_lettered(Utc::now() - chrono::Duration::days(8));
        let mut recent = task();
        recent.created_at = Utc::now() - chrono::Duration::days(8);
        recent.mark_dead_lettered(Utc::now());

        ctx.queue.push_dead_letter(&legacy).await.unwrap();
        ctx.queue.push_dead_letter(&stale).await.unwrap();
        ctx.queue.push_dead_letter(&recent).await.unwrap();

        let report = cleanup(&ctx).await;

        assert_eq!(report.dead_letters_trimmed, 2);
        let remaining = store.range("h:dead_letter", 0, -1).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(Task::from_json(&remaining[0]).unwrap().id, recent.id);
    }

    #[test]
    fn test_worker_record_liveness() {
        let now = Utc::now();
        let record = WorkerRecord {
            worker_id: "w".to_string(),
            status: WorkerStatus::Running,
            concurrency: 1,
            started_at: now,
            last_heartbeat: now - chrono::Duration::seconds(40),
            main_channel_depth: 0,
            retry_channel_depth: 0,
        };

        assert!(record.is_alive(now, Duration::from_secs(60)));
        assert!(!record.is_alive(now, Duration::from_secs(30)));
    }

    #[test]
    fn test_channel_depth() {
        let (tx, _rx) = mpsc::channel::<u8>(4);
        tx.try_send(1).unwrap();
        tx.try_send(2).unwrap();

        assert_eq!(channel_depth(&tx), 2);
    }
}
