//! End-to-end tests of the delivery pipeline over the in-memory store.
//!
//! Retry delays are clamped to at least one second, so retry scenarios take
//! a few seconds of real time.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use notify_queue::task::{
    BulkNotificationRequest, NotificationRequest, SystemAnnouncementRequest,
    TemplatedNotificationRequest,
};
use notify_queue::{
    DeliveryError, MemoryStore, NotificationDelivery, NotificationWorker, QueueManager,
    QueueStore, Task, TaskType, WorkerConfig, WorkerError, WorkerStats,
};

/// Adapter that fails the first `failures[user_id]` deliveries of each user.
/// A user listed with `u32::MAX` never succeeds.
#[derive(Default)]
struct ScriptedDelivery {
    failures: HashMap<String, u32>,
    calls: Mutex<HashMap<String, u32>>,
    delivered: Mutex<Vec<(String, DateTime<Utc>)>>,
}

impl ScriptedDelivery {
    fn failing(failures: &[(&str, u32)]) -> Self {
        Self {
            failures: failures
                .iter()
                .map(|(user, count)| (user.to_string(), *count))
                .collect(),
            ..Default::default()
        }
    }

    fn attempt(&self, user_id: &str) -> Result<(), DeliveryError> {
        let call = {
            let mut calls = self.calls.lock().expect("lock poisoned");
            let call = calls.entry(user_id.to_string()).or_insert(0);
            *call += 1;
            *call
        };

        let allowed_failures = self.failures.get(user_id).copied().unwrap_or(0);
        if call <= allowed_failures {
            return Err(DeliveryError::Transport(format!(
                "provider unavailable (call {call})"
            )));
        }

        self.delivered
            .lock()
            .expect("lock poisoned")
            .push((user_id.to_string(), Utc::now()));
        Ok(())
    }

    fn calls(&self, user_id: &str) -> u32 {
        self.calls
            .lock()
            .expect("lock poisoned")
            .get(user_id)
            .copied()
            .unwrap_or(0)
    }

    fn delivered_at(&self, user_id: &str) -> Option<DateTime<Utc>> {
        self.delivered
            .lock()
            .expect("lock poisoned")
            .iter()
            .find(|(user, _)| user == user_id)
            .map(|(_, at)| *at)
    }
}

#[async_trait]
impl NotificationDelivery for ScriptedDelivery {
    async fn send_single(&self, request: &NotificationRequest) -> Result<(), DeliveryError> {
        self.attempt(&request.user_id)
    }

    async fn send_bulk(&self, request: &BulkNotificationRequest) -> Result<(), DeliveryError> {
        self.attempt(&request.user_ids.join(","))
    }

    async fn send_templated(
        &self,
        request: &TemplatedNotificationRequest,
    ) -> Result<(), DeliveryError> {
        self.attempt(&request.user_id)
    }

    async fn send_announcement(
        &self,
        request: &SystemAnnouncementRequest,
    ) -> Result<(), DeliveryError> {
        self.attempt(&request.title)
    }
}

fn config(prefix: &str) -> WorkerConfig {
    WorkerConfig::new(format!("worker-{prefix}"), prefix)
        .with_concurrent_workers(5)
        .with_retry_delay(Duration::from_millis(10))
        .with_processing_timeout(Duration::from_secs(2))
        .with_scheduled_poll_interval(Duration::from_millis(100))
        .with_pop_timeout(Duration::from_millis(50))
        .with_idle_backoff(Duration::from_millis(10))
        .with_shutdown_timeout(Duration::from_secs(5))
}

fn single(user_id: &str) -> Task {
    Task::single(NotificationRequest::new(user_id, "Build finished", "All green"))
}

async fn wait_for_stats(
    worker: &NotificationWorker,
    within: Duration,
    done: impl Fn(&WorkerStats) -> bool,
) -> WorkerStats {
    let deadline = tokio::time::Instant::now() + within;
    loop {
        let stats = worker.stats();
        if done(&stats) || tokio::time::Instant::now() >= deadline {
            return stats;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn test_task_recovers_after_transient_failures() {
    let store = Arc::new(MemoryStore::new());
    let delivery = Arc::new(ScriptedDelivery::failing(&[("flaky", 2)]));
    let mut worker = NotificationWorker::new(
        config("flaky").with_max_retries(2),
        store.clone(),
        delivery.clone(),
    );
    worker.start().await.expect("worker starts");

    worker.add_task(single("flaky")).await.expect("submit");

    let stats = wait_for_stats(&worker, Duration::from_secs(15), |s| s.delivered == 1).await;
    worker.stop().await.expect("worker stops");

    assert_eq!(stats.delivered, 1);
    assert_eq!(stats.failed, 2);
    assert_eq!(stats.retried, 2);
    assert_eq!(stats.dead_lettered, 0);
    assert_eq!(delivery.calls("flaky"), 3);
    assert_eq!(store.len("flaky:dead_letter").await.unwrap(), 0);
    assert_eq!(store.hash_len("flaky:processing").await.unwrap(), 0);
}

#[tokio::test]
async fn test_exhausted_task_is_dead_lettered_once() {
    let store = Arc::new(MemoryStore::new());
    let delivery = Arc::new(ScriptedDelivery::failing(&[("broken", u32::MAX)]));
    let mut worker = NotificationWorker::new(
        config("dead").with_max_retries(1),
        store.clone(),
        delivery.clone(),
    );
    worker.start().await.expect("worker starts");

    let mut old = single("broken");
    old.created_at = Utc::now() - chrono::Duration::days(8);
    let id = worker.add_task(old).await.expect("submit");

    let stats =
        wait_for_stats(&worker, Duration::from_secs(15), |s| s.dead_lettered == 1).await;
    worker.stop().await.expect("worker stops");

    // Retention runs from the failure, not from creation.
    let report = worker.cleanup_now().await;
    assert_eq!(report.dead_letters_trimmed, 0);

    assert_eq!(stats.dead_lettered, 1);
    assert_eq!(delivery.calls("broken"), 2);

    let dead = store.range("dead:dead_letter", 0, -1).await.unwrap();
    assert_eq!(dead.len(), 1);
    let dead = Task::from_json(&dead[0]).unwrap();
    assert_eq!(dead.id, id);
    assert_eq!(dead.attempt_count, 2);
    assert!(dead.dead_lettered_at.is_some());
    assert!(dead
        .last_error
        .as_deref()
        .unwrap()
        .contains("provider unavailable"));

    assert_eq!(store.len("dead:queue").await.unwrap(), 0);
    assert_eq!(store.len("dead:retry").await.unwrap(), 0);
    assert_eq!(store.sorted_len("dead:scheduled").await.unwrap(), 0);
    assert_eq!(store.hash_len("dead:processing").await.unwrap(), 0);
}

#[tokio::test]
async fn test_scheduled_task_is_not_delivered_early() {
    let store = Arc::new(MemoryStore::new());
    let delivery = Arc::new(ScriptedDelivery::default());
    let mut worker = NotificationWorker::new(config("sched"), store.clone(), delivery.clone());
    worker.start().await.expect("worker starts");

    let due = Utc::now() + chrono::Duration::seconds(2);
    worker
        .add_task(single("later").with_scheduled_at(due))
        .await
        .expect("submit");
    assert_eq!(store.sorted_len("sched:scheduled").await.unwrap(), 1);

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(worker.stats().delivered, 0);

    let stats = wait_for_stats(&worker, Duration::from_secs(10), |s| s.delivered == 1).await;
    worker.stop().await.expect("worker stops");

    assert_eq!(stats.delivered, 1);
    let delivered_at = delivery.delivered_at("later").expect("delivered");
    assert!(delivered_at >= due);
    assert_eq!(store.sorted_len("sched:scheduled").await.unwrap(), 0);
}

#[tokio::test]
async fn test_zero_poll_interval_still_promotes_scheduled_tasks() {
    let store = Arc::new(MemoryStore::new());
    let delivery = Arc::new(ScriptedDelivery::default());
    let mut config = config("zero").with_health_check_interval(Duration::ZERO);
    config.scheduled_poll_interval = Duration::ZERO;
    config.cleanup_interval = Duration::ZERO;
    let mut worker = NotificationWorker::new(config, store.clone(), delivery.clone());
    worker.start().await.expect("worker starts");

    worker
        .add_task(single("soon").with_scheduled_at(Utc::now() + chrono::Duration::milliseconds(100)))
        .await
        .expect("submit");

    let stats = wait_for_stats(&worker, Duration::from_secs(5), |s| s.delivered == 1).await;
    worker.stop().await.expect("worker stops");

    assert_eq!(stats.delivered, 1);
    assert_eq!(store.sorted_len("zero:scheduled").await.unwrap(), 0);
}

#[tokio::test]
async fn test_past_scheduled_task_is_delivered_immediately() {
    let store = Arc::new(MemoryStore::new());
    let delivery = Arc::new(ScriptedDelivery::default());
    let mut worker = NotificationWorker::new(config("past"), store.clone(), delivery.clone());
    worker.start().await.expect("worker starts");

    worker
        .add_task(single("overdue").with_scheduled_at(Utc::now() - chrono::Duration::hours(1)))
        .await
        .expect("submit");
    assert_eq!(store.sorted_len("past:scheduled").await.unwrap(), 0);

    let stats = wait_for_stats(&worker, Duration::from_secs(5), |s| s.delivered == 1).await;
    worker.stop().await.expect("worker stops");

    assert_eq!(stats.delivered, 1);
}

#[tokio::test]
async fn test_hundred_tasks_all_reach_terminal_state() {
    let store = Arc::new(MemoryStore::new());
    let failing: Vec<String> = (0..10).map(|i| format!("bad-{i}")).collect();
    let script: Vec<(&str, u32)> = failing.iter().map(|u| (u.as_str(), u32::MAX)).collect();
    let delivery = Arc::new(ScriptedDelivery::failing(&script));
    let mut worker = NotificationWorker::new(
        config("bulk").with_max_retries(0),
        store.clone(),
        delivery.clone(),
    );
    worker.start().await.expect("worker starts");

    for i in 0..90 {
        worker
            .add_task(single(&format!("good-{i}")))
            .await
            .expect("submit");
    }
    for user in &failing {
        worker.add_task(single(user)).await.expect("submit");
    }

    let stats = wait_for_stats(&worker, Duration::from_secs(15), |s| s.terminal() == 100).await;
    worker.stop().await.expect("worker stops");

    assert_eq!(stats.delivered, 90);
    assert_eq!(stats.dead_lettered, 10);
    assert_eq!(stats.retried, 0);

    let manager = QueueManager::new(store.clone(), worker.config().keys.clone());
    let queues = manager.stats().await.unwrap();
    assert_eq!(queues.pending(), 0);
    assert_eq!(queues.dead_letter, 10);
}

#[tokio::test]
async fn test_requeued_dead_letter_is_delivered_again() {
    let store = Arc::new(MemoryStore::new());
    // Fails once, then succeeds: dead-lettered with no retries, then requeued.
    let delivery = Arc::new(ScriptedDelivery::failing(&[("second-chance", 1)]));
    let mut worker = NotificationWorker::new(
        config("requeue").with_max_retries(0),
        store.clone(),
        delivery.clone(),
    );
    worker.start().await.expect("worker starts");
    let manager = QueueManager::new(store.clone(), worker.config().keys.clone());

    worker
        .add_task(single("second-chance"))
        .await
        .expect("submit");
    wait_for_stats(&worker, Duration::from_secs(5), |s| s.dead_lettered == 1).await;

    let dead = manager.dead_letters(10).await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].attempt_count, 1);

    assert_eq!(manager.requeue_dead_letters(10).await.unwrap(), 1);
    let stats = wait_for_stats(&worker, Duration::from_secs(5), |s| s.delivered == 1).await;
    worker.stop().await.expect("worker stops");

    assert_eq!(stats.delivered, 1);
    assert_eq!(manager.stats().await.unwrap().dead_letter, 0);
}

#[tokio::test]
async fn test_invalid_entries_are_dropped_without_stalling() {
    let store = Arc::new(MemoryStore::new());
    let delivery = Arc::new(ScriptedDelivery::default());
    let mut worker = NotificationWorker::new(config("bad"), store.clone(), delivery.clone());

    store.push_back("bad:queue", "{not json").await.unwrap();
    let mismatched = serde_json::json!({
        "id": "mismatch-1",
        "type": "bulk",
        "notification": { "user_id": "u-1", "title": "t", "message": "m" },
    });
    store
        .push_back("bad:queue", &mismatched.to_string())
        .await
        .unwrap();
    worker.add_task(single("fine")).await.expect("submit");

    worker.start().await.expect("worker starts");
    let stats = wait_for_stats(&worker, Duration::from_secs(5), |s| {
        s.delivered == 1 && s.dropped == 2
    })
    .await;
    worker.stop().await.expect("worker stops");

    assert_eq!(stats.delivered, 1);
    assert_eq!(stats.dropped, 2);
    assert_eq!(delivery.calls("u-1"), 0);
    assert_eq!(store.len("bad:retry").await.unwrap(), 0);
    assert_eq!(store.len("bad:dead_letter").await.unwrap(), 0);
    assert_eq!(store.hash_len("bad:processing").await.unwrap(), 0);
}

#[tokio::test]
async fn test_lifecycle_and_registry() {
    let store = Arc::new(MemoryStore::new());
    let mut worker = NotificationWorker::new(
        config("life"),
        store.clone(),
        Arc::new(ScriptedDelivery::default()),
    );

    assert!(matches!(worker.stop().await, Err(WorkerError::NotRunning)));

    worker.start().await.expect("worker starts");
    assert!(worker.is_running());
    assert!(matches!(
        worker.start().await,
        Err(WorkerError::AlreadyRunning)
    ));

    let manager = QueueManager::new(store.clone(), worker.config().keys.clone());
    let workers = manager.workers().await.unwrap();
    assert_eq!(workers.len(), 1);
    assert_eq!(workers[0].worker_id, "worker-life");
    assert_eq!(workers[0].concurrency, 5);

    worker.stop().await.expect("worker stops");
    assert!(!worker.is_running());
    assert!(manager.workers().await.unwrap().is_empty());

    // A stopped worker can be started again.
    worker.start().await.expect("worker restarts");
    worker.stop().await.expect("worker stops again");
}

#[tokio::test]
async fn test_tasks_submitted_while_stopped_survive_in_store() {
    let store = Arc::new(MemoryStore::new());
    let delivery = Arc::new(ScriptedDelivery::default());
    let mut worker = NotificationWorker::new(config("idle"), store.clone(), delivery.clone());

    for user in ["a", "b", "c"] {
        worker.add_task(single(user)).await.expect("submit");
    }
    let queued = store.range("idle:queue", 0, -1).await.unwrap();
    assert_eq!(queued.len(), 3);
    let first = Task::from_json(&queued[0]).unwrap();
    assert_eq!(first.task_type, TaskType::Single);
    assert_eq!(first.max_retries, Some(3));

    worker.start().await.expect("worker starts");
    let stats = wait_for_stats(&worker, Duration::from_secs(5), |s| s.delivered == 3).await;
    worker.stop().await.expect("worker stops");

    assert_eq!(stats.delivered, 3);
}

#[tokio::test]
async fn test_purge_twice_leaves_empty_queues() {
    let store = Arc::new(MemoryStore::new());
    let manager = QueueManager::new(store.clone(), config("purge").keys);

    manager.submit(single("x"), 3).await.unwrap();
    manager
        .submit(
            single("y").with_scheduled_at(Utc::now() + chrono::Duration::hours(1)),
            3,
        )
        .await
        .unwrap();
    store.push_back("purge:dead_letter", "z").await.unwrap();

    manager.purge().await.unwrap();
    manager.purge().await.unwrap();

    let stats = manager.stats().await.unwrap();
    assert_eq!(stats.pending(), 0);
    assert_eq!(stats.dead_letter, 0);
}
