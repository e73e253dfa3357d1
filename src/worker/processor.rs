//! Task processors and per-task execution.
//!
//! Each processor loops over the shared main channel. Execution is bounded by
//! `processing_timeout`; a timeout is handled exactly like an adapter error.
//! A failure never escapes the task it belongs to.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{debug, error, info, warn};

use super::{SharedReceiver, Shutdown, WorkerContext};
use crate::delivery::deliver;
use crate::error::{DeliveryError, TaskError};
use crate::task::{Task, TaskType};

/// Main loop of one processor.
pub(crate) async fn run(
    index: usize,
    ctx: Arc<WorkerContext>,
    rx: SharedReceiver,
    mut shutdown: Shutdown,
) {
    debug!(worker_id = %ctx.worker_id(), processor = index, "Processor started");

    loop {
        let task = tokio::select! {
            biased;
            _ = shutdown.wait() => break,
            task = async { rx.lock().await.recv().await } => match task {
                Some(task) => task,
                None => break,
            },
        };

        ctx.process(task).await;
    }

    debug!(worker_id = %ctx.worker_id(), processor = index, "Processor stopped");
}

impl WorkerContext {
    /// Executes one task attempt and records its outcome.
    pub(crate) async fn process(&self, task: Task) {
        if let Err(e) = task.validate() {
            self.drop_task(&task, &e).await;
            return;
        }

        info!(
            worker_id = %self.worker_id(),
            task_id = %task.id,
            task_type = %task.task_type,
            attempt = task.attempt_count + 1,
            "Processing task"
        );

        let start_time = Instant::now();
        self.stats.increment_active();
        self.metrics.inc_active_workers();

        let result = self.execute_with_timeout(&task).await;
        let duration = start_time.elapsed();

        self.stats.decrement_active();
        self.metrics.dec_active_workers();

        match result {
            Ok(()) => self.complete(&task, duration).await,
            Err(e) => {
                self.stats.record_failure(duration);
                self.handle_failure(task, e.to_string(), duration).await;
            }
        }
    }

    async fn execute_with_timeout(&self, task: &Task) -> Result<(), DeliveryError> {
        let timeout = self.config.processing_timeout;
        match tokio::time::timeout(timeout, deliver(self.delivery.as_ref(), &task.payload)).await {
            Ok(result) => result,
            Err(_) => Err(DeliveryError::Timeout(timeout)),
        }
    }

    async fn complete(&self, task: &Task, duration: Duration) {
        self.stats.record_delivery(duration);
        self.metrics.record_task(
            "delivered",
            task.payload.base_type().as_str(),
            duration.as_secs_f64(),
        );

        if let Err(e) = self.queue.clear_processing(&task.id).await {
            error!(
                worker_id = %self.worker_id(),
                task_id = %task.id,
                error = %e,
                "Failed to clear processing entry"
            );
        }

        info!(
            worker_id = %self.worker_id(),
            task_id = %task.id,
            attempts = task.attempt_count + 1,
            duration_ms = duration.as_millis(),
            "Task delivered"
        );
    }

    /// Records a failed attempt, then re-queues the task for retry or moves
    /// it to the dead-letter list once its retries are exhausted. Returns
    /// false if the store rejected the move; the processing entry is then
    /// left in place for cleanup.
    pub(crate) async fn handle_failure(
        &self,
        mut task: Task,
        error: String,
        duration: Duration,
    ) -> bool {
        task.record_failure(error);
        let base_type = task.payload.base_type();

        if task.can_retry(self.config.max_retries) {
            task.task_type = TaskType::Retry;

            warn!(
                worker_id = %self.worker_id(),
                task_id = %task.id,
                attempt = task.attempt_count,
                error = ?task.last_error,
                "Task failed, queueing for retry"
            );

            if let Err(e) = self.queue.push_retry(&task).await {
                error!(
                    worker_id = %self.worker_id(),
                    task_id = %task.id,
                    error = %e,
                    "Failed to queue task for retry"
                );
                return false;
            }

            self.stats.record_retry();
            self.metrics
                .record_task("retried", base_type.as_str(), duration.as_secs_f64());
        } else {
            task.mark_dead_lettered(Utc::now());
            error!(
                worker_id = %self.worker_id(),
                task_id = %task.id,
                attempts = task.attempt_count,
                error = ?task.last_error,
                "Task failed, moving to dead letter queue"
            );

            if let Err(e) = self.queue.push_dead_letter(&task).await {
                error!(
                    worker_id = %self.worker_id(),
                    task_id = %task.id,
                    error = %e,
                    "Failed to move task to dead letter queue"
                );
                return false;
            }

            self.stats.record_dead_letter();
            self.metrics
                .record_task("dead_lettered", base_type.as_str(), duration.as_secs_f64());
        }

        if let Err(e) = self.queue.clear_processing(&task.id).await {
            warn!(task_id = %task.id, error = %e, "Failed to clear processing entry");
        }
        true
    }

    /// Discards a task that can never be processed.
    async fn drop_task(&self, task: &Task, reason: &TaskError) {
        error!(
            worker_id = %self.worker_id(),
            task_id = %task.id,
            task_type = %task.task_type,
            error = %reason,
            "Discarding task with invalid payload"
        );

        self.stats.record_drop();
        self.metrics
            .record_task("dropped", task.task_type.as_str(), 0.0);

        if let Err(e) = self.queue.clear_processing(&task.id).await {
            warn!(task_id = %task.id, error = %e, "Failed to clear processing entry");
        }
    }
}
