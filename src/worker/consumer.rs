//! Queue consumer: moves tasks from the store lists into the in-process
//! channels.
//!
//! A list is only popped while its channel has room, so the store keeps
//! every task this worker cannot buffer. Blocking pops are never cancelled
//! mid-flight; shutdown is checked between iterations.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, error, warn};

use super::{Lane, Shutdown, WorkerContext};
use crate::queue::Popped;
use crate::task::Task;

pub(crate) async fn run(
    ctx: Arc<WorkerContext>,
    main_tx: mpsc::Sender<Task>,
    retry_tx: mpsc::Sender<Task>,
    mut shutdown: Shutdown,
) {
    debug!(worker_id = %ctx.worker_id(), "Queue consumer started");

    while !shutdown.is_signalled() {
        let mut found = false;

        for (lane, tx) in [(Lane::Main, &main_tx), (Lane::Retry, &retry_tx)] {
            if shutdown.is_signalled() {
                break;
            }
            if tx.capacity() == 0 {
                continue;
            }
            found |= consume_one(&ctx, lane, tx, &mut shutdown).await;
        }

        if !found {
            tokio::select! {
                _ = shutdown.wait() => break,
                _ = tokio::time::sleep(ctx.config.idle_backoff) => {}
            }
        }
    }

    debug!(worker_id = %ctx.worker_id(), "Queue consumer stopped");
}

/// Pops one entry from `lane` and hands it to `tx`. Returns whether
/// anything was popped.
async fn consume_one(
    ctx: &WorkerContext,
    lane: Lane,
    tx: &mpsc::Sender<Task>,
    shutdown: &mut Shutdown,
) -> bool {
    let list = match lane {
        Lane::Main => &ctx.config.keys.main,
        Lane::Retry => &ctx.config.keys.retry,
    };

    let popped = match ctx.queue.pop(list, ctx.config.pop_timeout).await {
        Ok(Some(popped)) => popped,
        Ok(None) => return false,
        Err(e) => {
            error!(worker_id = %ctx.worker_id(), lane = %lane, error = %e, "Failed to pop from queue");
            tokio::time::sleep(ctx.config.pop_timeout).await;
            return false;
        }
    };

    let task = match popped {
        Popped::Task(task) => task,
        Popped::Malformed { raw, error } => {
            error!(
                worker_id = %ctx.worker_id(),
                lane = %lane,
                error = %error,
                raw = %raw,
                "Discarding malformed task"
            );
            ctx.stats.record_drop();
            ctx.metrics.record_task("dropped", "unknown", 0.0);
            return true;
        }
    };

    if let Err(e) = ctx.queue.mark_processing(&task, ctx.worker_id()).await {
        warn!(task_id = %task.id, error = %e, "Failed to record processing entry");
    }

    match tx.try_send(task) {
        Ok(()) => {}
        Err(TrySendError::Full(task)) | Err(TrySendError::Closed(task)) => {
            debug!(task_id = %task.id, lane = %lane, "Channel unavailable, returning task");
            if !ctx.return_task(lane, &task).await {
                // The store refused it back; waiting for room keeps it in memory.
                let data = task.to_json().ok();
                let task_id = task.id.clone();
                let sent = tokio::select! {
                    sent = tx.send(task) => sent.is_ok(),
                    _ = shutdown.wait() => false,
                };
                if !sent {
                    error!(task_id = %task_id, lane = %lane, task = ?data, "Task lost");
                }
            }
        }
    }

    true
}
