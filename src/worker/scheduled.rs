//! Scheduled processor: promotes due tasks from the scheduled set.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::{loop_interval, Shutdown, WorkerContext};
use crate::error::StoreError;
use crate::queue::Popped;
use crate::task::Task;

pub(crate) async fn run(ctx: Arc<WorkerContext>, main_tx: mpsc::Sender<Task>, mut shutdown: Shutdown) {
    debug!(worker_id = %ctx.worker_id(), "Scheduled processor started");

    let mut ticker = loop_interval(ctx.config.scheduled_poll_interval);

    loop {
        tokio::select! {
            biased;
            _ = shutdown.wait() => break,
            _ = ticker.tick() => {
                if let Err(e) = promote_due(&ctx, &main_tx).await {
                    error!(worker_id = %ctx.worker_id(), error = %e, "Failed to promote scheduled tasks");
                }
            }
        }
    }

    debug!(worker_id = %ctx.worker_id(), "Scheduled processor stopped");
}

/// Moves every due scheduled task into the pipeline and returns how many
/// were promoted.
///
/// A promoted task takes back the type of its payload. When the main channel
/// is full it is appended to the main list instead. A member whose
/// `scheduled_at` is still ahead is put back in the set.
pub(crate) async fn promote_due(
    ctx: &WorkerContext,
    main_tx: &mpsc::Sender<Task>,
) -> Result<usize, StoreError> {
    let now = Utc::now();
    let due = ctx.queue.take_due(now).await?;
    let mut promoted = 0;

    for entry in due {
        let mut task = match entry {
            Popped::Task(task) => task,
            Popped::Malformed { raw, error } => {
                error!(error = %error, raw = %raw, "Discarding malformed scheduled task");
                ctx.stats.record_drop();
                ctx.metrics.record_task("dropped", "scheduled", 0.0);
                continue;
            }
        };

        if let Some(at) = task.scheduled_at.filter(|_| task.is_due_later(now)) {
            debug!(task_id = %task.id, scheduled_at = %at, "Scheduled task not due yet");
            if let Err(e) = ctx.queue.schedule(&task, at).await {
                error!(
                    task_id = %task.id,
                    error = %e,
                    task = ?task.to_json().ok(),
                    "Failed to put back scheduled task"
                );
            }
            continue;
        }
        task.task_type = task.payload.base_type();

        if let Err(e) = ctx.queue.mark_processing(&task, ctx.worker_id()).await {
            warn!(task_id = %task.id, error = %e, "Failed to record processing entry");
        }

        if let Err(send_error) = main_tx.try_send(task) {
            let task = send_error.into_inner();
            debug!(task_id = %task.id, "Main channel unavailable, queueing scheduled task");
            if let Err(e) = ctx.queue.push_main(&task).await {
                error!(
                    task_id = %task.id,
                    error = %e,
                    task = ?task.to_json().ok(),
                    "Failed to queue scheduled task"
                );
                continue;
            }
            if let Err(e) = ctx.queue.clear_processing(&task.id).await {
                warn!(task_id = %task.id, error = %e, "Failed to clear processing entry");
            }
        }

        promoted += 1;
    }

    if promoted > 0 {
        info!(worker_id = %ctx.worker_id(), count = promoted, "Promoted scheduled tasks");
    }

    Ok(promoted)
}
