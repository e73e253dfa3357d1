//! Retry processor.
//!
//! Every task taken from the retry channel waits out its backoff delay in a
//! spawned task, bounded by a semaphore of `concurrent_workers` permits, and
//! is then processed like any other attempt. A delay interrupted by shutdown
//! pushes the task back to the head of the retry list.

use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info};

use super::backoff;
use super::{Lane, SharedReceiver, Shutdown, WorkerContext};
use crate::task::Task;

pub(crate) async fn run(ctx: Arc<WorkerContext>, rx: SharedReceiver, mut shutdown: Shutdown) {
    debug!(worker_id = %ctx.worker_id(), "Retry processor started");

    let semaphore = Arc::new(Semaphore::new(ctx.config.concurrent_workers));
    let mut pending = JoinSet::new();

    loop {
        let task = tokio::select! {
            biased;
            _ = shutdown.wait() => break,
            Some(result) = pending.join_next(), if !pending.is_empty() => {
                if let Err(e) = result {
                    error!(error = %e, "Retry attempt panicked");
                }
                continue;
            }
            task = async { rx.lock().await.recv().await } => match task {
                Some(task) => task,
                None => break,
            },
        };

        let permit = tokio::select! {
            biased;
            _ = shutdown.wait() => {
                ctx.return_task(Lane::Retry, &task).await;
                break;
            }
            permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let task_ctx = Arc::clone(&ctx);
        let signal = shutdown.clone();
        pending.spawn(async move {
            delayed_retry(&task_ctx, task, signal).await;
            drop(permit);
        });
    }

    while let Some(result) = pending.join_next().await {
        if let Err(e) = result {
            error!(error = %e, "Retry attempt panicked");
        }
    }

    debug!(worker_id = %ctx.worker_id(), "Retry processor stopped");
}

async fn delayed_retry(ctx: &WorkerContext, task: Task, mut shutdown: Shutdown) {
    let delay = backoff::retry_delay(ctx.config.retry_delay, task.attempt_count, task.priority);

    info!(
        worker_id = %ctx.worker_id(),
        task_id = %task.id,
        attempt = task.attempt_count,
        delay_ms = delay.as_millis(),
        "Scheduling retry"
    );

    tokio::select! {
        _ = shutdown.wait() => {
            debug!(task_id = %task.id, "Retry delay interrupted by shutdown");
            ctx.return_task(Lane::Retry, &task).await;
        }
        _ = tokio::time::sleep(delay) => {
            ctx.process(task).await;
        }
    }
}
