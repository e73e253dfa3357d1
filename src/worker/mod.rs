//! Notification worker: the asynchronous delivery engine.
//!
//! A worker process runs a set of cooperating loops over the durable store:
//!
//! - **Queue consumer**: pops the main and retry lists into bounded channels
//! - **Processors** (`concurrent_workers` of them): drain the main channel and
//!   invoke the delivery adapter under a per-task timeout
//! - **Retry processor**: waits out the backoff delay, then re-attempts
//! - **Scheduled processor**: promotes due tasks from the scheduled set
//! - **Heartbeat** and **cleanup**: worker registry, stuck-task and
//!   dead-letter maintenance
//!
//! # Architecture
//!
//! ```text
//!   add_task ──► main list ─┐                      ┌──► Processor 1 ─┐
//!          └──► scheduled ─►│ consumer ─► main ch ─┼──► Processor N ─┤──► delivered
//!                retry list ┘    │                                   │
//!                    ▲           └──────► retry ch ─► Retry proc. ───┤
//!                    └─────────────── failure (attempts left) ◄──────┘
//!                                     failure (exhausted) ──► dead letter
//! ```
//!
//! All loops stop on a shared shutdown signal. In-flight tasks get
//! `shutdown_timeout` to finish; tasks still buffered in channels are pushed
//! back to the head of their list.
//!
//! # Example
//!
//! ```rust,ignore
//! use notify_queue::{NotificationWorker, WorkerConfig, RedisStore, LogDelivery};
//! use std::sync::Arc;
//!
//! let store = Arc::new(RedisStore::connect("redis://localhost:6379").await?);
//! let config = WorkerConfig::with_generated_id("notifications").with_concurrent_workers(8);
//!
//! let mut worker = NotificationWorker::new(config, store, Arc::new(LogDelivery));
//! worker.start().await?;
//! // ...
//! worker.stop().await?;
//! ```

pub mod backoff;
mod consumer;
mod health;
mod processor;
mod retry;
mod scheduled;
mod stats;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{Interval, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::config::{WorkerConfig, MIN_LOOP_INTERVAL};
use crate::delivery::NotificationDelivery;
use crate::error::WorkerError;
use crate::metrics::MetricsCollector;
use crate::queue::TaskQueue;
use crate::store::QueueStore;
use crate::task::Task;

pub use self::health::{CleanupReport, WorkerRecord, WorkerStatus};
pub use self::stats::WorkerStats;

use self::stats::SharedStats;

type SharedReceiver = Arc<Mutex<mpsc::Receiver<Task>>>;

/// State shared by every loop of one worker.
pub(crate) struct WorkerContext {
    pub(crate) config: WorkerConfig,
    pub(crate) queue: TaskQueue,
    pub(crate) delivery: Arc<dyn NotificationDelivery>,
    pub(crate) stats: SharedStats,
    pub(crate) metrics: MetricsCollector,
}

impl WorkerContext {
    pub(crate) fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    /// Puts a popped task back at the head of its list and clears its
    /// processing entry. A task that cannot be returned is logged in full.
    pub(crate) async fn return_task(&self, lane: Lane, task: &Task) -> bool {
        let returned = match lane {
            Lane::Main => self.queue.return_main(task).await,
            Lane::Retry => self.queue.return_retry(task).await,
        };

        match returned {
            Ok(()) => {
                if let Err(e) = self.queue.clear_processing(&task.id).await {
                    warn!(task_id = %task.id, error = %e, "Failed to clear processing entry");
                }
                true
            }
            Err(e) => {
                error!(
                    task_id = %task.id,
                    lane = %lane,
                    error = %e,
                    task = ?task.to_json().ok(),
                    "Failed to return task to store"
                );
                false
            }
        }
    }
}

/// Interval for a periodic loop. Missed ticks are delayed, not bursted, and a
/// zero period is raised to [`MIN_LOOP_INTERVAL`].
pub(crate) fn loop_interval(period: Duration) -> Interval {
    let mut ticker = tokio::time::interval(period.max(MIN_LOOP_INTERVAL));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

/// The two store lists feeding the in-process pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Lane {
    Main,
    Retry,
}

impl std::fmt::Display for Lane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Lane::Main => write!(f, "main"),
            Lane::Retry => write!(f, "retry"),
        }
    }
}

/// Shutdown signal observed by the loops.
///
/// Backed by a watch channel so that loops subscribing late still see a
/// signal that was already sent.
#[derive(Clone)]
pub(crate) struct Shutdown(watch::Receiver<bool>);

impl Shutdown {
    pub(crate) fn is_signalled(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolves once shutdown is signalled or the sender is gone.
    pub(crate) async fn wait(&mut self) {
        let _ = self.0.wait_for(|stop| *stop).await;
    }
}

/// In-process channel ends, kept so stats can read depths and stop can drain.
struct Channels {
    main_tx: mpsc::Sender<Task>,
    main_rx: SharedReceiver,
    retry_tx: mpsc::Sender<Task>,
    retry_rx: SharedReceiver,
}

/// A notification worker process.
pub struct NotificationWorker {
    ctx: Arc<WorkerContext>,
    channels: Channels,
    shutdown_tx: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
    is_running: AtomicBool,
}

impl NotificationWorker {
    /// Creates a worker. Nothing runs until [`NotificationWorker::start`].
    pub fn new(
        config: WorkerConfig,
        store: Arc<dyn QueueStore>,
        delivery: Arc<dyn NotificationDelivery>,
    ) -> Self {
        let (main_tx, main_rx) = mpsc::channel(config.main_channel_capacity);
        let (retry_tx, retry_rx) = mpsc::channel(config.retry_channel_capacity);
        let (shutdown_tx, _) = watch::channel(false);
        let queue = TaskQueue::new(store, config.keys.clone());

        Self {
            ctx: Arc::new(WorkerContext {
                config,
                queue,
                delivery,
                stats: SharedStats::default(),
                metrics: MetricsCollector::new(),
            }),
            channels: Channels {
                main_tx,
                main_rx: Arc::new(Mutex::new(main_rx)),
                retry_tx,
                retry_rx: Arc::new(Mutex::new(retry_rx)),
            },
            shutdown_tx,
            handles: Vec::new(),
            is_running: AtomicBool::new(false),
        }
    }

    /// Registers the worker and spawns every loop.
    ///
    /// # Errors
    ///
    /// Returns `WorkerError::AlreadyRunning` if the worker is already running,
    /// or a store error if registration fails.
    pub async fn start(&mut self) -> Result<(), WorkerError> {
        if self.is_running.load(Ordering::SeqCst) {
            return Err(WorkerError::AlreadyRunning);
        }

        self.shutdown_tx.send_replace(false);
        let record =
            health::register(&self.ctx, WorkerStatus::Running, self.channel_depths()).await?;

        let shutdown = || Shutdown(self.shutdown_tx.subscribe());
        let ctx = &self.ctx;

        self.handles.push(tokio::spawn(consumer::run(
            Arc::clone(ctx),
            self.channels.main_tx.clone(),
            self.channels.retry_tx.clone(),
            shutdown(),
        )));

        for index in 0..ctx.config.concurrent_workers {
            self.handles.push(tokio::spawn(processor::run(
                index,
                Arc::clone(ctx),
                Arc::clone(&self.channels.main_rx),
                shutdown(),
            )));
        }

        self.handles.push(tokio::spawn(retry::run(
            Arc::clone(ctx),
            Arc::clone(&self.channels.retry_rx),
            shutdown(),
        )));

        self.handles.push(tokio::spawn(scheduled::run(
            Arc::clone(ctx),
            self.channels.main_tx.clone(),
            shutdown(),
        )));

        self.handles.push(tokio::spawn(health::run_heartbeat(
            Arc::clone(ctx),
            record,
            self.channels.main_tx.clone(),
            self.channels.retry_tx.clone(),
            shutdown(),
        )));

        self.handles.push(tokio::spawn(health::run_cleanup(
            Arc::clone(ctx),
            shutdown(),
        )));

        self.is_running.store(true, Ordering::SeqCst);
        info!(
            worker_id = %ctx.worker_id(),
            concurrent_workers = ctx.config.concurrent_workers,
            "Notification worker started"
        );

        Ok(())
    }

    /// Gracefully stops the worker.
    ///
    /// Signals every loop, waits up to `shutdown_timeout` for in-flight tasks,
    /// pushes buffered tasks back to the store and deregisters the worker.
    ///
    /// # Errors
    ///
    /// Returns `WorkerError::NotRunning` if the worker is not running, or
    /// `WorkerError::ShutdownTimeout` if loops had to be aborted. In the
    /// timeout case tasks may remain orphaned in the processing hash.
    pub async fn stop(&mut self) -> Result<(), WorkerError> {
        if !self.is_running.load(Ordering::SeqCst) {
            return Err(WorkerError::NotRunning);
        }

        info!(worker_id = %self.ctx.worker_id(), "Initiating notification worker shutdown");
        self.shutdown_tx.send_replace(true);

        let handles: Vec<JoinHandle<()>> = self.handles.drain(..).collect();
        let aborts: Vec<_> = handles.iter().map(JoinHandle::abort_handle).collect();
        let grace = self.ctx.config.shutdown_timeout;

        let timed_out = match tokio::time::timeout(grace, futures::future::join_all(handles)).await
        {
            Ok(results) => {
                for result in results {
                    if let Err(e) = result {
                        error!(error = %e, "Worker loop panicked during shutdown");
                    }
                }
                false
            }
            Err(_) => {
                warn!(
                    worker_id = %self.ctx.worker_id(),
                    timeout = ?grace,
                    "Shutdown grace period exceeded, aborting remaining loops"
                );
                for abort in aborts {
                    abort.abort();
                }
                true
            }
        };

        self.drain_channels().await;

        if let Err(e) = health::deregister(&self.ctx).await {
            warn!(worker_id = %self.ctx.worker_id(), error = %e, "Failed to deregister worker");
        }

        self.is_running.store(false, Ordering::SeqCst);

        if timed_out {
            return Err(WorkerError::ShutdownTimeout(grace));
        }

        info!(worker_id = %self.ctx.worker_id(), "Notification worker stopped");
        Ok(())
    }

    /// Submits a task to the durable store. Returns the task id.
    ///
    /// Fills in the id, and `max_retries` from the worker configuration, when
    /// unset. Does not require the worker to be running.
    pub async fn add_task(&self, task: Task) -> Result<String, WorkerError> {
        let (task, _) = self
            .ctx
            .queue
            .add_task(task, self.ctx.config.max_retries)
            .await?;
        Ok(task.id)
    }

    /// Returns a snapshot of this worker's state.
    pub fn stats(&self) -> WorkerStats {
        let (main_depth, retry_depth) = self.channel_depths();
        let mut stats = WorkerStats {
            worker_id: self.ctx.config.worker_id.clone(),
            running: self.is_running(),
            concurrent_workers: self.ctx.config.concurrent_workers,
            main_channel_depth: main_depth,
            main_channel_capacity: self.channels.main_tx.max_capacity(),
            retry_channel_depth: retry_depth,
            retry_channel_capacity: self.channels.retry_tx.max_capacity(),
            ..Default::default()
        };
        self.ctx.stats.fill(&mut stats);
        stats
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.ctx.config
    }

    /// Returns the queue client this worker uses.
    pub fn queue(&self) -> &TaskQueue {
        &self.ctx.queue
    }

    /// Runs one stuck-task and dead-letter sweep immediately.
    pub async fn cleanup_now(&self) -> CleanupReport {
        health::cleanup(&self.ctx).await
    }

    fn channel_depths(&self) -> (usize, usize) {
        (
            health::channel_depth(&self.channels.main_tx),
            health::channel_depth(&self.channels.retry_tx),
        )
    }

    /// Pushes buffered tasks back to the head of their lists, preserving order.
    async fn drain_channels(&self) {
        for (rx, lane) in [
            (&self.channels.main_rx, Lane::Main),
            (&self.channels.retry_rx, Lane::Retry),
        ] {
            let mut buffered = Vec::new();
            {
                let mut rx = rx.lock().await;
                while let Ok(task) = rx.try_recv() {
                    buffered.push(task);
                }
            }

            if buffered.is_empty() {
                continue;
            }
            info!(lane = %lane, count = buffered.len(), "Returning buffered tasks to store");

            for task in buffered.into_iter().rev() {
                self.ctx.return_task(lane, &task).await;
            }
        }
    }
}
