//! notify-queue: durable notification delivery engine.
//!
//! This library provides an at-least-once task queue over Redis, a worker
//! that delivers queued notifications with bounded concurrency, retries with
//! exponential backoff, scheduled delivery and dead-letter handling, plus the
//! administrative operations used to inspect and repair the queues.

// Core modules
pub mod cli;
pub mod config;
pub mod delivery;
pub mod error;
pub mod manager;
pub mod metrics;
pub mod queue;
pub mod store;
pub mod task;
pub mod worker;

pub use config::{QueueKeys, WorkerConfig};
pub use delivery::{LogDelivery, NotificationDelivery};
pub use manager::{QueueManager, QueueStats};
pub use queue::{Placement, TaskQueue};
pub use store::{MemoryStore, QueueStore, RedisStore};
pub use task::{Channel, Priority, Task, TaskPayload, TaskType};
pub use worker::{CleanupReport, NotificationWorker, WorkerRecord, WorkerStats, WorkerStatus};

// Re-export commonly used error types
pub use error::{DeliveryError, StoreError, TaskError, WorkerError};
