//! Error types for notify-queue operations.
//!
//! Defines error types for each subsystem of the delivery engine:
//! - Durable store access (Redis or in-memory)
//! - Task decoding and payload validation
//! - Notification delivery through the adapter
//! - Worker lifecycle management

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur while talking to the durable queue store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Failed to connect to the store.
    #[error("Store connection failed: {0}")]
    Connection(String),

    /// Redis command failed.
    #[error("Redis operation failed: {0}")]
    Redis(#[from] redis::RedisError),

    /// Failed to serialize or deserialize a stored record.
    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors describing a task that can never be processed.
///
/// These are not retried: there is no valid payload to reprocess.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("Failed to decode task: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Task type '{task_type}' does not match payload '{payload}'")]
    PayloadMismatch { task_type: String, payload: String },
}

/// Errors reported by a notification delivery adapter.
///
/// Every variant is treated as transient and goes through the retry policy.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("Transport failure: {0}")]
    Transport(String),

    #[error("Delivery rejected: {0}")]
    Rejected(String),

    #[error("processing timeout after {0:?}")]
    Timeout(Duration),
}

/// Errors that can occur while managing a notification worker.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// Worker is already running.
    #[error("Worker is already running")]
    AlreadyRunning,

    /// Worker is not running.
    #[error("Worker is not running")]
    NotRunning,

    /// Background loops did not stop in time.
    #[error("Shutdown timed out after {0:?}")]
    ShutdownTimeout(Duration),

    /// Store operation failed.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Failed to serialize a task.
    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}
