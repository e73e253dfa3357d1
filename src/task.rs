//! Task definitions for the notification queue.
//!
//! This module defines the unit of work moved through the delivery engine:
//!
//! - `Task`: A queued notification job with retry bookkeeping
//! - `TaskType`: Tag describing how the task entered the pipeline
//! - `TaskPayload`: The notification request carried by the task
//! - `Priority`: Ordinal priority, used only to pace retries
//! - `ProcessingEntry`: Record kept in the processing hash while a task is in flight
//!
//! # Wire format
//!
//! A task is stored as a JSON object:
//!
//! ```json
//! {
//!   "id": "8c1f...",
//!   "type": "single",
//!   "notification": { "user_id": "u-1", "title": "Hi", "message": "..." },
//!   "priority": "medium",
//!   "created_at": "2024-01-01T00:00:00Z",
//!   "attempt_count": 0,
//!   "max_retries": 3
//! }
//! ```
//!
//! Exactly one of `notification`, `bulk_notification`, `templated_notification`
//! or `system_announcement` is present.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::TaskError;

/// How a task entered the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Single,
    Bulk,
    Templated,
    Announcement,
    /// Waiting in the scheduled set; executes as its payload.
    Scheduled,
    /// Re-attempt of a failed task; executes as its payload.
    Retry,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::Single => "single",
            TaskType::Bulk => "bulk",
            TaskType::Templated => "templated",
            TaskType::Announcement => "announcement",
            TaskType::Scheduled => "scheduled",
            TaskType::Retry => "retry",
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Task priority. Only affects retry pacing, never queue position.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Priority::Low => write!(f, "low"),
            Priority::Medium => write!(f, "medium"),
            Priority::High => write!(f, "high"),
            Priority::Critical => write!(f, "critical"),
        }
    }
}

/// Channels a notification may be delivered through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    InApp,
    Email,
    Push,
    Sms,
}

fn default_channels() -> Vec<Channel> {
    vec![Channel::InApp]
}

/// A notification addressed to one user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationRequest {
    pub user_id: String,
    pub title: String,
    pub message: String,
    #[serde(default = "default_channels")]
    pub channels: Vec<Channel>,
    /// Arbitrary data forwarded to the transport (deep links, ids, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl NotificationRequest {
    pub fn new(
        user_id: impl Into<String>,
        title: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            title: title.into(),
            message: message.into(),
            channels: default_channels(),
            data: None,
        }
    }

    pub fn with_channels(mut self, channels: Vec<Channel>) -> Self {
        self.channels = channels;
        self
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// The same notification sent to many users.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BulkNotificationRequest {
    pub user_ids: Vec<String>,
    pub title: String,
    pub message: String,
    #[serde(default = "default_channels")]
    pub channels: Vec<Channel>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

/// A notification rendered from a stored template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplatedNotificationRequest {
    pub user_id: String,
    pub template_id: String,
    #[serde(default)]
    pub variables: HashMap<String, serde_json::Value>,
    #[serde(default = "default_channels")]
    pub channels: Vec<Channel>,
}

/// A company-wide or department-wide announcement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemAnnouncementRequest {
    pub title: String,
    pub message: String,
    /// Empty means every user.
    #[serde(default)]
    pub department_ids: Vec<String>,
    #[serde(default = "default_channels")]
    pub channels: Vec<Channel>,
}

/// The request carried by a task. Serialized under its own field name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TaskPayload {
    #[serde(rename = "notification")]
    Single(NotificationRequest),
    #[serde(rename = "bulk_notification")]
    Bulk(BulkNotificationRequest),
    #[serde(rename = "templated_notification")]
    Templated(TemplatedNotificationRequest),
    #[serde(rename = "system_announcement")]
    Announcement(SystemAnnouncementRequest),
}

impl TaskPayload {
    /// The immediate task type that matches this payload.
    pub fn base_type(&self) -> TaskType {
        match self {
            TaskPayload::Single(_) => TaskType::Single,
            TaskPayload::Bulk(_) => TaskType::Bulk,
            TaskPayload::Templated(_) => TaskType::Templated,
            TaskPayload::Announcement(_) => TaskType::Announcement,
        }
    }

    /// Wire field name of the payload.
    pub fn field_name(&self) -> &'static str {
        match self {
            TaskPayload::Single(_) => "notification",
            TaskPayload::Bulk(_) => "bulk_notification",
            TaskPayload::Templated(_) => "templated_notification",
            TaskPayload::Announcement(_) => "system_announcement",
        }
    }
}

/// A notification job moving through the queues.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier. Assigned on submission when empty.
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type")]
    pub task_type: TaskType,
    #[serde(flatten)]
    pub payload: TaskPayload,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub attempt_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Retry ceiling. `None` until submission fills in the worker default.
    #[serde(default)]
    pub max_retries: Option<u32>,
    /// When the task was moved to the dead-letter list.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dead_lettered_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Creates a task whose type matches the payload.
    pub fn new(payload: TaskPayload) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            task_type: payload.base_type(),
            payload,
            priority: Priority::default(),
            created_at: Utc::now(),
            scheduled_at: None,
            attempt_count: 0,
            last_error: None,
            max_retries: None,
            dead_lettered_at: None,
        }
    }

    pub fn single(request: NotificationRequest) -> Self {
        Self::new(TaskPayload::Single(request))
    }

    pub fn bulk(request: BulkNotificationRequest) -> Self {
        Self::new(TaskPayload::Bulk(request))
    }

    pub fn templated(request: TemplatedNotificationRequest) -> Self {
        Self::new(TaskPayload::Templated(request))
    }

    pub fn announcement(request: SystemAnnouncementRequest) -> Self {
        Self::new(TaskPayload::Announcement(request))
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(at);
        self
    }

    /// Returns whether the task must still wait at `now`.
    pub fn is_due_later(&self, now: DateTime<Utc>) -> bool {
        self.scheduled_at.is_some_and(|at| at > now)
    }

    /// Checks that the type tag agrees with the payload.
    ///
    /// `scheduled` and `retry` tasks execute as whatever payload they carry.
    pub fn validate(&self) -> Result<&TaskPayload, TaskError> {
        match self.task_type {
            TaskType::Scheduled | TaskType::Retry => Ok(&self.payload),
            declared if declared == self.payload.base_type() => Ok(&self.payload),
            declared => Err(TaskError::PayloadMismatch {
                task_type: declared.to_string(),
                payload: self.payload.field_name().to_string(),
            }),
        }
    }

    /// Records a failed attempt.
    pub fn record_failure(&mut self, error: impl Into<String>) {
        self.attempt_count += 1;
        self.last_error = Some(error.into());
    }

    /// Returns whether another attempt is allowed after the recorded failures.
    pub fn can_retry(&self, default_max_retries: u32) -> bool {
        self.attempt_count <= self.max_retries.unwrap_or(default_max_retries)
    }

    /// Stamps the moment the task gave up retrying.
    pub fn mark_dead_lettered(&mut self, at: DateTime<Utc>) {
        self.dead_lettered_at = Some(at);
    }

    /// Start of the dead-letter retention window. Entries written before the
    /// stamp existed fall back to their creation time.
    pub fn dead_letter_since(&self) -> DateTime<Utc> {
        self.dead_lettered_at.unwrap_or(self.created_at)
    }

    /// Clears failure state and restores the base type. Used by dead-letter requeue.
    pub fn reset_for_requeue(&mut self) {
        self.attempt_count = 0;
        self.last_error = None;
        self.dead_lettered_at = None;
        self.task_type = self.payload.base_type();
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(data: &str) -> Result<Self, TaskError> {
        Ok(serde_json::from_str(data)?)
    }
}

/// Bookkeeping stored in the processing hash while a task is in flight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingEntry {
    #[serde(rename = "type")]
    pub task_type: TaskType,
    pub worker_id: String,
    pub started_at: DateTime<Utc>,
    /// Serialized task, so a stalled entry can be resubmitted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<String>,
}

impl ProcessingEntry {
    pub fn new(task: &Task, worker_id: impl Into<String>) -> Self {
        Self {
            task_type: task.task_type,
            worker_id: worker_id.into(),
            started_at: Utc::now(),
            task: task.to_json().ok(),
        }
    }
}
