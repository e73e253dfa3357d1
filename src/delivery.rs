//! Notification delivery adapter seam.
//!
//! The engine decides *when* a task runs; a [`NotificationDelivery`]
//! implementation decides *how* it is sent (SMTP, push, SMS, in-app). Any
//! error it returns is treated as transient and goes through retry.

use async_trait::async_trait;
use tracing::info;

use crate::error::DeliveryError;
use crate::task::{
    BulkNotificationRequest, NotificationRequest, SystemAnnouncementRequest, TaskPayload,
    TemplatedNotificationRequest,
};

/// Transport adapter invoked once per task attempt.
#[async_trait]
pub trait NotificationDelivery: Send + Sync {
    async fn send_single(&self, request: &NotificationRequest) -> Result<(), DeliveryError>;

    async fn send_bulk(&self, request: &BulkNotificationRequest) -> Result<(), DeliveryError>;

    async fn send_templated(
        &self,
        request: &TemplatedNotificationRequest,
    ) -> Result<(), DeliveryError>;

    async fn send_announcement(
        &self,
        request: &SystemAnnouncementRequest,
    ) -> Result<(), DeliveryError>;
}

/// Routes a payload to the matching adapter method.
pub async fn deliver(
    delivery: &dyn NotificationDelivery,
    payload: &TaskPayload,
) -> Result<(), DeliveryError> {
    match payload {
        TaskPayload::Single(request) => delivery.send_single(request).await,
        TaskPayload::Bulk(request) => delivery.send_bulk(request).await,
        TaskPayload::Templated(request) => delivery.send_templated(request).await,
        TaskPayload::Announcement(request) => delivery.send_announcement(request).await,
    }
}

/// Adapter that only logs what it would send. Used for dry runs.
#[derive(Debug, Clone, Default)]
pub struct LogDelivery;

#[async_trait]
impl NotificationDelivery for LogDelivery {
    async fn send_single(&self, request: &NotificationRequest) -> Result<(), DeliveryError> {
        info!(
            user_id = %request.user_id,
            title = %request.title,
            channels = ?request.channels,
            "Delivering notification"
        );
        Ok(())
    }

    async fn send_bulk(&self, request: &BulkNotificationRequest) -> Result<(), DeliveryError> {
        info!(
            recipients = request.user_ids.len(),
            title = %request.title,
            channels = ?request.channels,
            "Delivering bulk notification"
        );
        Ok(())
    }

    async fn send_templated(
        &self,
        request: &TemplatedNotificationRequest,
    ) -> Result<(), DeliveryError> {
        info!(
            user_id = %request.user_id,
            template_id = %request.template_id,
            variables = request.variables.len(),
            "Delivering templated notification"
        );
        Ok(())
    }

    async fn send_announcement(
        &self,
        request: &SystemAnnouncementRequest,
    ) -> Result<(), DeliveryError> {
        info!(
            title = %request.title,
            departments = ?request.department_ids,
            "Delivering system announcement"
        );
        Ok(())
    }
}
