use std::fmt::Debug;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use anyhow::bail;
use async_trait::async_trait;
use bytes::Bytes;
#[cfg(test)] use mockall::automock;

use crate::error::SendError;
use crate::feedback::{FeedbackSource, InactiveDevices};
use crate::gateway::connection::GatewayConnection;
use crate::gateway::dispatcher::QueuedDispatcher;
use crate::protocol::notification::{DeviceToken, Notification, Priority};

/// Anything that can move a finished notification towards the gateway. The
/// connection sends on the caller's time, the queued dispatcher on its own.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait NotificationSender: Debug + Send + Sync + 'static {
    async fn send(&self, notification: &Notification) -> Result<(), SendError>;
}

#[async_trait]
impl NotificationSender for GatewayConnection {
    async fn send(&self, notification: &Notification) -> Result<(), SendError> {
        GatewayConnection::send(self, notification).await
    }
}

#[async_trait]
impl NotificationSender for QueuedDispatcher {
    async fn send(&self, notification: &Notification) -> Result<(), SendError> {
        self.push(notification.clone()).await
    }
}

/// The application-facing surface: builds notifications, assigns their
/// identifiers and hands them to the configured sender.
///
/// Identifiers only need to be unique within one connection's sent cache,
/// and service instances never share a connection, so the counter lives
/// here rather than in process-global state. The first assigned identifier
/// is 1; 0 never appears on the wire and stays recognizable as "no
/// identifier" in gateway logs.
#[derive(Debug)]
pub struct PushService {
    sender: Arc<dyn NotificationSender>,
    feedback: Option<Arc<dyn FeedbackSource>>,
    next_identifier: AtomicU32,
}

impl PushService {
    pub fn new(
        sender: Arc<dyn NotificationSender>,
        feedback: Option<Arc<dyn FeedbackSource>>,
    ) -> PushService {
        PushService {
            sender,
            feedback,
            next_identifier: AtomicU32::new(0),
        }
    }

    fn assign_identifier(&self) -> u32 {
        self.next_identifier.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Sends `payload` to one device, never expiring, at immediate priority.
    /// Returns the notification as built, identifier included, so the caller
    /// can correlate it with later delivery events.
    pub async fn push(
        &self,
        device_token: DeviceToken,
        payload: impl Into<Bytes>,
    ) -> Result<Notification, SendError> {
        self.push_with(device_token, payload, Notification::NEVER_EXPIRES, Priority::Immediate)
            .await
    }

    /// Like [`PushService::push`] with explicit expiry and priority.
    pub async fn push_with(
        &self,
        device_token: DeviceToken,
        payload: impl Into<Bytes>,
        expiry: u32,
        priority: Priority,
    ) -> Result<Notification, SendError> {
        let notification = Notification::new(
            self.assign_identifier(),
            expiry,
            device_token,
            payload,
            priority,
        );
        self.sender.send(&notification).await?;
        Ok(notification)
    }

    /// Fans one payload out to many devices. Every device gets its own
    /// notification and identifier; the first send error aborts the rest.
    pub async fn push_to_all(
        &self,
        device_tokens: &[DeviceToken],
        payload: impl Into<Bytes>,
    ) -> Result<Vec<Notification>, SendError> {
        let payload = payload.into();
        let mut sent = Vec::with_capacity(device_tokens.len());
        for &device_token in device_tokens {
            let notification = self
                .push_with(device_token, payload.clone(), Notification::NEVER_EXPIRES, Priority::Immediate)
                .await?;
            sent.push(notification);
        }
        Ok(sent)
    }

    /// Asks the feedback service which devices stopped accepting
    /// notifications, with the moment the gateway last saw each of them.
    pub async fn inactive_devices(&self) -> anyhow::Result<InactiveDevices> {
        match &self.feedback {
            Some(feedback) => feedback.fetch_inactive_devices().await,
            None => bail!("no feedback source is configured"),
        }
    }
}
