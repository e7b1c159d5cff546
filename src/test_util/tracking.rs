use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::SendError;
use crate::gateway::service::NotificationSender;
use crate::protocol::notification::Notification;

/// Records every notification handed to it, in order, without a gateway
/// behind it.
#[derive(Debug)]
pub struct TrackingSender {
    tracker: RwLock<Vec<Notification>>,
}
impl TrackingSender {
    pub fn new() -> TrackingSender {
        TrackingSender {
            tracker: Default::default(),
        }
    }

    pub async fn sent(&self) -> Vec<Notification> {
        self.tracker.read().await.clone()
    }

    pub async fn assert_sent_identifiers(&self, expected: &[u32]) {
        let actual: Vec<u32> = self.tracker.read().await.iter().map(|n| n.identifier).collect();
        assert_eq!(actual, expected);
    }
}

#[async_trait]
impl NotificationSender for TrackingSender {
    async fn send(&self, notification: &Notification) -> Result<(), SendError> {
        self.tracker.write().await.push(notification.clone());
        Ok(())
    }
}
