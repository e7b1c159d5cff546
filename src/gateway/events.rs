use tokio::sync::broadcast;
use tracing::trace;

use crate::protocol::notification::Notification;
use crate::protocol::rejection::RejectionCause;

/// Delivery-lifecycle events of one gateway connection. Subscribers see
/// them in publication order; they are best-effort notifications, and a
/// slow or crashing subscriber cannot affect the connection.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum GatewayEvent {
    /// fired immediately before each write attempt, fresh sends and resends alike
    StartSending(StartSendingData),
    MessageSent(MessageSentData),
    MessageSendFailed(MessageSendFailedData),
    /// the transport died, either with a decoded rejection record or without one
    ConnectionClosed(ConnectionClosedData),
    CacheLengthExceeded(CacheLengthExceededData),
    NotificationsResent(NotificationsResentData),
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StartSendingData {
    pub notification: Notification,
    pub resend: bool,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MessageSentData {
    pub notification: Notification,
    pub resend: bool,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MessageSendFailedData {
    pub notification: Notification,
    pub cause: SendFailureCause,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SendFailureCause {
    /// the gateway permanently refused this notification; it is not retried
    Rejected(RejectionCause),
    /// the transport failed and could not be re-established within the attempt budget
    ConnectionLost,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ConnectionClosedData {
    pub cause: RejectionCause,
    /// identifier from the rejection record, `None` if the connection died
    /// without one (clean end-of-stream or a read error)
    pub last_known_identifier: Option<u32>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CacheLengthExceededData {
    pub new_capacity: usize,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct NotificationsResentData {
    pub count: usize,
}

pub struct GatewayEventNotifier {
    sender: broadcast::Sender<GatewayEvent>,
}
impl GatewayEventNotifier {
    pub fn new(buffer: usize) -> GatewayEventNotifier {
        let (sender, _) = broadcast::channel(buffer);

        GatewayEventNotifier {
            sender
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.sender.subscribe()
    }

    pub fn send_event(&self, event: GatewayEvent) {
        trace!("event: {:?}", event);
        let _ = self.sender.send(event);
    }
}
