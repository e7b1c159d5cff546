use std::sync::Arc;

use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::SendError;
use crate::gateway::connection::GatewayConnection;
use crate::protocol::notification::Notification;

/// Decouples callers from gateway latency: [`QueuedDispatcher::push`] hands
/// the notification to a background worker and returns immediately, and the
/// worker feeds the connection one notification at a time in arrival order.
///
/// Delivery outcomes surface on the connection's event stream, not on
/// `push`: by the time the gateway reports a rejection, the push call that
/// caused it has long returned.
#[derive(Debug)]
pub struct QueuedDispatcher {
    connection: Arc<GatewayConnection>,
    inner: Mutex<DispatcherInner>,
}

#[derive(Debug, Default)]
struct DispatcherInner {
    queue: Option<UnboundedSender<Notification>>,
    worker: Option<JoinHandle<()>>,
}

impl QueuedDispatcher {
    pub fn new(connection: Arc<GatewayConnection>) -> QueuedDispatcher {
        QueuedDispatcher {
            connection,
            inner: Mutex::new(Default::default()),
        }
    }

    /// The connection the worker feeds, e.g. for subscribing to its events.
    pub fn connection(&self) -> &Arc<GatewayConnection> {
        &self.connection
    }

    /// Starts the worker. Does nothing if it is already running.
    pub async fn start(&self) {
        let mut inner = self.inner.lock().await;
        if inner.queue.is_some() {
            warn!("dispatcher is already started");
            return;
        }

        let (tx, mut rx) = unbounded_channel::<Notification>();
        let connection = self.connection.clone();
        let worker = tokio::spawn(async move {
            debug!("dispatcher worker started");
            while let Some(notification) = rx.recv().await {
                if let Err(e) = connection.send(&notification).await {
                    // the failure is already on the event stream, there is
                    // no call site left to return it to
                    warn!("dispatch of {:?} failed: {}", notification, e);
                }
            }
            debug!("dispatcher worker drained and stopped");
        });

        inner.queue = Some(tx);
        inner.worker = Some(worker);
    }

    /// Enqueues a notification without waiting for the gateway.
    pub async fn push(&self, notification: Notification) -> Result<(), SendError> {
        let inner = self.inner.lock().await;
        match &inner.queue {
            Some(queue) => queue.send(notification).map_err(|_| SendError::Closed),
            None => Err(SendError::NotStarted),
        }
    }

    /// Stops accepting new notifications, lets the worker drain what is
    /// already queued, and waits for it to finish. The connection stays
    /// usable, a later [`QueuedDispatcher::start`] picks it up again.
    pub async fn stop(&self) {
        let worker = {
            let mut inner = self.inner.lock().await;
            inner.queue = None;
            inner.worker.take()
        };
        if let Some(worker) = worker {
            let _ = worker.await;
        }
    }
}
