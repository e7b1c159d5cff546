use tokio::sync::broadcast;
use tokio::sync::broadcast::error::TryRecvError;
use tokio::time::{timeout, Duration};

use crate::gateway::connection::GatewayConnection;
use crate::gateway::events::GatewayEvent;

/// Collects the event stream of a connection for later assertions.
pub struct EventLog {
    receiver: broadcast::Receiver<GatewayEvent>,
}

impl EventLog {
    pub fn subscribe(connection: &GatewayConnection) -> EventLog {
        EventLog {
            receiver: connection.subscribe(),
        }
    }

    /// The next event, or a panic if none arrives. The generous timeout only
    /// triggers on a hung test; under a paused clock it costs no wall time.
    pub async fn next(&mut self) -> GatewayEvent {
        timeout(Duration::from_secs(60), self.receiver.recv())
            .await
            .expect("timed out waiting for a gateway event")
            .expect("gateway event stream ended")
    }

    /// Collects events up to and including the first one matching `pred`.
    pub async fn collect_until(&mut self, pred: impl Fn(&GatewayEvent) -> bool) -> Vec<GatewayEvent> {
        let mut seen = Vec::new();
        loop {
            let event = self.next().await;
            let done = pred(&event);
            seen.push(event);
            if done {
                return seen;
            }
        }
    }

    /// Everything currently buffered, without waiting.
    pub fn try_drain(&mut self) -> Vec<GatewayEvent> {
        let mut seen = Vec::new();
        loop {
            match self.receiver.try_recv() {
                Ok(event) => seen.push(event),
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return seen,
                Err(TryRecvError::Lagged(n)) => panic!("event log lagged by {} events", n),
            }
        }
    }
}
