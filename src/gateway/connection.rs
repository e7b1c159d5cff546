use std::sync::Arc;

use anyhow::anyhow;
use bytes::BytesMut;
use tokio::io::{split, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, trace, warn};

use crate::error::SendError;
use crate::gateway::config::GatewayConfig;
use crate::gateway::events::{
    CacheLengthExceededData, ConnectionClosedData, GatewayEvent, GatewayEventNotifier,
    MessageSendFailedData, MessageSentData, NotificationsResentData, SendFailureCause,
    StartSendingData,
};
use crate::gateway::sent_cache::SentNotificationCache;
use crate::gateway::transport::{GatewayConnector, GatewayStream};
use crate::protocol::notification::Notification;
use crate::protocol::rejection::{read_next, Rejection, RejectionCause, RejectionRead};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnectionState {
    Disconnected,
    Connected,
    Reconnecting,
    /// terminal, entered by [`GatewayConnection::close`]
    Closed,
}

/// A connection to the push gateway with automatic recovery.
///
/// The gateway reports failures asynchronously and destructively: it accepts
/// frames silently, and on the first bad one it writes a single rejection
/// record back and drops the connection, discarding every frame that arrived
/// after the rejected one. The client has no way to tell which of those later
/// frames were processed, so this connection keeps everything it wrote in the
/// sent cache and, on a rejection, rewrites all notifications after the
/// failure point in their original order. Order matters: the gateway
/// correlates a second failure by identifier against its arrival sequence.
///
/// Exactly one background listener task per live transport waits for the
/// rejection record (the transport's only inbound traffic). On reconnect the
/// listener is replaced, never duplicated: a replaced listener is cancelled
/// while parked, and one that already read a rejection finishes its recovery
/// under the connection lock, tagged with the transport generation it
/// belongs to so it cannot tear down a newer transport.
pub struct GatewayConnection {
    shared: Arc<ConnectionShared>,
}

struct ConnectionShared {
    config: GatewayConfig,
    connector: Arc<dyn GatewayConnector>,
    events: GatewayEventNotifier,
    cache: Mutex<SentNotificationCache>,
    inner: Mutex<ConnectionInner>,
    cancel_listener: broadcast::Sender<()>,
}

struct ConnectionInner {
    state: ConnectionState,
    /// bumped on every established transport
    generation: u64,
    writer: Option<WriteHalf<Box<dyn GatewayStream>>>,
    listener: Option<JoinHandle<()>>,
}

impl GatewayConnection {
    pub fn new(config: GatewayConfig, connector: Arc<dyn GatewayConnector>) -> GatewayConnection {
        let (cancel_listener, _) = broadcast::channel(1);
        let events = GatewayEventNotifier::new(config.event_buffer_size);

        GatewayConnection {
            shared: Arc::new(ConnectionShared {
                cache: Mutex::new(SentNotificationCache::new(config.initial_cache_capacity)),
                config,
                connector,
                events,
                inner: Mutex::new(ConnectionInner {
                    state: ConnectionState::Disconnected,
                    generation: 0,
                    writer: None,
                    listener: None,
                }),
                cancel_listener,
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.shared.events.subscribe()
    }

    pub async fn state(&self) -> ConnectionState {
        self.shared.inner.lock().await.state
    }

    /// Writes one notification to the gateway, connecting or reconnecting as
    /// needed within the configured attempt budget. Concurrent callers are
    /// serialized; a recovery in progress finishes its resend sweep before
    /// any new send gets through.
    pub async fn send(&self, notification: &Notification) -> Result<(), SendError> {
        let mut inner = self.shared.inner.lock().await;
        self.shared.send_locked(&mut inner, notification, false).await
    }

    /// Idempotent. Cancels the error listener, drops the transport, and
    /// makes all further sends fail with [`SendError::Closed`].
    pub async fn close(&self) {
        let listener = {
            let mut inner = self.shared.inner.lock().await;
            if inner.state == ConnectionState::Closed {
                return;
            }
            inner.state = ConnectionState::Closed;
            let _ = self.shared.cancel_listener.send(());
            inner.writer = None;
            inner.listener.take()
        };

        if let Some(handle) = listener {
            let _ = handle.await;
        }
        info!("gateway connection closed");
    }
}

impl std::fmt::Debug for GatewayConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "GatewayConnection({}:{})",
            self.shared.config.gateway_host, self.shared.config.gateway_port
        )
    }
}

impl ConnectionShared {
    async fn send_locked(
        self: &Arc<Self>,
        inner: &mut ConnectionInner,
        notification: &Notification,
        resend: bool,
    ) -> Result<(), SendError> {
        if inner.state == ConnectionState::Closed {
            return Err(SendError::Closed);
        }

        self.events.send_event(GatewayEvent::StartSending(StartSendingData {
            notification: notification.clone(),
            resend,
        }));

        let mut frame = BytesMut::new();
        notification.ser(&mut frame);

        match self.write_with_retries(inner, &frame).await {
            Ok(()) => {
                debug!(identifier = notification.identifier, resend, "notification written to gateway");
                if !resend {
                    self.record_in_cache(notification).await;
                }
                self.events.send_event(GatewayEvent::MessageSent(MessageSentData {
                    notification: notification.clone(),
                    resend,
                }));
                Ok(())
            }
            Err(e) => {
                error!("giving up on sending {:?}: {}", notification, e);
                if !resend {
                    // sent-but-unconfirmed: an attempt may have reached the
                    // wire, keep it recoverable by a later resend sweep
                    self.record_in_cache(notification).await;
                }
                self.events.send_event(GatewayEvent::MessageSendFailed(MessageSendFailedData {
                    notification: notification.clone(),
                    cause: SendFailureCause::ConnectionLost,
                }));
                Err(e)
            }
        }
    }

    async fn record_in_cache(&self, notification: &Notification) {
        let grown = self.cache.lock().await.record(notification.clone());
        if let Some(new_capacity) = grown {
            self.events.send_event(GatewayEvent::CacheLengthExceeded(CacheLengthExceededData {
                new_capacity,
            }));
        }
    }

    async fn write_with_retries(
        self: &Arc<Self>,
        inner: &mut ConnectionInner,
        frame: &[u8],
    ) -> Result<(), SendError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.try_write(inner, frame).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(attempt, "write to gateway failed: {:#}", e);
                    self.drop_transport(inner);
                    if attempt >= self.config.send_attempts {
                        inner.state = ConnectionState::Disconnected;
                        return Err(SendError::Connection { attempts: attempt, cause: e });
                    }
                    inner.state = ConnectionState::Reconnecting;
                    // no delay before the second attempt: the most common
                    // failure is the gateway having closed a poisoned
                    // connection, and a fresh one fixes that immediately
                    if attempt > 1 {
                        sleep(self.config.retry_delay).await;
                    }
                }
            }
        }
    }

    async fn try_write(self: &Arc<Self>, inner: &mut ConnectionInner, frame: &[u8]) -> anyhow::Result<()> {
        self.ensure_transport(inner).await?;
        let writer = inner.writer.as_mut().expect("transport was just established");

        timeout(self.config.write_timeout, async {
            writer.write_all(frame).await?;
            writer.flush().await
        })
        .await
        .map_err(|_| anyhow!("write timed out after {:?}", self.config.write_timeout))??;

        Ok(())
    }

    async fn ensure_transport(self: &Arc<Self>, inner: &mut ConnectionInner) -> anyhow::Result<()> {
        if inner.writer.is_some() {
            return Ok(());
        }

        debug!(
            "connecting to gateway {}:{}",
            self.config.gateway_host, self.config.gateway_port
        );
        let stream = timeout(self.config.connect_timeout, self.connector.connect())
            .await
            .map_err(|_| anyhow!("connect timed out after {:?}", self.config.connect_timeout))??;
        let (read_half, write_half) = split(stream);

        inner.generation += 1;
        inner.writer = Some(write_half);
        inner.listener = Some(self.spawn_error_listener(read_half, inner.generation));
        inner.state = ConnectionState::Connected;
        info!(generation = inner.generation, "gateway connection established");

        Ok(())
    }

    fn drop_transport(&self, inner: &mut ConnectionInner) {
        if inner.writer.take().is_some() {
            trace!(generation = inner.generation, "dropping dead transport");
        }
        // a listener parked on the dead transport exits on this signal; one
        // that is already mid-recovery ignores it and re-checks the
        // generation under the lock instead
        let _ = self.cancel_listener.send(());
        inner.listener = None;
    }

    fn spawn_error_listener(
        self: &Arc<Self>,
        read_half: ReadHalf<Box<dyn GatewayStream>>,
        generation: u64,
    ) -> JoinHandle<()> {
        let shared = self.clone();
        let mut cancel = self.cancel_listener.subscribe();

        tokio::spawn(async move {
            let mut reader = read_half;
            trace!(generation, "error listener started");
            let outcome = tokio::select! {
                outcome = read_next(&mut reader) => outcome,
                _ = cancel.recv() => {
                    trace!(generation, "error listener cancelled");
                    return;
                }
            };
            shared.handle_connection_failure(generation, outcome).await;
        })
    }

    /// Runs in the listener task once its transport produced a rejection
    /// record, end-of-stream or a read error. The remote side drops the
    /// connection in all three cases, so the transport is gone; what remains
    /// is deciding whether there is a resend set to replay.
    async fn handle_connection_failure(self: &Arc<Self>, generation: u64, outcome: RejectionRead) {
        let mut inner = self.inner.lock().await;
        if inner.state == ConnectionState::Closed {
            return;
        }

        let stale = inner.generation != generation;
        if !stale {
            self.drop_transport(&mut inner);
            inner.state = ConnectionState::Disconnected;
        }

        match outcome {
            RejectionRead::Record(rejection) => {
                info!(
                    identifier = rejection.notification_id,
                    "gateway rejected a notification ({:?}) and dropped the connection",
                    rejection.cause
                );
                self.events.send_event(GatewayEvent::ConnectionClosed(ConnectionClosedData {
                    cause: rejection.cause,
                    last_known_identifier: Some(rejection.notification_id),
                }));
                self.reconcile_and_resend(&mut inner, rejection).await;
            }
            _ if stale => {
                // raced with a sender-side reconnect; nothing rejected, and
                // the replacement transport is not ours to touch
                trace!(generation, "stale error listener exiting");
            }
            RejectionRead::EndOfStream => {
                info!("gateway closed the connection without a rejection record");
                self.events.send_event(GatewayEvent::ConnectionClosed(ConnectionClosedData {
                    cause: RejectionCause::Unknown,
                    last_known_identifier: None,
                }));
            }
            RejectionRead::Failed(e) => {
                warn!("error listener read failed: {:#}", e);
                self.events.send_event(GatewayEvent::ConnectionClosed(ConnectionClosedData {
                    cause: RejectionCause::Unknown,
                    last_known_identifier: None,
                }));
            }
        }
    }

    async fn reconcile_and_resend(self: &Arc<Self>, inner: &mut ConnectionInner, rejection: Rejection) {
        let (rejected, resend_set) = {
            let mut cache = self.cache.lock().await;
            let rejected = cache.get(rejection.notification_id).cloned();
            let resend_set = cache.resend_set_after(rejection.notification_id);
            cache.discard_up_to(rejection.notification_id);
            (rejected, resend_set)
        };

        if let Some(notification) = rejected {
            // the gateway has permanently refused this one, it is not resent
            self.events.send_event(GatewayEvent::MessageSendFailed(MessageSendFailedData {
                notification,
                cause: SendFailureCause::Rejected(rejection.cause),
            }));
        }

        debug!("resending {} notifications sent after the rejected one", resend_set.len());
        for notification in &resend_set {
            if let Err(e) = self.send_locked(inner, notification, true).await {
                // still cached, the next recovery picks it up again
                warn!("resend of {:?} failed: {}", notification, e);
            }
        }

        self.events.send_event(GatewayEvent::NotificationsResent(NotificationsResentData {
            count: resend_set.len(),
        }));
    }
}

#[cfg(test)]
mod test {
    use rstest::rstest;
    use tokio::time::Duration;

    use crate::protocol::notification::{DeviceToken, Priority};
    use crate::test_util::{inject_rejection, read_notification, EventLog, StubGateway};

    use super::*;

    fn test_config() -> GatewayConfig {
        let mut config = GatewayConfig::new("gateway.test", 2195);
        config.retry_delay = Duration::from_millis(100);
        config
    }

    fn notification(identifier: u32) -> Notification {
        Notification::new(
            identifier,
            Notification::NEVER_EXPIRES,
            DeviceToken::for_test(identifier as u8),
            format!("{{\"n\":{}}}", identifier).into_bytes(),
            Priority::Immediate,
        )
    }

    fn connection_with(config: GatewayConfig) -> (GatewayConnection, Arc<StubGateway>, EventLog) {
        let stub = StubGateway::new();
        let connection = GatewayConnection::new(config, stub.clone());
        let events = EventLog::subscribe(&connection);
        (connection, stub, events)
    }

    fn sent_identifiers(events: &[GatewayEvent], resend: bool) -> Vec<u32> {
        events
            .iter()
            .filter_map(|e| match e {
                GatewayEvent::MessageSent(data) if data.resend == resend => {
                    Some(data.notification.identifier)
                }
                _ => None,
            })
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_writes_frame_and_caches() {
        let (connection, stub, mut events) = connection_with(test_config());

        let n = notification(1);
        connection.send(&n).await.unwrap();

        assert_eq!(connection.state().await, ConnectionState::Connected);
        assert_eq!(connection.shared.cache.lock().await.len(), 1);

        let mut stream = stub.take_stream(0).await;
        assert_eq!(read_notification(&mut stream).await, n);

        assert_eq!(
            events.try_drain(),
            vec![
                GatewayEvent::StartSending(StartSendingData { notification: n.clone(), resend: false }),
                GatewayEvent::MessageSent(MessageSentData { notification: n, resend: false }),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_five_sends_are_all_fresh() {
        let (connection, _stub, mut events) = connection_with(test_config());

        for id in 1..=5 {
            connection.send(&notification(id)).await.unwrap();
        }

        let seen = events.try_drain();
        assert_eq!(sent_identifiers(&seen, false), vec![1, 2, 3, 4, 5]);
        assert_eq!(sent_identifiers(&seen, true), Vec::<u32>::new());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejection_triggers_ordered_resend() {
        let (connection, stub, mut events) = connection_with(test_config());

        for id in 1..=13 {
            connection.send(&notification(id)).await.unwrap();
        }

        inject_rejection(stub.take_stream(0).await, RejectionCause::InvalidToken, 6).await;

        let seen = events
            .collect_until(|e| matches!(e, GatewayEvent::NotificationsResent(_)))
            .await;

        assert!(seen.contains(&GatewayEvent::ConnectionClosed(ConnectionClosedData {
            cause: RejectionCause::InvalidToken,
            last_known_identifier: Some(6),
        })));

        let failed: Vec<_> = seen
            .iter()
            .filter_map(|e| match e {
                GatewayEvent::MessageSendFailed(data) => Some(data.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].notification.identifier, 6);
        assert_eq!(failed[0].cause, SendFailureCause::Rejected(RejectionCause::InvalidToken));

        assert_eq!(sent_identifiers(&seen, true), vec![7, 8, 9, 10, 11, 12, 13]);
        assert!(seen.contains(&GatewayEvent::NotificationsResent(NotificationsResentData { count: 7 })));

        let starts = |resend: bool| {
            seen.iter()
                .filter(|e| matches!(e, GatewayEvent::StartSending(data) if data.resend == resend))
                .count()
        };
        assert_eq!(starts(false), 13);
        assert_eq!(starts(true), 7);

        // the replacement transport carries exactly the resend set, in order
        let mut stream = stub.take_stream(1).await;
        for id in 7..=13 {
            assert_eq!(read_notification(&mut stream).await.identifier, id);
        }

        let cache = connection.shared.cache.lock().await;
        assert_eq!(cache.len(), 7);
        assert!(cache.get(6).is_none());
        assert!(cache.get(7).is_some());
    }

    #[rstest]
    #[case::rejected_last_nothing_to_resend(3, vec![], 1)]
    #[case::unknown_identifier_resends_everything(99, vec![1, 2, 3], 0)]
    #[tokio::test(start_paused = true)]
    async fn test_rejection_edge_cases(
        #[case] rejected_id: u32,
        #[case] expected_resent: Vec<u32>,
        #[case] expected_failed: usize,
    ) {
        let (connection, stub, mut events) = connection_with(test_config());

        for id in 1..=3 {
            connection.send(&notification(id)).await.unwrap();
        }

        inject_rejection(stub.take_stream(0).await, RejectionCause::ProcessingError, rejected_id).await;

        let seen = events
            .collect_until(|e| matches!(e, GatewayEvent::NotificationsResent(_)))
            .await;

        assert_eq!(sent_identifiers(&seen, true), expected_resent);
        let failed = seen
            .iter()
            .filter(|e| matches!(e, GatewayEvent::MessageSendFailed(_)))
            .count();
        assert_eq!(failed, expected_failed);
        assert!(seen.contains(&GatewayEvent::NotificationsResent(NotificationsResentData {
            count: expected_resent.len(),
        })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_growth_fires_one_event() {
        let mut config = test_config();
        config.initial_cache_capacity = 100;
        let (connection, _stub, mut events) = connection_with(config);

        for id in 1..=101 {
            connection.send(&notification(id)).await.unwrap();
        }

        let growth: Vec<_> = events
            .try_drain()
            .into_iter()
            .filter_map(|e| match e {
                GatewayEvent::CacheLengthExceeded(data) => Some(data.new_capacity),
                _ => None,
            })
            .collect();
        assert_eq!(growth, vec![200]);
        assert_eq!(connection.shared.cache.lock().await.len(), 101);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_retries_until_a_connect_succeeds() {
        let (connection, stub, mut events) = connection_with(test_config());
        stub.refuse_next_connects(2).await;

        let n = notification(1);
        connection.send(&n).await.unwrap();

        assert_eq!(stub.connect_count().await, 3);
        // the frame on the surviving transport is byte-identical to a
        // first-attempt send
        let mut stream = stub.take_stream(0).await;
        assert_eq!(read_notification(&mut stream).await, n);
        assert_eq!(sent_identifiers(&events.try_drain(), false), vec![1]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_fails_after_exhausted_attempts() {
        let (connection, stub, mut events) = connection_with(test_config());
        stub.refuse_next_connects(3).await;

        let result = connection.send(&notification(1)).await;
        assert!(matches!(result, Err(SendError::Connection { attempts: 3, .. })));
        assert_eq!(connection.state().await, ConnectionState::Disconnected);

        // kept as sent-but-unconfirmed for a later resend opportunity
        assert_eq!(connection.shared.cache.lock().await.len(), 1);

        let seen = events.try_drain();
        assert!(seen.iter().any(|e| matches!(
            e,
            GatewayEvent::MessageSendFailed(MessageSendFailedData {
                cause: SendFailureCause::ConnectionLost,
                ..
            })
        )));
    }

    #[tokio::test(start_paused = true)]
    async fn test_end_of_stream_reconnects_without_resend() {
        let (connection, stub, mut events) = connection_with(test_config());

        connection.send(&notification(1)).await.unwrap();
        drop(stub.take_stream(0).await);

        let closed = events
            .collect_until(|e| matches!(e, GatewayEvent::ConnectionClosed(_)))
            .await;
        assert!(closed.contains(&GatewayEvent::ConnectionClosed(ConnectionClosedData {
            cause: RejectionCause::Unknown,
            last_known_identifier: None,
        })));
        assert_eq!(connection.state().await, ConnectionState::Disconnected);

        // the next send dials a fresh transport, nothing is resent
        connection.send(&notification(2)).await.unwrap();
        assert_eq!(stub.connect_count().await, 2);

        let seen = events.try_drain();
        assert_eq!(sent_identifiers(&seen, true), Vec::<u32>::new());
        assert_eq!(sent_identifiers(&seen, false), vec![2]);
        assert_eq!(connection.shared.cache.lock().await.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_is_idempotent_and_permanent() {
        let (connection, _stub, mut events) = connection_with(test_config());

        connection.send(&notification(1)).await.unwrap();
        events.try_drain();

        connection.close().await;
        connection.close().await;

        assert_eq!(connection.state().await, ConnectionState::Closed);
        assert!(matches!(connection.send(&notification(2)).await, Err(SendError::Closed)));
        assert_eq!(events.try_drain(), vec![]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_before_first_send() {
        let (connection, stub, _events) = connection_with(test_config());

        connection.close().await;
        assert!(matches!(connection.send(&notification(1)).await, Err(SendError::Closed)));
        assert_eq!(stub.connect_count().await, 0);
    }
}
