use std::sync::Arc;

use anyhow::bail;
use async_trait::async_trait;
use bytes::BytesMut;
use tokio::io::{duplex, AsyncRead, AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::Mutex;
use tokio::time::{sleep, Duration};

use crate::gateway::transport::{GatewayConnector, GatewayStream};
use crate::protocol::notification::Notification;
use crate::protocol::rejection::{Rejection, RejectionCause};

/// A gateway on the near end of an in-memory pipe. Tests script its connect
/// behavior up front and then drive the server side of each accepted
/// connection directly: reading the frames a client wrote, writing rejection
/// records, or hanging up.
#[derive(Debug)]
pub struct StubGateway {
    state: Mutex<StubState>,
}

#[derive(Debug, Default)]
struct StubState {
    /// connect attempts, including refused ones
    connect_count: u32,
    refuse_remaining: u32,
    connect_delay: Option<Duration>,
    server_streams: Vec<Option<DuplexStream>>,
}

impl StubGateway {
    pub fn new() -> Arc<StubGateway> {
        Arc::new(StubGateway {
            state: Mutex::new(Default::default()),
        })
    }

    /// The next `n` connect attempts fail as if the gateway refused them.
    pub async fn refuse_next_connects(&self, n: u32) {
        self.state.lock().await.refuse_remaining = n;
    }

    /// Every subsequent connect attempt completes only after `delay`.
    pub async fn delay_connects(&self, delay: Duration) {
        self.state.lock().await.connect_delay = Some(delay);
    }

    pub async fn connect_count(&self) -> u32 {
        self.state.lock().await.connect_count
    }

    /// Removes and returns the server end of the `index`th successfully
    /// accepted connection. Panics if that connection was never established
    /// or was already taken.
    pub async fn take_stream(&self, index: usize) -> DuplexStream {
        self.state
            .lock()
            .await
            .server_streams
            .get_mut(index)
            .and_then(|slot| slot.take())
            .unwrap_or_else(|| panic!("no server stream at index {}", index))
    }
}

#[async_trait]
impl GatewayConnector for StubGateway {
    async fn connect(&self) -> anyhow::Result<Box<dyn GatewayStream>> {
        let delay = {
            let mut state = self.state.lock().await;
            state.connect_count += 1;
            if state.refuse_remaining > 0 {
                state.refuse_remaining -= 1;
                bail!("stub gateway refused the connection");
            }
            state.connect_delay
        };
        if let Some(delay) = delay {
            sleep(delay).await;
        }

        let (client, server) = duplex(1 << 20);
        self.state.lock().await.server_streams.push(Some(server));
        Ok(Box::new(client))
    }
}

/// Writes a rejection record the way the gateway reports a bad notification,
/// then hangs up by dropping the server end.
pub async fn inject_rejection(mut stream: DuplexStream, cause: RejectionCause, notification_id: u32) {
    let mut buf = BytesMut::new();
    Rejection { cause, notification_id }.ser(&mut buf);
    stream.write_all(&buf).await.unwrap();
    stream.flush().await.unwrap();
}

/// Reads one notification frame off the wire, the way the gateway parses its
/// inbound traffic.
pub async fn read_notification<R: AsyncRead + Unpin>(reader: &mut R) -> Notification {
    let mut header = [0u8; 5];
    reader.read_exact(&mut header).await.unwrap();
    let frame_len = u32::from_be_bytes([header[1], header[2], header[3], header[4]]) as usize;
    let mut body = vec![0u8; frame_len];
    reader.read_exact(&mut body).await.unwrap();

    let mut buf = BytesMut::new();
    buf.extend_from_slice(&header);
    buf.extend_from_slice(&body);
    Notification::try_deser(&mut buf).unwrap()
}
