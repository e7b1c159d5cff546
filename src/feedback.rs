use std::fmt::Debug;
use std::sync::Arc;

use anyhow::{bail, Context};
use async_trait::async_trait;
use bytes::Buf;
#[cfg(test)] use mockall::automock;
use rustc_hash::FxHashMap;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::debug;

use crate::gateway::transport::GatewayConnector;
use crate::protocol::notification::{DeviceToken, DEVICE_TOKEN_LEN};

/// Device tokens the gateway considers permanently gone, with the epoch
/// seconds at which each device was last seen.
pub type InactiveDevices = FxHashMap<DeviceToken, u32>;

/// The feedback collaborator: a separate, short-lived connection queried
/// once per call.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait FeedbackSource: Debug + Send + Sync + 'static {
    async fn fetch_inactive_devices(&self) -> anyhow::Result<InactiveDevices>;
}

/// Reads feedback records until the remote closes the stream. Each record
/// is `lastSeen:4 || tokenLength:2 || token:tokenLength`, big-endian. End
/// of stream is only legal between records.
pub async fn read_inactive_devices<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> anyhow::Result<InactiveDevices> {
    let mut devices = InactiveDevices::default();

    loop {
        let mut header = [0u8; 6];
        let mut filled = 0usize;
        while filled < header.len() {
            match reader.read(&mut header[filled..]).await? {
                0 if filled == 0 => return Ok(devices),
                0 => bail!("stream ended inside a feedback record header"),
                n => filled += n,
            }
        }

        let mut header = &header[..];
        let last_seen = header.get_u32();
        let token_len = header.get_u16() as usize;
        if token_len != DEVICE_TOKEN_LEN {
            bail!("feedback record has unexpected token length {}", token_len);
        }

        let mut token = [0u8; DEVICE_TOKEN_LEN];
        reader
            .read_exact(&mut token)
            .await
            .context("stream ended inside a feedback record token")?;

        devices.insert(DeviceToken::new(token), last_seen);
    }
}

/// One-shot feedback reader over a connector. The connector points at the
/// feedback endpoint, which is not the notification gateway's.
#[derive(Debug)]
pub struct FeedbackConnection {
    connector: Arc<dyn GatewayConnector>,
}

impl FeedbackConnection {
    pub fn new(connector: Arc<dyn GatewayConnector>) -> FeedbackConnection {
        FeedbackConnection { connector }
    }
}

#[async_trait]
impl FeedbackSource for FeedbackConnection {
    async fn fetch_inactive_devices(&self) -> anyhow::Result<InactiveDevices> {
        let mut stream = self.connector.connect().await?;
        let devices = read_inactive_devices(&mut stream).await?;
        debug!("feedback service reported {} inactive devices", devices.len());
        Ok(devices)
    }
}

#[cfg(test)]
mod test {
    use tokio::io::{duplex, AsyncWriteExt};

    use crate::gateway::transport::{GatewayStream, MockGatewayConnector};

    use super::*;

    fn record(last_seen: u32, token: &DeviceToken) -> Vec<u8> {
        let mut raw = Vec::new();
        raw.extend_from_slice(&last_seen.to_be_bytes());
        raw.extend_from_slice(&(DEVICE_TOKEN_LEN as u16).to_be_bytes());
        raw.extend_from_slice(token.as_bytes());
        raw
    }

    #[tokio::test]
    async fn test_read_inactive_devices() {
        let mut raw = record(1000, &DeviceToken::for_test(1));
        raw.extend(record(2000, &DeviceToken::for_test(2)));

        let devices = read_inactive_devices(&mut &raw[..]).await.unwrap();
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[&DeviceToken::for_test(1)], 1000);
        assert_eq!(devices[&DeviceToken::for_test(2)], 2000);
    }

    #[tokio::test]
    async fn test_read_inactive_devices_empty_stream() {
        let devices = read_inactive_devices(&mut &b""[..]).await.unwrap();
        assert!(devices.is_empty());
    }

    #[tokio::test]
    async fn test_read_fails_on_partial_header() {
        let raw = [0u8, 0, 3];
        assert!(read_inactive_devices(&mut &raw[..]).await.is_err());
    }

    #[tokio::test]
    async fn test_read_fails_on_partial_token() {
        let mut raw = record(1000, &DeviceToken::for_test(1));
        raw.truncate(20);
        assert!(read_inactive_devices(&mut &raw[..]).await.is_err());
    }

    #[tokio::test]
    async fn test_read_fails_on_unexpected_token_length() {
        let raw = [0u8, 0, 0, 1, 0, 16];
        assert!(read_inactive_devices(&mut &raw[..]).await.is_err());
    }

    #[tokio::test]
    async fn test_fetch_over_connector() {
        let (client, mut server) = duplex(4096);
        server
            .write_all(&record(1234, &DeviceToken::for_test(9)))
            .await
            .unwrap();
        drop(server);

        let mut connector = MockGatewayConnector::new();
        connector
            .expect_connect()
            .return_once(move || Ok(Box::new(client) as Box<dyn GatewayStream>));

        let feedback = FeedbackConnection::new(Arc::new(connector));
        let devices = feedback.fetch_inactive_devices().await.unwrap();
        assert_eq!(devices[&DeviceToken::for_test(9)], 1234);
    }
}
