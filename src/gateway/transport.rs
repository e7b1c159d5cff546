use std::fmt::Debug;

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use crate::gateway::config::GatewayConfig;

/// A bidirectional byte stream to the gateway.
pub trait GatewayStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> GatewayStream for T {}

/// Produces a fresh transport to the gateway endpoint, once per (re)connect.
///
/// This is the seam where TLS lives: the connection logic is
/// transport-agnostic, and an application talking to an encrypted gateway
/// supplies a connector that performs its handshake here. The connection
/// applies its own connect timeout around this call.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait GatewayConnector: Debug + Send + Sync + 'static {
    async fn connect(&self) -> anyhow::Result<Box<dyn GatewayStream>>;
}

/// Plain TCP connector, for unencrypted gateways and local testing.
#[derive(Debug)]
pub struct TcpConnector {
    host: String,
    port: u16,
}

impl TcpConnector {
    pub fn new(config: &GatewayConfig) -> TcpConnector {
        TcpConnector {
            host: config.gateway_host.clone(),
            port: config.gateway_port,
        }
    }
}

#[async_trait]
impl GatewayConnector for TcpConnector {
    async fn connect(&self) -> anyhow::Result<Box<dyn GatewayStream>> {
        let stream = TcpStream::connect((self.host.as_str(), self.port)).await?;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }
}

#[cfg(test)]
mod test {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use super::*;

    #[tokio::test]
    async fn test_tcp_connector() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let connector = TcpConnector::new(&GatewayConfig::new("127.0.0.1", port));
        let mut stream = connector.connect().await.unwrap();

        let (mut accepted, _) = listener.accept().await.unwrap();
        stream.write_all(b"ping").await.unwrap();

        let mut buf = [0u8; 4];
        accepted.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn test_tcp_connector_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let connector = TcpConnector::new(&GatewayConfig::new("127.0.0.1", port));
        assert!(connector.connect().await.is_err());
    }
}
