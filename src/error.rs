use thiserror::Error;

/// Errors surfaced by the send path.
///
/// Transport-level failures are retried internally and reach the caller only
/// as [`SendError::Connection`] once the attempt budget is exhausted. A
/// gateway-reported rejection is never returned from `send` - it arrives
/// asynchronously and is published as a
/// [`MessageSendFailed`](crate::gateway::events::GatewayEvent::MessageSendFailed)
/// event instead.
#[derive(Debug, Error)]
pub enum SendError {
    #[error("gateway connection failed after {attempts} attempts: {cause:#}")]
    Connection {
        attempts: u32,
        cause: anyhow::Error,
    },

    #[error("connection is closed")]
    Closed,

    #[error("dispatcher is not started")]
    NotStarted,
}
