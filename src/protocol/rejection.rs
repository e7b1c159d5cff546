use anyhow::anyhow;
use bytes::{Buf, BufMut};
use num_enum::{FromPrimitive, IntoPrimitive};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::protocol::FrameError;

pub const REJECTION_COMMAND: u8 = 8;
pub const REJECTION_RECORD_LEN: usize = 6;

/// Status byte of a gateway rejection, mapped to the assigned code values.
/// Codes this client does not know map to [`Unknown`](RejectionCause::Unknown)
/// instead of failing: the protocol may introduce new ones.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, FromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum RejectionCause {
    /// sentinel the gateway defines but has not been observed to send
    NoError = 0,
    /// transient failure inside the gateway, the notification may succeed on resend
    ProcessingError = 1,
    MissingDeviceToken = 2,
    MissingTopic = 3,
    MissingPayload = 4,
    InvalidTokenSize = 5,
    InvalidTopicSize = 6,
    InvalidPayloadSize = 7,
    /// the token is well-formed but not known to the gateway
    InvalidToken = 8,
    /// the gateway is shutting down, the connection was closed deliberately
    Shutdown = 10,
    #[num_enum(default)]
    Unknown = 255,
}

/// The gateway's asynchronous rejection record. It arrives on the same
/// socket notifications are written to, at most once per connection: the
/// gateway closes the connection right after sending it, discarding
/// everything received after the rejected notification.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Rejection {
    pub cause: RejectionCause,
    pub notification_id: u32,
}

impl Rejection {
    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u8(REJECTION_COMMAND);
        buf.put_u8(self.cause.into());
        buf.put_u32(self.notification_id);
    }

    pub fn try_deser(buf: &mut impl Buf) -> Result<Rejection, FrameError> {
        let command = buf.try_get_u8().map_err(|_| FrameError::Truncated)?;
        if command != REJECTION_COMMAND {
            return Err(FrameError::UnexpectedCommand {
                expected: REJECTION_COMMAND,
                actual: command,
            });
        }
        let cause = RejectionCause::from(buf.try_get_u8().map_err(|_| FrameError::Truncated)?);
        let notification_id = buf.try_get_u32().map_err(|_| FrameError::Truncated)?;

        Ok(Rejection {
            cause,
            notification_id,
        })
    }
}

/// Outcome of waiting for a rejection record.
#[derive(Debug)]
pub enum RejectionRead {
    Record(Rejection),
    /// the remote closed the stream between records
    EndOfStream,
    Failed(anyhow::Error),
}

/// Reads the next rejection record, blocking until one arrives or the
/// stream ends. This is the only signal the protocol has for asynchronous
/// failures, so the caller is expected to keep one of these pending per
/// live connection.
pub async fn read_next<R: AsyncRead + Unpin>(reader: &mut R) -> RejectionRead {
    let mut buf = [0u8; REJECTION_RECORD_LEN];
    let mut filled = 0usize;

    while filled < REJECTION_RECORD_LEN {
        match reader.read(&mut buf[filled..]).await {
            Ok(0) if filled == 0 => return RejectionRead::EndOfStream,
            Ok(0) => {
                return RejectionRead::Failed(anyhow!(
                    "stream ended inside an error record, after {} of {} bytes",
                    filled,
                    REJECTION_RECORD_LEN
                ))
            }
            Ok(n) => filled += n,
            Err(e) => return RejectionRead::Failed(e.into()),
        }
    }

    match Rejection::try_deser(&mut &buf[..]) {
        Ok(rejection) => RejectionRead::Record(rejection),
        Err(e) => RejectionRead::Failed(e.into()),
    }
}
