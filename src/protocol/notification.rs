use std::fmt::{Debug, Formatter};

use anyhow::anyhow;
use bytes::{Buf, BufMut, Bytes};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::protocol::FrameError;

pub const NOTIFICATION_COMMAND: u8 = 2;
pub const DEVICE_TOKEN_LEN: usize = 32;

const FRAME_DEVICE_TOKEN: u8 = 1;
const FRAME_PAYLOAD: u8 = 2;
const FRAME_IDENTIFIER: u8 = 3;
const FRAME_EXPIRY: u8 = 4;
const FRAME_PRIORITY: u8 = 5;

/// A device's push token: 32 raw bytes, usually handled as 64 hex digits.
/// The token is opaque to the client - the gateway rejects tokens it does
/// not recognize, the client only enforces the length.
#[derive(Clone, Copy, Eq, PartialEq, Hash)]
pub struct DeviceToken([u8; DEVICE_TOKEN_LEN]);

impl DeviceToken {
    pub fn new(bytes: [u8; DEVICE_TOKEN_LEN]) -> DeviceToken {
        DeviceToken(bytes)
    }

    pub fn from_hex(hex_digits: &str) -> anyhow::Result<DeviceToken> {
        let bytes = hex::decode(hex_digits)?;
        let bytes: [u8; DEVICE_TOKEN_LEN] = bytes
            .try_into()
            .map_err(|_| anyhow!("device token must be {} hex digits", 2 * DEVICE_TOKEN_LEN))?;
        Ok(DeviceToken(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; DEVICE_TOKEN_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    #[cfg(test)]
    pub fn for_test(unique: u8) -> DeviceToken {
        DeviceToken([unique; DEVICE_TOKEN_LEN])
    }
}

impl Debug for DeviceToken {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Delivery priority, one fixed byte value per variant on the wire.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum Priority {
    /// deliver as soon as the gateway can
    Immediate = 10,
    /// the gateway may batch delivery to conserve the device's power
    PowerConserving = 5,
}

/// An immutable push notification. Built once (normally by
/// [`PushService`](crate::gateway::service::PushService), which assigns the
/// identifier), serialized deterministically, and kept in the sent cache
/// until the resend protocol no longer needs it.
#[derive(Clone, Eq, PartialEq, Hash)]
pub struct Notification {
    pub identifier: u32,
    pub expiry: u32,
    pub device_token: DeviceToken,
    pub payload: Bytes,
    pub priority: Priority,
}

impl Notification {
    /// expiry sentinel: the gateway should never discard the notification as stale
    pub const NEVER_EXPIRES: u32 = u32::MAX;

    pub fn new(
        identifier: u32,
        expiry: u32,
        device_token: DeviceToken,
        payload: impl Into<Bytes>,
        priority: Priority,
    ) -> Notification {
        Notification {
            identifier,
            expiry,
            device_token,
            payload: payload.into(),
            priority,
        }
    }

    fn frames_len(&self) -> usize {
        3 + DEVICE_TOKEN_LEN + 3 + self.payload.len() + 3 + 4 + 3 + 4 + 3 + 1
    }

    /// Serializes as `command || frameLength || frames`, each frame being
    /// `frameId:1 || fieldLength:2 || fieldData`. Frames are written in a
    /// fixed order; [`try_deser`](Notification::try_deser) accepts any order.
    pub fn ser(&self, buf: &mut impl BufMut) {
        debug_assert!(self.payload.len() <= u16::MAX as usize);

        buf.put_u8(NOTIFICATION_COMMAND);
        buf.put_u32(self.frames_len() as u32);

        buf.put_u8(FRAME_DEVICE_TOKEN);
        buf.put_u16(DEVICE_TOKEN_LEN as u16);
        buf.put_slice(&self.device_token.0);

        buf.put_u8(FRAME_PAYLOAD);
        buf.put_u16(self.payload.len() as u16);
        buf.put_slice(&self.payload);

        buf.put_u8(FRAME_IDENTIFIER);
        buf.put_u16(4);
        buf.put_u32(self.identifier);

        buf.put_u8(FRAME_EXPIRY);
        buf.put_u16(4);
        buf.put_u32(self.expiry);

        buf.put_u8(FRAME_PRIORITY);
        buf.put_u16(1);
        buf.put_u8(self.priority.into());
    }

    pub fn try_deser(buf: &mut impl Buf) -> Result<Notification, FrameError> {
        let command = buf.try_get_u8().map_err(|_| FrameError::Truncated)?;
        if command != NOTIFICATION_COMMAND {
            return Err(FrameError::UnexpectedCommand {
                expected: NOTIFICATION_COMMAND,
                actual: command,
            });
        }

        let frames_len = buf.try_get_u32().map_err(|_| FrameError::Truncated)? as usize;
        if buf.remaining() < frames_len {
            return Err(FrameError::Truncated);
        }
        let mut frames = buf.copy_to_bytes(frames_len);

        let mut device_token = None;
        let mut payload = None;
        let mut identifier = 0;
        let mut expiry = 0;
        let mut priority = Priority::Immediate;

        while frames.has_remaining() {
            let frame_id = frames.try_get_u8().map_err(|_| FrameError::Truncated)?;
            let len = frames.try_get_u16().map_err(|_| FrameError::Truncated)? as usize;
            if frames.remaining() < len {
                return Err(FrameError::Truncated);
            }

            match frame_id {
                FRAME_DEVICE_TOKEN => {
                    if len != DEVICE_TOKEN_LEN {
                        return Err(FrameError::BadFrameLength { frame: frame_id, len });
                    }
                    let mut token = [0u8; DEVICE_TOKEN_LEN];
                    frames.copy_to_slice(&mut token);
                    device_token = Some(DeviceToken(token));
                }
                FRAME_PAYLOAD => {
                    payload = Some(frames.copy_to_bytes(len));
                }
                FRAME_IDENTIFIER => {
                    if len != 4 {
                        return Err(FrameError::BadFrameLength { frame: frame_id, len });
                    }
                    identifier = frames.get_u32();
                }
                FRAME_EXPIRY => {
                    if len != 4 {
                        return Err(FrameError::BadFrameLength { frame: frame_id, len });
                    }
                    expiry = frames.get_u32();
                }
                FRAME_PRIORITY => {
                    if len != 1 {
                        return Err(FrameError::BadFrameLength { frame: frame_id, len });
                    }
                    // the gateway treats unassigned priority values as 'immediate', so do we
                    priority = Priority::try_from(frames.get_u8()).unwrap_or(Priority::Immediate);
                }
                _ => {
                    // unknown frames are skipped: the protocol may add new ones
                    frames.advance(len);
                }
            }
        }

        let device_token = device_token.ok_or(FrameError::MissingFrame("device token"))?;
        let payload = payload.ok_or(FrameError::MissingFrame("payload"))?;

        Ok(Notification {
            identifier,
            expiry,
            device_token,
            payload,
            priority,
        })
    }
}

impl Debug for Notification {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Notification{{{}:{:?}:{}}}",
            self.identifier,
            self.device_token,
            String::from_utf8_lossy(&self.payload),
        )
    }
}
