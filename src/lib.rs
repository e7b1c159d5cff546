//! Client for a push gateway speaking the legacy binary notification
//!  protocol, with the recovery logic that protocol forces on its clients.
//!
//! ## The gateway's failure model
//!
//! The gateway never acknowledges success. It accepts notification frames
//!  silently and reports only the first failure on a connection: a single
//!  6-byte rejection record naming the offending notification's identifier,
//!  after which it drops the connection and discards everything that
//!  arrived after the rejected frame. A naive client silently loses every
//!  notification it wrote between the bad one and noticing the hangup.
//!
//! This crate's answer is the sent cache: every notification written to the
//!  wire stays cached as sent-but-unconfirmed. When a rejection record
//!  arrives, the notifications after the rejected one are resent in their
//!  original order over a fresh connection, and only then are the entries
//!  up to the rejected one discarded. Applications observe sends, resends,
//!  rejections and connection loss through a single broadcast event stream
//!  instead of return values, because the gateway reports failures long
//!  after the send call that caused them has returned.
//!
//! ## Wire format
//!
//! Notification frame (all numbers in network byte order, BE):
//! ```ascii
//! 0: command (u8) - always 2
//! 1: frame length (u32) - length of the item list that follows
//! 5: item list, per item:
//!      item id (u8)
//!      item length (u16)
//!      item data
//! ```
//! The items are the 32-byte device token (1), the payload (2), the
//!  notification identifier (3), the expiry timestamp (4) and the
//!  priority (5).
//!
//! Rejection record, the only thing the gateway ever writes back:
//! ```ascii
//! 0: command (u8) - always 8
//! 1: status code (u8)
//! 2: rejected notification's identifier (u32)
//! ```
//!
//! The feedback service is a separate endpoint that streams records of
//!  devices which stopped accepting notifications, then closes:
//! ```ascii
//! 0: last seen, seconds since the epoch (u32)
//! 4: token length (u16) - always 32
//! 6: device token
//! ```
//!
//! ## Entry points
//!
//! * [`gateway::service::PushService`] builds notifications and assigns
//!    their identifiers
//! * [`gateway::connection::GatewayConnection`] owns the wire and the
//!    resend logic
//! * [`gateway::dispatcher::QueuedDispatcher`] decouples callers from
//!    gateway latency
//! * [`feedback`] fetches the inactive-device list

pub mod error;
pub mod feedback;
pub mod gateway;
pub mod protocol;
pub mod test_util;

#[cfg(test)]
mod tests {
    use tracing::Level;

    #[ctor::ctor(unsafe)]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(Level::DEBUG)
            .try_init()
            .ok();
    }
}
