//! The stateful side of the crate: a recovering connection to the push
//! gateway, the cache of sent-but-unconfirmed notifications backing its
//! resend logic, and the event stream through which delivery failures are
//! reported (the gateway never acknowledges success, it only reports the
//! first failure and hangs up).

pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod events;
pub mod sent_cache;
pub mod service;
pub mod transport;
