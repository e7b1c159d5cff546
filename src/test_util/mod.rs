//! This module contains utilities for testing code against a push gateway
//!  without a network: a scriptable in-memory gateway, an event stream
//!  collector and a tracking sender. They are used for testing this crate
//!  itself, but they are also exported for application testing.

pub mod event_log;
pub mod stub_gateway;
pub mod tracking;

pub use event_log::EventLog;
pub use stub_gateway::{inject_rejection, read_notification, StubGateway};
pub use tracking::TrackingSender;
