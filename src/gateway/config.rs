use std::time::Duration;

/// Tuning knobs for a gateway connection. The defaults are usable as-is;
/// tests shrink the timeouts and the cache.
#[derive(Clone, Debug)]
pub struct GatewayConfig {
    pub gateway_host: String,
    pub gateway_port: u16,

    /// timeout for establishing a transport, applied around the connector
    pub connect_timeout: Duration,
    /// timeout for writing one notification frame
    pub write_timeout: Duration,

    /// total attempts for one send, connection establishment included
    pub send_attempts: u32,
    /// delay between attempts. The first retry is immediate - a failed write
    /// usually just means the gateway already closed a poisoned connection.
    pub retry_delay: Duration,

    /// capacity of the sent-notification cache before it starts doubling
    pub initial_cache_capacity: usize,
    /// buffer of the event channel; resend sweeps publish bursts of events
    pub event_buffer_size: usize,
}

impl GatewayConfig {
    pub fn new(gateway_host: impl Into<String>, gateway_port: u16) -> GatewayConfig {
        GatewayConfig {
            gateway_host: gateway_host.into(),
            gateway_port,
            connect_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(10),
            send_attempts: 3,
            retry_delay: Duration::from_secs(1),
            initial_cache_capacity: 100,
            event_buffer_size: 1024,
        }
    }
}
