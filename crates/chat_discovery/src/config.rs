use std::time::Duration;

use chat_proto::DEFAULT_DISCOVERY_PORT;

pub const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(30);
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(10);
const OUTBOUND_QUEUE: usize = 256;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind, `host:port`.
    pub listen: String,
    /// A peer silent for longer than this is evicted.
    pub heartbeat_timeout: Duration,
    /// How often the liveness monitor scans the registry.
    pub sweep_interval: Duration,
    /// Per-connection queue of envelopes waiting to be written. A peer whose
    /// queue is full when a broadcast arrives is treated as dead.
    pub outbound_queue: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: format!("0.0.0.0:{DEFAULT_DISCOVERY_PORT}"),
            heartbeat_timeout: HEARTBEAT_TIMEOUT,
            sweep_interval: SWEEP_INTERVAL,
            outbound_queue: OUTBOUND_QUEUE,
        }
    }
}
