use std::time::Duration;

use chat_proto::DEFAULT_DISCOVERY_PORT;

#[derive(Debug, Clone)]
pub struct PeerConfig {
    pub username: String,
    /// Port for the P2P listener. 0 picks a free port.
    pub listen_port: u16,
    pub bind_host: String,
    /// Discovery server, `host:port`.
    pub discovery_addr: String,
    /// IP other peers should dial. Detected when unset.
    pub advertise_ip: Option<String>,
    pub heartbeat_interval: Duration,
    /// Delay between registration attempts while the server is down.
    pub retry_interval: Duration,
    pub gossip_interval: Duration,
    pub gossip_timeout: Duration,
    pub probe_timeout: Duration,
    pub connect_timeout: Duration,
    /// How long a direct/relay verdict is trusted.
    pub connectivity_ttl: Duration,
    /// Upper bound on concurrent sends during a broadcast.
    pub broadcast_concurrency: usize,
    pub inbound_queue: usize,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            username: "anonymous".into(),
            listen_port: 0,
            bind_host: "0.0.0.0".into(),
            discovery_addr: format!("127.0.0.1:{DEFAULT_DISCOVERY_PORT}"),
            advertise_ip: None,
            heartbeat_interval: Duration::from_secs(10),
            retry_interval: Duration::from_secs(15),
            gossip_interval: Duration::from_secs(5),
            gossip_timeout: Duration::from_secs(5),
            probe_timeout: Duration::from_secs(3),
            connect_timeout: Duration::from_secs(5),
            connectivity_ttl: Duration::from_secs(300),
            broadcast_concurrency: 16,
            inbound_queue: 1024,
        }
    }
}
