//! A running peer: listener, discovery client and gossip loop over one
//! shared [`NodeState`].

use std::sync::Arc;

use anyhow::{Context, Result};
use chat_proto::{Envelope, MessageType, PeerInfo, PeerMap};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::PeerConfig;
use crate::connectivity::Connectivity;
use crate::discovery_client::{self, DiscoveryState};
use crate::gossip::{self, GossipOutcome};
use crate::listener::P2pListener;
use crate::router::{self, DeliveryError};
use crate::state::{InboundMessage, NodeState};
use crate::transport::{TcpTransport, Transport};

pub struct PeerNode {
    state: Arc<NodeState>,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl PeerNode {
    /// Bind the listener and start the background tasks. Received chat
    /// messages arrive on the returned receiver.
    pub async fn start(config: PeerConfig) -> Result<(Self, mpsc::Receiver<InboundMessage>)> {
        let transport = Arc::new(TcpTransport::new(config.connect_timeout));
        Self::start_with_transport(config, transport).await
    }

    pub async fn start_with_transport(
        config: PeerConfig,
        transport: Arc<dyn Transport>,
    ) -> Result<(Self, mpsc::Receiver<InboundMessage>)> {
        let listener = P2pListener::bind(&config.bind_host, config.listen_port).await?;
        let port = listener.local_port().context("read listener port")?;
        let ip = advertise_ip(&config);
        let advertised = PeerInfo::new(ip, port, config.username.clone());

        let (inbound_tx, inbound_rx) = mpsc::channel(config.inbound_queue.max(1));
        let state = Arc::new(NodeState::new(config, advertised, transport, inbound_tx));
        state
            .peers
            .write()
            .await
            .upsert(&state.advertised.peer_id(), state.advertised.clone());
        info!("peer node {} starting", state.advertised.peer_id());

        let shutdown = CancellationToken::new();
        let tasks = vec![
            tokio::spawn(listener.serve(state.clone(), shutdown.child_token())),
            tokio::spawn(discovery_client::run(state.clone(), shutdown.child_token())),
            tokio::spawn(gossip::run(state.clone(), shutdown.child_token())),
        ];

        Ok((
            Self {
                state,
                shutdown,
                tasks,
            },
            inbound_rx,
        ))
    }

    /// Current id: the server-assigned one once registered.
    pub async fn id(&self) -> String {
        self.state.own_id().await
    }

    pub fn listen_port(&self) -> u16 {
        self.state.advertised.port
    }

    pub fn advertised(&self) -> &PeerInfo {
        &self.state.advertised
    }

    pub async fn peers(&self) -> PeerMap {
        self.state.peers.read().await.snapshot()
    }

    /// Seed the peer list, e.g. from a bootstrap list.
    pub async fn add_peers(&self, peers: &PeerMap) -> usize {
        self.state.merge_peers(peers).await
    }

    pub fn discovery_state(&self) -> DiscoveryState {
        self.state.discovery.state()
    }

    pub fn watch_discovery(&self) -> watch::Receiver<DiscoveryState> {
        self.state.discovery.subscribe()
    }

    pub async fn send_direct_or_relay(
        &self,
        target: &str,
        text: &str,
    ) -> Result<Connectivity, DeliveryError> {
        router::send_chat(&self.state, target, text).await
    }

    pub async fn broadcast(&self, text: &str) -> Vec<(String, Result<Connectivity, DeliveryError>)> {
        router::broadcast(&self.state, text).await
    }

    pub async fn run_gossip_cycle(&self) -> GossipOutcome {
        gossip::run_cycle(&self.state).await
    }

    /// Ask the discovery server for its full peer list. The answer is merged
    /// when it arrives.
    pub async fn refresh_from_server(&self) -> Result<()> {
        let req = Envelope::new(MessageType::GetPeers, self.id().await);
        self.state.discovery.send(req).await
    }

    /// Unregister from the server and stop every task.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!("peer task ended abnormally: {e}");
            }
        }
        info!("peer node {} stopped", self.state.own_id().await);
    }
}

fn advertise_ip(config: &PeerConfig) -> String {
    if let Some(ip) = &config.advertise_ip {
        return ip.clone();
    }
    match local_ip_address::local_ip() {
        Ok(ip) => ip.to_string(),
        Err(e) => {
            warn!("local IP detection failed, advertising 127.0.0.1: {e}");
            "127.0.0.1".into()
        }
    }
}
