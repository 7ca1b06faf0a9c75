//! State shared by the node's tasks.
//!
//! The peer list, connectivity cache and assigned id each sit behind their
//! own lock. No lock is held across network I/O.

use std::sync::Arc;

use chat_proto::{PeerInfo, PeerMap};
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::debug;

use crate::config::PeerConfig;
use crate::connectivity::{Connectivity, ConnectivityCache};
use crate::discovery_client::DiscoveryLink;
use crate::peer_list::PeerList;
use crate::transport::Transport;

/// A chat message delivered to this node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub sender: String,
    pub content: String,
    pub route: Connectivity,
}

pub struct NodeState {
    pub config: PeerConfig,
    /// Address other peers dial to reach this node.
    pub advertised: PeerInfo,
    own_id: RwLock<String>,
    pub peers: RwLock<PeerList>,
    pub connectivity: Mutex<ConnectivityCache>,
    pub discovery: DiscoveryLink,
    pub transport: Arc<dyn Transport>,
    inbound: mpsc::Sender<InboundMessage>,
}

impl NodeState {
    pub fn new(
        config: PeerConfig,
        advertised: PeerInfo,
        transport: Arc<dyn Transport>,
        inbound: mpsc::Sender<InboundMessage>,
    ) -> Self {
        let connectivity = ConnectivityCache::new(config.connectivity_ttl);
        Self {
            // Provisional until the server assigns one; it computes the same value.
            own_id: RwLock::new(advertised.peer_id()),
            advertised,
            config,
            peers: RwLock::new(PeerList::new()),
            connectivity: Mutex::new(connectivity),
            discovery: DiscoveryLink::new(),
            transport,
            inbound,
        }
    }

    pub async fn own_id(&self) -> String {
        self.own_id.read().await.clone()
    }

    pub async fn set_own_id(&self, peer_id: &str) {
        let mut own = self.own_id.write().await;
        if *own != peer_id {
            debug!("adopting assigned id {peer_id} (was {own})");
            *own = peer_id.to_string();
        }
    }

    pub async fn merge_peers(&self, incoming: &PeerMap) -> usize {
        self.peers.write().await.merge(incoming)
    }

    /// Drop a peer from the local view, along with any cached verdict.
    pub async fn forget_peer(&self, peer_id: &str) -> bool {
        let removed = self.peers.write().await.remove(peer_id).is_some();
        self.connectivity.lock().await.forget(peer_id);
        removed
    }

    /// Hand a message to the application. Dropped if nobody is listening.
    pub async fn deliver(&self, msg: InboundMessage) {
        if self.inbound.send(msg).await.is_err() {
            debug!("inbound receiver dropped; discarding message");
        }
    }
}
