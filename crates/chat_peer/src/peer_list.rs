//! Local view of the mesh: peer id to dial address.
//!
//! Grown by registration acks, server deltas and gossip. Shrunk by server
//! deltas and by failed gossip or undeliverable sends.

use std::collections::HashMap;

use chat_proto::{PeerInfo, PeerMap};
use rand::seq::IteratorRandom;
use tracing::debug;

#[derive(Debug, Default)]
pub struct PeerList {
    peers: HashMap<String, PeerInfo>,
}

impl PeerList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or overwrite a single peer. Returns true if newly added.
    pub fn upsert(&mut self, peer_id: &str, info: PeerInfo) -> bool {
        self.peers.insert(peer_id.to_string(), info).is_none()
    }

    /// Union `incoming` into the list; incoming entries overwrite existing ones.
    /// Returns how many ids were new.
    pub fn merge(&mut self, incoming: &PeerMap) -> usize {
        let mut learned = 0;
        for (peer_id, info) in incoming {
            if self.upsert(peer_id, info.clone()) {
                debug!("learned peer {peer_id}");
                learned += 1;
            }
        }
        learned
    }

    pub fn remove(&mut self, peer_id: &str) -> Option<PeerInfo> {
        self.peers.remove(peer_id)
    }

    pub fn get(&self, peer_id: &str) -> Option<&PeerInfo> {
        self.peers.get(peer_id)
    }

    pub fn contains(&self, peer_id: &str) -> bool {
        self.peers.contains_key(peer_id)
    }

    /// Ids of every peer other than `own_id`.
    pub fn others(&self, own_id: &str) -> Vec<String> {
        self.peers
            .keys()
            .filter(|id| id.as_str() != own_id)
            .cloned()
            .collect()
    }

    /// Pick a uniformly random peer that is neither `own_id` nor listening
    /// at `own_addr`.
    pub fn random_other(&self, own_id: &str, own_addr: &PeerInfo) -> Option<(String, PeerInfo)> {
        self.peers
            .iter()
            .filter(|(id, info)| {
                id.as_str() != own_id && !(info.ip == own_addr.ip && info.port == own_addr.port)
            })
            .choose(&mut rand::thread_rng())
            .map(|(id, info)| (id.clone(), info.clone()))
    }

    pub fn snapshot(&self) -> PeerMap {
        self.peers.clone()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}
