//! Typed `content` shapes for each message kind.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Address and display name of a peer, as known by other peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub ip: String,
    pub port: u16,
    pub username: String,
}

impl PeerInfo {
    pub fn new(ip: impl Into<String>, port: u16, username: impl Into<String>) -> Self {
        Self {
            ip: ip.into(),
            port,
            username: username.into(),
        }
    }

    /// Identity the discovery server assigns: `username@ip:port`.
    pub fn peer_id(&self) -> String {
        format!("{}@{}:{}", self.username, self.ip, self.port)
    }

    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }
}

/// Peer id to peer info.
pub type PeerMap = HashMap<String, PeerInfo>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub port: u16,
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterAck {
    pub peer_id: String,
    #[serde(default)]
    pub peer_list: PeerMap,
}

/// Membership delta pushed by the server.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PeerListUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_peer: Option<PeerMap>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub removed_peer: Option<String>,
}

impl PeerListUpdate {
    pub fn joined(peer_id: &str, info: PeerInfo) -> Self {
        Self {
            new_peer: Some(HashMap::from([(peer_id.to_string(), info)])),
            removed_peer: None,
        }
    }

    pub fn left(peer_id: &str) -> Self {
        Self {
            new_peer: None,
            removed_peer: Some(peer_id.to_string()),
        }
    }

    /// The peer this delta is about. Broadcasts skip it.
    pub fn subject(&self) -> Option<&str> {
        self.removed_peer.as_deref().or_else(|| {
            self.new_peer
                .as_ref()
                .and_then(|m| m.keys().next())
                .map(String::as_str)
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncPeersResponse {
    #[serde(default)]
    pub peer_list: PeerMap,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayRequest {
    pub target_peer_id: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayMessage {
    pub original_sender: String,
    pub message: String,
}
