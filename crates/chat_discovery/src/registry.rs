//! The in-memory peer registry owned by the discovery server.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use chat_proto::{PeerInfo, PeerMap};
use tracing::{debug, info};

/// Identifies one accepted TCP connection.
pub type ConnId = uuid::Uuid;

/// A live registration.
#[derive(Debug, Clone)]
pub struct RegisteredPeer {
    pub info: PeerInfo,
    pub last_heartbeat: Instant,
    /// Connection that registered this id. Only that connection may tear it down.
    pub conn_id: ConnId,
}

impl RegisteredPeer {
    fn is_expired(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_heartbeat) > timeout
    }
}

pub struct Registry {
    peers: HashMap<String, RegisteredPeer>,
    heartbeat_timeout: Duration,
}

impl Registry {
    pub fn new(heartbeat_timeout: Duration) -> Self {
        Self {
            peers: HashMap::new(),
            heartbeat_timeout,
        }
    }

    /// Insert or overwrite the registration for `info`, returning its id.
    /// A second registration under the same id replaces the first.
    pub fn register(&mut self, info: PeerInfo, conn_id: ConnId) -> String {
        let peer_id = info.peer_id();
        let previous = self.peers.insert(
            peer_id.clone(),
            RegisteredPeer {
                info,
                last_heartbeat: Instant::now(),
                conn_id,
            },
        );
        if previous.is_some() {
            info!("re-registered {peer_id}");
        } else {
            info!("registered {peer_id}");
        }
        peer_id
    }

    /// Refresh a peer's heartbeat. Returns false for unknown ids.
    pub fn heartbeat(&mut self, peer_id: &str) -> bool {
        match self.peers.get_mut(peer_id) {
            Some(peer) => {
                peer.last_heartbeat = Instant::now();
                true
            }
            None => false,
        }
    }

    pub fn remove(&mut self, peer_id: &str) -> Option<RegisteredPeer> {
        let removed = self.peers.remove(peer_id);
        if removed.is_some() {
            debug!("removed {peer_id} from registry");
        }
        removed
    }

    pub fn owner(&self, peer_id: &str) -> Option<ConnId> {
        self.peers.get(peer_id).map(|p| p.conn_id)
    }

    pub fn get(&self, peer_id: &str) -> Option<&RegisteredPeer> {
        self.peers.get(peer_id)
    }

    /// Ids whose last heartbeat is older than the timeout at `now`.
    pub fn expired(&self, now: Instant) -> Vec<String> {
        self.peers
            .iter()
            .filter(|(_, p)| p.is_expired(now, self.heartbeat_timeout))
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Copy of every registration as sent to peers.
    pub fn snapshot(&self) -> PeerMap {
        self.peers
            .iter()
            .map(|(id, p)| (id.clone(), p.info.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn() -> ConnId {
        uuid::Uuid::new_v4()
    }

    #[test]
    fn register_assigns_username_at_address() {
        let mut reg = Registry::new(Duration::from_secs(30));
        let id = reg.register(PeerInfo::new("127.0.0.1", 10001, "alice"), conn());
        assert_eq!(id, "alice@127.0.0.1:10001");
        assert_eq!(reg.len(), 1);
        assert_eq!(reg.snapshot()[&id].port, 10001);
    }

    #[test]
    fn distinct_addresses_get_distinct_ids() {
        let mut reg = Registry::new(Duration::from_secs(30));
        let a = reg.register(PeerInfo::new("127.0.0.1", 10001, "alice"), conn());
        let b = reg.register(PeerInfo::new("127.0.0.1", 10002, "alice"), conn());
        let c = reg.register(PeerInfo::new("10.0.0.7", 10001, "alice"), conn());
        let d = reg.register(PeerInfo::new("127.0.0.1", 10001, "bob"), conn());
        let mut ids = vec![a, b, c, d];
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 4);
        assert_eq!(reg.len(), 4);
    }

    #[test]
    fn same_identity_last_writer_wins() {
        let mut reg = Registry::new(Duration::from_secs(30));
        let first = conn();
        let second = conn();
        reg.register(PeerInfo::new("127.0.0.1", 10001, "alice"), first);
        let id = reg.register(PeerInfo::new("127.0.0.1", 10001, "alice"), second);
        assert_eq!(reg.len(), 1);
        assert_eq!(reg.owner(&id), Some(second));
    }

    #[test]
    fn heartbeat_for_unknown_peer_is_rejected() {
        let mut reg = Registry::new(Duration::from_secs(30));
        assert!(!reg.heartbeat("ghost@1.1.1.1:1"));
        let id = reg.register(PeerInfo::new("127.0.0.1", 10001, "alice"), conn());
        assert!(reg.heartbeat(&id));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn expiry_uses_timeout() {
        let mut reg = Registry::new(Duration::from_secs(30));
        let id = reg.register(PeerInfo::new("127.0.0.1", 10001, "alice"), conn());
        let now = Instant::now();
        assert!(reg.expired(now).is_empty());
        assert!(reg.expired(now + Duration::from_secs(29)).is_empty());
        assert_eq!(reg.expired(now + Duration::from_secs(31)), vec![id]);
    }

    #[test]
    fn remove_is_idempotent() {
        let mut reg = Registry::new(Duration::from_secs(30));
        let id = reg.register(PeerInfo::new("127.0.0.1", 10001, "alice"), conn());
        assert!(reg.remove(&id).is_some());
        assert!(reg.remove(&id).is_none());
        assert!(reg.is_empty());
    }
}
