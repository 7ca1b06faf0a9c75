//! Registry actor: a single task owns the registry and the connection table.
//!
//! Connection tasks never touch shared maps; they send commands and await
//! replies. Every membership change and every broadcast runs on this one task,
//! so there is no lock to order.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use chat_proto::{
    Envelope, MessageType, PeerInfo, PeerListUpdate, PeerMap, RegisterAck, RegisterRequest,
    RelayMessage, RelayRequest, SERVER_SENDER,
};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::registry::{ConnId, Registry};

const COMMAND_QUEUE: usize = 1024;

/// Outbound side of an accepted connection, as held by the registry.
#[derive(Debug, Clone)]
pub struct Connection {
    pub id: ConnId,
    pub tx: mpsc::Sender<Envelope>,
    /// Cancelling closes the connection.
    pub closed: CancellationToken,
}

enum Command {
    Register {
        conn: Connection,
        observed_ip: String,
        req: RegisterRequest,
        reply: oneshot::Sender<String>,
    },
    Heartbeat {
        peer_id: String,
    },
    Unregister {
        peer_id: String,
        conn_id: Option<ConnId>,
        reply: oneshot::Sender<()>,
    },
    Relay {
        sender_id: String,
        req: RelayRequest,
    },
    GetPeers {
        reply: oneshot::Sender<PeerMap>,
    },
    Sweep {
        reply: oneshot::Sender<Vec<String>>,
    },
}

/// Cheap-to-clone handle to the registry actor.
#[derive(Clone)]
pub struct RegistryHandle {
    cmd_tx: mpsc::Sender<Command>,
}

impl RegistryHandle {
    /// Spawn the actor on the current runtime. It stops once every handle is dropped.
    pub fn spawn(heartbeat_timeout: Duration) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_QUEUE);
        let actor = RegistryActor {
            registry: Registry::new(heartbeat_timeout),
            connections: HashMap::new(),
        };
        tokio::spawn(actor.run(cmd_rx));
        Self { cmd_tx }
    }

    async fn send(&self, cmd: Command) -> Result<()> {
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|_| anyhow!("registry actor closed"))
    }

    /// Register a peer on `conn`. The ACK is queued on the connection before
    /// any later broadcast. Returns the assigned id.
    pub async fn register(
        &self,
        conn: Connection,
        observed_ip: String,
        req: RegisterRequest,
    ) -> Result<String> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Register {
            conn,
            observed_ip,
            req,
            reply,
        })
        .await?;
        rx.await.map_err(|_| anyhow!("registry actor closed"))
    }

    pub async fn heartbeat(&self, peer_id: String) -> Result<()> {
        self.send(Command::Heartbeat { peer_id }).await
    }

    /// Remove a peer. With `conn_id`, only if that connection still owns the id.
    /// Returns once the removal and its broadcast have been applied.
    pub async fn unregister(&self, peer_id: String, conn_id: Option<ConnId>) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Unregister {
            peer_id,
            conn_id,
            reply,
        })
        .await?;
        rx.await.map_err(|_| anyhow!("registry actor closed"))
    }

    pub async fn relay(&self, sender_id: String, req: RelayRequest) -> Result<()> {
        self.send(Command::Relay { sender_id, req }).await
    }

    pub async fn peers(&self) -> Result<PeerMap> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::GetPeers { reply }).await?;
        rx.await.map_err(|_| anyhow!("registry actor closed"))
    }

    /// Evict every peer past the heartbeat timeout. Returns the evicted ids.
    pub async fn sweep(&self) -> Result<Vec<String>> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Sweep { reply }).await?;
        rx.await.map_err(|_| anyhow!("registry actor closed"))
    }
}

struct RegistryActor {
    registry: Registry,
    connections: HashMap<String, Connection>,
}

impl RegistryActor {
    async fn run(mut self, mut cmd_rx: mpsc::Receiver<Command>) {
        while let Some(cmd) = cmd_rx.recv().await {
            match cmd {
                Command::Register {
                    conn,
                    observed_ip,
                    req,
                    reply,
                } => {
                    let peer_id = self.register(conn, observed_ip, req);
                    let _ = reply.send(peer_id);
                }
                Command::Heartbeat { peer_id } => {
                    if self.registry.heartbeat(&peer_id) {
                        debug!("heartbeat from {peer_id}");
                    } else {
                        warn!("heartbeat from unknown peer {peer_id}, ignoring");
                    }
                }
                Command::Unregister {
                    peer_id,
                    conn_id,
                    reply,
                } => {
                    self.unregister(peer_id, conn_id);
                    let _ = reply.send(());
                }
                Command::Relay { sender_id, req } => self.relay(sender_id, req),
                Command::GetPeers { reply } => {
                    let _ = reply.send(self.registry.snapshot());
                }
                Command::Sweep { reply } => {
                    let expired = self.registry.expired(Instant::now());
                    for peer_id in &expired {
                        info!("heartbeat timeout: {peer_id}");
                        self.unregister(peer_id.clone(), None);
                    }
                    let _ = reply.send(expired);
                }
            }
        }
        debug!("registry actor stopped");
    }

    fn register(&mut self, conn: Connection, observed_ip: String, req: RegisterRequest) -> String {
        let ip = match req.ip {
            Some(ip) if !ip.trim().is_empty() => ip,
            _ => {
                debug!("peer {} sent no ip, using {observed_ip}", req.username);
                observed_ip
            }
        };
        let info = PeerInfo::new(ip, req.port, req.username);
        let was_known = self.registry.get(&info.peer_id()).is_some();
        let peer_id = self.registry.register(info.clone(), conn.id);

        // The snapshot includes the registering peer itself.
        let ack = RegisterAck {
            peer_id: peer_id.clone(),
            peer_list: self.registry.snapshot(),
        };
        let acked = match Envelope::with_payload(MessageType::RegisterAck, SERVER_SENDER, &ack) {
            Ok(env) => match conn.tx.try_send(env.addressed_to(&peer_id)) {
                Ok(()) => true,
                Err(e) => {
                    warn!("failed to queue REGISTER_ACK for {peer_id}: {e}");
                    false
                }
            },
            Err(e) => {
                warn!("failed to encode REGISTER_ACK for {peer_id}: {e}");
                false
            }
        };

        let conn_id = conn.id;
        if let Some(previous) = self.connections.insert(peer_id.clone(), conn) {
            if previous.id != conn_id {
                debug!("closing superseded connection for {peer_id}");
                previous.closed.cancel();
            }
        }

        if !acked {
            // A peer that never learns its id cannot heartbeat under it.
            if was_known {
                self.unregister(peer_id.clone(), None);
            } else {
                self.registry.remove(&peer_id);
                if let Some(conn) = self.connections.remove(&peer_id) {
                    conn.closed.cancel();
                }
                info!("registration of {peer_id} abandoned");
            }
            return peer_id;
        }

        let failed = self.broadcast(&PeerListUpdate::joined(&peer_id, info));
        self.remove_failed(failed);
        peer_id
    }

    fn unregister(&mut self, peer_id: String, conn_id: Option<ConnId>) {
        let mut pending = VecDeque::from([(peer_id, conn_id)]);
        while let Some((peer_id, conn_id)) = pending.pop_front() {
            if let Some(conn_id) = conn_id {
                if self.registry.owner(&peer_id) != Some(conn_id) {
                    debug!("{peer_id} now owned by another connection, not removing");
                    continue;
                }
            }

            let removed = self.registry.remove(&peer_id);
            if let Some(conn) = self.connections.remove(&peer_id) {
                conn.closed.cancel();
            }
            if removed.is_none() {
                continue;
            }

            info!("peer removed: {peer_id}");
            let failed = self.broadcast(&PeerListUpdate::left(&peer_id));
            pending.extend(failed.into_iter().map(|id| (id, None)));
        }
    }

    fn remove_failed(&mut self, failed: Vec<String>) {
        if failed.is_empty() {
            return;
        }
        info!("cleaning up {} unreachable peers", failed.len());
        for peer_id in failed {
            self.unregister(peer_id, None);
        }
    }

    /// Push a delta to every connection except the one it concerns.
    /// Returns the peers whose queue rejected it.
    fn broadcast(&self, delta: &PeerListUpdate) -> Vec<String> {
        let env = match Envelope::with_payload(MessageType::PeerListUpdate, SERVER_SENDER, delta) {
            Ok(env) => env,
            Err(e) => {
                warn!("failed to encode PEER_LIST_UPDATE: {e}");
                return Vec::new();
            }
        };
        let subject = delta.subject();

        let mut failed = Vec::new();
        for (peer_id, conn) in &self.connections {
            if Some(peer_id.as_str()) == subject {
                continue;
            }
            if let Err(e) = conn.tx.try_send(env.clone()) {
                warn!("broadcast to {peer_id} failed: {e}");
                failed.push(peer_id.clone());
            }
        }
        failed
    }

    fn relay(&self, sender_id: String, req: RelayRequest) {
        let Some(conn) = self.connections.get(&req.target_peer_id) else {
            warn!(
                "relay from {sender_id} to unknown peer {}, dropping",
                req.target_peer_id
            );
            return;
        };

        let msg = RelayMessage {
            original_sender: sender_id.clone(),
            message: req.message,
        };
        match Envelope::with_payload(MessageType::RelayMessage, SERVER_SENDER, &msg) {
            Ok(env) => match conn.tx.try_send(env.addressed_to(&req.target_peer_id)) {
                Ok(()) => debug!("relayed message {sender_id} -> {}", req.target_peer_id),
                Err(e) => warn!("relay to {} failed: {e}", req.target_peer_id),
            },
            Err(e) => warn!("failed to encode RELAY_MESSAGE: {e}"),
        }
    }
}
