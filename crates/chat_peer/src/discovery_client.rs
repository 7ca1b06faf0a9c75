//! Registration with the discovery server.
//!
//! The client is either `Down` (no live session) or `Up` (registered, sending
//! heartbeats). While up it applies the server's membership deltas and relayed
//! messages, and carries outbound relay and peer-list requests. When the session
//! breaks it goes down and retries on a fixed interval.

use std::fmt;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use chat_proto::{
    Envelope, EnvelopeCodec, MessageType, PeerListUpdate, RegisterAck, RegisterRequest,
    RelayMessage, SyncPeersResponse,
};
use futures::StreamExt;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Mutex};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::connectivity::Connectivity;
use crate::state::{InboundMessage, NodeState};
use crate::transport::send_within;

const OUTBOUND_QUEUE: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryState {
    Down,
    Up,
}

impl fmt::Display for DiscoveryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Down => f.write_str("down"),
            Self::Up => f.write_str("up"),
        }
    }
}

/// The node's side of the discovery session: current state plus a queue into
/// the live connection, present only while up.
pub struct DiscoveryLink {
    state: watch::Sender<DiscoveryState>,
    outbound: Mutex<Option<mpsc::Sender<Envelope>>>,
}

impl Default for DiscoveryLink {
    fn default() -> Self {
        Self::new()
    }
}

impl DiscoveryLink {
    pub fn new() -> Self {
        let (state, _) = watch::channel(DiscoveryState::Down);
        Self {
            state,
            outbound: Mutex::new(None),
        }
    }

    pub fn state(&self) -> DiscoveryState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<DiscoveryState> {
        self.state.subscribe()
    }

    pub async fn set_up(&self, outbound: mpsc::Sender<Envelope>) {
        *self.outbound.lock().await = Some(outbound);
        self.state.send_replace(DiscoveryState::Up);
    }

    pub async fn set_down(&self) {
        self.outbound.lock().await.take();
        if self.state.send_replace(DiscoveryState::Down) == DiscoveryState::Up {
            info!("discovery state: down");
        }
    }

    /// Queue an envelope for the server. Fails when down.
    pub async fn send(&self, env: Envelope) -> Result<()> {
        let tx = self.outbound.lock().await.clone();
        match tx {
            Some(tx) => tx
                .send(env)
                .await
                .map_err(|_| anyhow!("discovery session closed")),
            None => bail!("discovery server is down"),
        }
    }
}

/// Keep a session with the server alive until `shutdown`, reconnecting every
/// `retry_interval` while it is unreachable.
pub async fn run(node: Arc<NodeState>, shutdown: CancellationToken) {
    loop {
        match session(&node, &shutdown).await {
            Ok(()) => {}
            Err(e) => warn!(
                "discovery server {} unavailable: {e:#}",
                node.config.discovery_addr
            ),
        }
        node.discovery.set_down().await;
        if shutdown.is_cancelled() {
            break;
        }
        debug!(
            "retrying discovery registration in {:?}",
            node.config.retry_interval
        );
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(node.config.retry_interval) => {}
        }
    }
    debug!("discovery client stopped");
}

/// One connection's lifetime: register, then heartbeat and dispatch until the
/// connection fails (error) or shutdown is requested (after unregistering).
async fn session(node: &NodeState, shutdown: &CancellationToken) -> Result<()> {
    let addr = &node.config.discovery_addr;
    let stream = tokio::time::timeout(node.config.connect_timeout, TcpStream::connect(addr))
        .await
        .with_context(|| format!("connect to {addr} timed out"))?
        .with_context(|| format!("connect to {addr}"))?;
    let mut framed = Framed::new(stream, EnvelopeCodec::new());

    let req = RegisterRequest {
        port: node.advertised.port,
        username: node.advertised.username.clone(),
        ip: Some(node.advertised.ip.clone()),
    };
    let wait = node.config.connect_timeout;
    let register = Envelope::with_payload(MessageType::Register, node.own_id().await, &req)?;
    send_within(&mut framed, register, wait)
        .await
        .context("send REGISTER")?;

    let ack = tokio::time::timeout(wait, await_ack(&mut framed))
        .await
        .context("no REGISTER_ACK")??;
    node.set_own_id(&ack.peer_id).await;
    let learned = node.merge_peers(&ack.peer_list).await;
    info!(
        "registered with {addr} as {} ({learned} peers known)",
        ack.peer_id
    );

    let (out_tx, mut out_rx) = mpsc::channel(OUTBOUND_QUEUE);
    node.discovery.set_up(out_tx).await;
    info!("discovery state: up");

    let mut heartbeat = tokio::time::interval(node.config.heartbeat_interval);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                let bye = Envelope::new(MessageType::Unregister, node.own_id().await);
                if let Err(e) = send_within(&mut framed, bye, wait).await {
                    debug!("UNREGISTER not delivered: {e}");
                }
                return Ok(());
            }
            _ = heartbeat.tick() => {
                let beat = Envelope::new(MessageType::Heartbeat, node.own_id().await);
                send_within(&mut framed, beat, wait)
                    .await
                    .context("send HEARTBEAT")?;
            }
            Some(env) = out_rx.recv() => {
                send_within(&mut framed, env, wait)
                    .await
                    .context("send to discovery server")?;
            }
            frame = framed.next() => match frame {
                Some(Ok(env)) => dispatch(node, env).await,
                Some(Err(e)) => return Err(e).context("read from discovery server"),
                None => bail!("discovery server closed the connection"),
            },
        }
    }
}

async fn await_ack(framed: &mut Framed<TcpStream, EnvelopeCodec>) -> Result<RegisterAck> {
    while let Some(frame) = framed.next().await {
        let env = frame.context("read REGISTER_ACK")?;
        if env.msg_type == MessageType::RegisterAck {
            return env.payload().context("malformed REGISTER_ACK");
        }
        debug!("skipping {} before REGISTER_ACK", env.msg_type);
    }
    bail!("connection closed before REGISTER_ACK")
}

/// Apply one server-pushed envelope.
pub async fn dispatch(node: &NodeState, env: Envelope) {
    match env.msg_type {
        MessageType::PeerListUpdate => {
            let update: PeerListUpdate = match env.payload() {
                Ok(update) => update,
                Err(e) => {
                    warn!("bad PEER_LIST_UPDATE: {e}");
                    return;
                }
            };
            if let Some(joined) = update.new_peer {
                node.merge_peers(&joined).await;
                for peer_id in joined.keys() {
                    info!("peer joined: {peer_id}");
                }
            }
            if let Some(left) = update.removed_peer {
                if left == node.own_id().await {
                    debug!("ignoring removal of our own id");
                } else if node.forget_peer(&left).await {
                    info!("peer left: {left}");
                }
            }
        }
        MessageType::RelayMessage => match env.payload::<RelayMessage>() {
            Ok(relayed) => {
                node.deliver(InboundMessage {
                    sender: relayed.original_sender,
                    content: relayed.message,
                    route: Connectivity::Relay,
                })
                .await
            }
            Err(e) => warn!("bad RELAY_MESSAGE: {e}"),
        },
        MessageType::SyncPeersResponse => match env.payload::<SyncPeersResponse>() {
            Ok(resp) => {
                let learned = node.merge_peers(&resp.peer_list).await;
                info!("server peer list merged: {learned} new");
            }
            Err(e) => warn!("bad SYNC_PEERS_RESPONSE: {e}"),
        },
        MessageType::RegisterAck => debug!("duplicate REGISTER_ACK ignored"),
        MessageType::Ack => debug!("ACK from {}", env.sender_id),
        other => warn!("unexpected {other} from discovery server"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PeerConfig;
    use crate::transport::MockTransport;
    use chat_proto::{PeerInfo, PeerMap, SERVER_SENDER};

    fn node() -> (NodeState, mpsc::Receiver<InboundMessage>) {
        let (tx, rx) = mpsc::channel(8);
        let state = NodeState::new(
            PeerConfig::default(),
            PeerInfo::new("127.0.0.1", 7000, "me"),
            Arc::new(MockTransport::new()),
            tx,
        );
        (state, rx)
    }

    #[tokio::test]
    async fn link_send_fails_while_down() {
        let link = DiscoveryLink::new();
        assert_eq!(link.state(), DiscoveryState::Down);
        assert!(link
            .send(Envelope::new(MessageType::GetPeers, "me"))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn link_forwards_while_up_and_notifies_watchers() {
        let link = DiscoveryLink::new();
        let mut watcher = link.subscribe();
        let (tx, mut rx) = mpsc::channel(4);

        link.set_up(tx).await;
        watcher.changed().await.unwrap();
        assert_eq!(*watcher.borrow(), DiscoveryState::Up);

        link.send(Envelope::new(MessageType::GetPeers, "me"))
            .await
            .unwrap();
        assert_eq!(rx.recv().await.unwrap().msg_type, MessageType::GetPeers);

        link.set_down().await;
        assert_eq!(link.state(), DiscoveryState::Down);
    }

    #[tokio::test]
    async fn deltas_add_and_remove_peers() {
        let (node, _rx) = node();
        let bob = PeerInfo::new("10.0.0.2", 7001, "bob");
        let joined = Envelope::with_payload(
            MessageType::PeerListUpdate,
            SERVER_SENDER,
            &PeerListUpdate::joined(&bob.peer_id(), bob.clone()),
        )
        .unwrap();
        dispatch(&node, joined).await;
        assert!(node.peers.read().await.contains(&bob.peer_id()));

        let left = Envelope::with_payload(
            MessageType::PeerListUpdate,
            SERVER_SENDER,
            &PeerListUpdate::left(&bob.peer_id()),
        )
        .unwrap();
        dispatch(&node, left).await;
        assert!(node.peers.read().await.is_empty());
    }

    #[tokio::test]
    async fn removal_of_own_id_is_ignored() {
        let (node, _rx) = node();
        let me = node.advertised.clone();
        node.merge_peers(&PeerMap::from([(me.peer_id(), me.clone())]))
            .await;

        let left = Envelope::with_payload(
            MessageType::PeerListUpdate,
            SERVER_SENDER,
            &PeerListUpdate::left(&me.peer_id()),
        )
        .unwrap();
        dispatch(&node, left).await;
        assert!(node.peers.read().await.contains(&me.peer_id()));
    }

    #[tokio::test]
    async fn relayed_message_reaches_inbound_queue() {
        let (node, mut rx) = node();
        let env = Envelope::with_payload(
            MessageType::RelayMessage,
            SERVER_SENDER,
            &RelayMessage {
                original_sender: "alice@10.0.0.1:7000".into(),
                message: "via server".into(),
            },
        )
        .unwrap();
        dispatch(&node, env).await;

        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.sender, "alice@10.0.0.1:7000");
        assert_eq!(msg.content, "via server");
        assert_eq!(msg.route, Connectivity::Relay);
    }
}
