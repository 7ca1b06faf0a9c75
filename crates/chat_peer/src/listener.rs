//! Inbound P2P endpoint.
//!
//! Accepts peer connections and handles every envelope on each one until the
//! remote side closes. Replies go back on the same connection.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use chat_proto::{Envelope, EnvelopeCodec, MessageType, SyncPeersResponse};
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::connectivity::Connectivity;
use crate::state::{InboundMessage, NodeState};

pub struct P2pListener {
    listener: TcpListener,
}

impl P2pListener {
    pub async fn bind(host: &str, port: u16) -> Result<Self> {
        let listener = TcpListener::bind((host, port))
            .await
            .with_context(|| format!("bind P2P listener on {host}:{port}"))?;
        debug!("P2P listener bound on {host}:{port}");
        Ok(Self { listener })
    }

    pub fn local_port(&self) -> Result<u16> {
        Ok(self.listener.local_addr()?.port())
    }

    /// Accept until `shutdown` fires. Each connection runs on its own task.
    pub async fn serve(self, node: Arc<NodeState>, shutdown: CancellationToken) {
        if let Ok(port) = self.local_port() {
            info!("P2P listener accepting on port {port}");
        }
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer_addr)) => {
                        tokio::spawn(handle_connection(
                            node.clone(),
                            stream,
                            peer_addr,
                            shutdown.child_token(),
                        ));
                    }
                    Err(e) => warn!("P2P accept failed: {e}"),
                },
            }
        }
        debug!("P2P listener stopped");
    }
}

async fn handle_connection(
    node: Arc<NodeState>,
    stream: TcpStream,
    peer_addr: SocketAddr,
    shutdown: CancellationToken,
) {
    let mut framed = Framed::new(stream, EnvelopeCodec::new());
    loop {
        let frame = tokio::select! {
            _ = shutdown.cancelled() => break,
            frame = framed.next() => frame,
        };
        let env = match frame {
            Some(Ok(env)) => env,
            Some(Err(e)) => {
                warn!("read from {peer_addr} failed: {e}");
                break;
            }
            None => break,
        };
        debug!("{} from {} ({peer_addr})", env.msg_type, env.sender_id);
        if let Some(reply) = handle_envelope(&node, env).await {
            if let Err(e) = framed.send(reply).await {
                warn!("reply to {peer_addr} failed: {e}");
                break;
            }
        }
    }
}

/// Apply one inbound envelope to the node, returning the reply to write back.
pub async fn handle_envelope(node: &NodeState, env: Envelope) -> Option<Envelope> {
    match env.msg_type {
        MessageType::Chat => {
            node.deliver(InboundMessage {
                content: env.text(),
                sender: env.sender_id,
                route: Connectivity::Direct,
            })
            .await;
            None
        }
        MessageType::ConnectionTest => Some(
            Envelope::new(MessageType::ConnectionReply, node.own_id().await)
                .addressed_to(env.sender_id),
        ),
        MessageType::SyncPeersRequest => {
            let reply = SyncPeersResponse {
                peer_list: node.peers.read().await.snapshot(),
            };
            match Envelope::with_payload(MessageType::SyncPeersResponse, node.own_id().await, &reply)
            {
                Ok(env_out) => Some(env_out.addressed_to(env.sender_id)),
                Err(e) => {
                    warn!("encode peer list failed: {e}");
                    None
                }
            }
        }
        MessageType::SyncPeersResponse => {
            match env.payload::<SyncPeersResponse>() {
                Ok(resp) => {
                    let learned = node.merge_peers(&resp.peer_list).await;
                    debug!("unsolicited peer list from {}: {learned} new", env.sender_id);
                }
                Err(e) => warn!("bad SYNC_PEERS_RESPONSE from {}: {e}", env.sender_id),
            }
            None
        }
        other => {
            warn!("ignoring {other} from {} on P2P port", env.sender_id);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PeerConfig;
    use crate::transport::MockTransport;
    use chat_proto::{PeerInfo, PeerMap};
    use tokio::sync::mpsc;

    fn node() -> (NodeState, mpsc::Receiver<InboundMessage>) {
        let (tx, rx) = mpsc::channel(8);
        let me = PeerInfo::new("127.0.0.1", 7000, "me");
        let state = NodeState::new(
            PeerConfig::default(),
            me,
            Arc::new(MockTransport::new()),
            tx,
        );
        (state, rx)
    }

    #[tokio::test]
    async fn chat_is_delivered_without_reply() {
        let (node, mut rx) = node();
        let reply = handle_envelope(&node, Envelope::chat("bob@10.0.0.2:7001", "ALL", "hello")).await;
        assert!(reply.is_none());

        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.sender, "bob@10.0.0.2:7001");
        assert_eq!(msg.content, "hello");
        assert_eq!(msg.route, Connectivity::Direct);
    }

    #[tokio::test]
    async fn connection_test_gets_reply_from_own_id() {
        let (node, _rx) = node();
        let probe = Envelope::new(MessageType::ConnectionTest, "bob");
        let reply = handle_envelope(&node, probe).await.unwrap();
        assert_eq!(reply.msg_type, MessageType::ConnectionReply);
        assert_eq!(reply.sender_id, "me@127.0.0.1:7000");
        assert_eq!(reply.to, "bob");
    }

    #[tokio::test]
    async fn sync_request_returns_full_list() {
        let (node, _rx) = node();
        let carol = PeerInfo::new("10.0.0.3", 7003, "carol");
        node.merge_peers(&PeerMap::from([(carol.peer_id(), carol.clone())]))
            .await;

        let reply = handle_envelope(&node, Envelope::new(MessageType::SyncPeersRequest, "bob"))
            .await
            .unwrap();
        assert_eq!(reply.msg_type, MessageType::SyncPeersResponse);
        let body: SyncPeersResponse = reply.payload().unwrap();
        assert_eq!(body.peer_list.get(&carol.peer_id()), Some(&carol));
    }

    #[tokio::test]
    async fn sync_response_is_merged() {
        let (node, _rx) = node();
        let dave = PeerInfo::new("10.0.0.4", 7004, "dave");
        let env = Envelope::with_payload(
            MessageType::SyncPeersResponse,
            "bob",
            &SyncPeersResponse {
                peer_list: PeerMap::from([(dave.peer_id(), dave.clone())]),
            },
        )
        .unwrap();

        assert!(handle_envelope(&node, env).await.is_none());
        assert!(node.peers.read().await.contains(&dave.peer_id()));
    }

    #[tokio::test]
    async fn serve_answers_multiple_frames_on_one_connection() {
        let (tx, _rx) = mpsc::channel(8);
        let listener = P2pListener::bind("127.0.0.1", 0).await.unwrap();
        let port = listener.local_port().unwrap();
        let node = Arc::new(NodeState::new(
            PeerConfig::default(),
            PeerInfo::new("127.0.0.1", port, "me"),
            Arc::new(MockTransport::new()),
            tx,
        ));
        let shutdown = CancellationToken::new();
        tokio::spawn(listener.serve(node, shutdown.clone()));

        let stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let mut framed = Framed::new(stream, EnvelopeCodec::new());
        for _ in 0..2 {
            framed
                .send(Envelope::new(MessageType::ConnectionTest, "bob"))
                .await
                .unwrap();
            let reply = framed.next().await.unwrap().unwrap();
            assert_eq!(reply.msg_type, MessageType::ConnectionReply);
        }
        shutdown.cancel();
    }
}
