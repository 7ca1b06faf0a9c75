//! Chat delivery: direct when the peer answers a probe, otherwise relayed
//! through the discovery server.

use std::time::Instant;

use chat_proto::{Envelope, MessageType, PeerInfo, RelayRequest};
use futures::StreamExt;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::connectivity::Connectivity;
use crate::state::NodeState;

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("unknown peer {0}")]
    UnknownPeer(String),
    #[error("{0} is unreachable and the discovery server is down")]
    DiscoveryDown(String),
    #[error("encode relay request: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Decide how to reach `peer_id`, probing it if no fresh verdict is cached.
pub async fn classify(node: &NodeState, peer_id: &str, info: &PeerInfo) -> Connectivity {
    if let Some(cached) = node.connectivity.lock().await.get(peer_id, Instant::now()) {
        return cached;
    }

    let probe = Envelope::new(MessageType::ConnectionTest, node.own_id().await).addressed_to(peer_id);
    let verdict = match node
        .transport
        .request(&info.ip, info.port, &probe, node.config.probe_timeout)
        .await
    {
        Ok(reply) if reply.msg_type == MessageType::ConnectionReply => Connectivity::Direct,
        Ok(reply) => {
            debug!("probe of {peer_id} answered with {}", reply.msg_type);
            Connectivity::Relay
        }
        Err(e) => {
            debug!("probe of {peer_id} failed: {e:#}");
            Connectivity::Relay
        }
    };
    info!("{peer_id} classified as {verdict}");
    node.connectivity
        .lock()
        .await
        .record(peer_id, verdict, Instant::now());
    verdict
}

/// Deliver `text` to `target`, falling back to the relay if a direct send
/// fails. Returns the path actually used.
pub async fn send_chat(
    node: &NodeState,
    target: &str,
    text: &str,
) -> Result<Connectivity, DeliveryError> {
    let info = node
        .peers
        .read()
        .await
        .get(target)
        .cloned()
        .ok_or_else(|| DeliveryError::UnknownPeer(target.to_string()))?;
    let own_id = node.own_id().await;

    if classify(node, target, &info).await == Connectivity::Direct {
        let env = Envelope::chat(own_id.as_str(), target, text);
        match node.transport.send(&info.ip, info.port, &env).await {
            Ok(()) => return Ok(Connectivity::Direct),
            Err(e) => {
                warn!("direct send to {target} failed, falling back to relay: {e:#}");
                node.connectivity
                    .lock()
                    .await
                    .record(target, Connectivity::Relay, Instant::now());
            }
        }
    }

    relay(node, &own_id, target, text).await
}

async fn relay(
    node: &NodeState,
    own_id: &str,
    target: &str,
    text: &str,
) -> Result<Connectivity, DeliveryError> {
    let req = Envelope::with_payload(
        MessageType::RelayRequest,
        own_id,
        &RelayRequest {
            target_peer_id: target.to_string(),
            message: text.to_string(),
        },
    )?;
    match node.discovery.send(req).await {
        Ok(()) => Ok(Connectivity::Relay),
        Err(e) => {
            warn!("cannot relay to {target}, dropping it: {e:#}");
            node.forget_peer(target).await;
            Err(DeliveryError::DiscoveryDown(target.to_string()))
        }
    }
}

/// Send `text` to every known peer except ourselves, at most
/// `broadcast_concurrency` at a time. Returns one result per peer.
pub async fn broadcast(
    node: &NodeState,
    text: &str,
) -> Vec<(String, Result<Connectivity, DeliveryError>)> {
    let own_id = node.own_id().await;
    let targets = node.peers.read().await.others(&own_id);
    let limit = node.config.broadcast_concurrency.max(1);

    let results: Vec<_> = futures::stream::iter(targets)
        .map(|peer| async move {
            let result = send_chat(node, &peer, text).await;
            (peer, result)
        })
        .buffer_unordered(limit)
        .collect()
        .await;

    let failed = results.iter().filter(|(_, r)| r.is_err()).count();
    if failed > 0 {
        warn!("broadcast: {failed}/{} deliveries failed", results.len());
    }
    results
}
