//! Anti-entropy gossip: each cycle pulls the full peer list from one random
//! peer and merges it. A peer that cannot be reached is dropped.

use std::sync::Arc;

use chat_proto::{Envelope, MessageType, SyncPeersResponse};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::state::NodeState;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GossipOutcome {
    /// No peer other than ourselves to ask.
    Skipped,
    Merged { peer: String, learned: usize },
    /// The peer answered with something other than a peer list.
    Rejected { peer: String },
    Removed { peer: String },
}

/// Run one gossip exchange.
pub async fn run_cycle(node: &NodeState) -> GossipOutcome {
    let own_id = node.own_id().await;
    let target = node
        .peers
        .read()
        .await
        .random_other(&own_id, &node.advertised);
    let Some((peer, info)) = target else {
        debug!("gossip: no other peers");
        return GossipOutcome::Skipped;
    };

    let req = Envelope::new(MessageType::SyncPeersRequest, own_id).addressed_to(peer.as_str());
    let reply = node
        .transport
        .request(&info.ip, info.port, &req, node.config.gossip_timeout)
        .await;

    match reply {
        Ok(env) if env.msg_type == MessageType::SyncPeersResponse => {
            match env.payload::<SyncPeersResponse>() {
                Ok(resp) => {
                    let learned = node.merge_peers(&resp.peer_list).await;
                    debug!("gossip with {peer}: {learned} new peers");
                    GossipOutcome::Merged { peer, learned }
                }
                Err(e) => {
                    warn!("gossip with {peer}: malformed peer list: {e}");
                    GossipOutcome::Rejected { peer }
                }
            }
        }
        Ok(env) => {
            warn!("gossip with {peer}: unexpected {} reply", env.msg_type);
            GossipOutcome::Rejected { peer }
        }
        Err(e) => {
            info!("gossip target {peer} unreachable, removing: {e:#}");
            node.forget_peer(&peer).await;
            GossipOutcome::Removed { peer }
        }
    }
}

/// Gossip every `gossip_interval` until `shutdown`. The first cycle runs one
/// interval after start.
pub async fn run(node: Arc<NodeState>, shutdown: CancellationToken) {
    let period = node.config.gossip_interval;
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                run_cycle(&node).await;
            }
        }
    }
    debug!("gossip loop stopped");
}
