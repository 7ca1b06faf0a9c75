//! Peer node for the rendezvous chat.
//!
//! A node listens for other peers, keeps a registration with the discovery
//! server, gossips membership with random peers, and delivers chat either
//! directly or relayed through the server.

pub mod config;
pub mod connectivity;
pub mod discovery_client;
pub mod gossip;
pub mod listener;
pub mod node;
pub mod peer_list;
pub mod router;
pub mod state;
pub mod transport;

pub use config::PeerConfig;
pub use connectivity::{Connectivity, ConnectivityCache};
pub use discovery_client::{DiscoveryLink, DiscoveryState};
pub use gossip::GossipOutcome;
pub use node::PeerNode;
pub use peer_list::PeerList;
pub use router::DeliveryError;
pub use state::{InboundMessage, NodeState};
pub use transport::{MockTransport, TcpTransport, Transport};
