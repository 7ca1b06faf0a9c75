//! Discovery server for the rendezvous chat.
//!
//! Provides three functions:
//! 1. **Registry**: peers register, get an id and a snapshot of who else is online.
//! 2. **Liveness**: heartbeats keep a registration alive; silent peers are evicted
//!    and everyone else is told.
//! 3. **Relay**: forwards chat text to a peer's discovery connection when the
//!    sender cannot reach it directly.
//!
//! Wire protocol: newline-delimited JSON envelopes over TCP (`chat_proto`).

pub mod actor;
pub mod config;
pub mod registry;
pub mod server;

pub use actor::{Connection, RegistryHandle};
pub use config::ServerConfig;
pub use registry::{ConnId, RegisteredPeer, Registry};
pub use server::DiscoveryServer;
