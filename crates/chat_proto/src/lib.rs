//! Wire types for the rendezvous chat protocol.
//!
//! Every message is one JSON object terminated by `\n`:
//! `{"type": ..., "sender_id": ..., "to": ..., "content": ...}`.

pub mod codec;
pub mod envelope;
pub mod payload;

pub use codec::{decode, encode, CodecError, DecodeError, EnvelopeCodec};
pub use envelope::{Envelope, MessageType, BROADCAST, SERVER_SENDER};
pub use payload::*;

/// Default TCP port of the discovery server.
pub const DEFAULT_DISCOVERY_PORT: u16 = 9999;
