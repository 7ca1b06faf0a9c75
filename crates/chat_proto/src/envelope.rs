//! The single envelope type carried on every connection.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// `to` value addressing every peer.
pub const BROADCAST: &str = "ALL";
/// `sender_id` used by the discovery server.
pub const SERVER_SENDER: &str = "server";
const DEFAULT_SENDER: &str = "system";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    Register,
    RegisterAck,
    Unregister,
    Heartbeat,
    GetPeers,
    PeerListUpdate,
    Chat,
    Ack,
    SyncPeersRequest,
    SyncPeersResponse,
    RelayRequest,
    RelayMessage,
    ConnectionTest,
    ConnectionReply,
    /// Any type string this build does not know about.
    #[serde(other)]
    Unknown,
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Register => "REGISTER",
            Self::RegisterAck => "REGISTER_ACK",
            Self::Unregister => "UNREGISTER",
            Self::Heartbeat => "HEARTBEAT",
            Self::GetPeers => "GET_PEERS",
            Self::PeerListUpdate => "PEER_LIST_UPDATE",
            Self::Chat => "CHAT",
            Self::Ack => "ACK",
            Self::SyncPeersRequest => "SYNC_PEERS_REQUEST",
            Self::SyncPeersResponse => "SYNC_PEERS_RESPONSE",
            Self::RelayRequest => "RELAY_REQUEST",
            Self::RelayMessage => "RELAY_MESSAGE",
            Self::ConnectionTest => "CONNECTION_TEST",
            Self::ConnectionReply => "CONNECTION_REPLY",
            Self::Unknown => "UNKNOWN",
        };
        f.write_str(name)
    }
}

/// Unit of wire transport. Built once, never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub msg_type: MessageType,
    #[serde(default = "default_sender")]
    pub sender_id: String,
    #[serde(default = "default_to")]
    pub to: String,
    #[serde(default)]
    pub content: Value,
}

fn default_sender() -> String {
    DEFAULT_SENDER.into()
}

fn default_to() -> String {
    BROADCAST.into()
}

impl Envelope {
    /// Envelope with no content, addressed to everyone.
    pub fn new(msg_type: MessageType, sender_id: impl Into<String>) -> Self {
        Self {
            msg_type,
            sender_id: sender_id.into(),
            to: default_to(),
            content: Value::Null,
        }
    }

    /// Envelope whose content is the JSON form of `payload`.
    pub fn with_payload<T: Serialize>(
        msg_type: MessageType,
        sender_id: impl Into<String>,
        payload: &T,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            content: serde_json::to_value(payload)?,
            ..Self::new(msg_type, sender_id)
        })
    }

    /// Plain text content, as carried by `CHAT`.
    pub fn chat(sender_id: impl Into<String>, to: impl Into<String>, text: &str) -> Self {
        Self {
            content: Value::String(text.to_string()),
            ..Self::new(MessageType::Chat, sender_id)
        }
        .addressed_to(to)
    }

    pub fn addressed_to(mut self, to: impl Into<String>) -> Self {
        self.to = to.into();
        self
    }

    /// Deserialize `content` into a typed payload.
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.content)
    }

    /// Content rendered as text: strings verbatim, anything else as JSON.
    pub fn text(&self) -> String {
        match &self.content {
            Value::String(s) => s.clone(),
            Value::Null => String::new(),
            other => other.to_string(),
        }
    }
}
