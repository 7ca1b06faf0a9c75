//! Integration tests: real discovery server on loopback, raw protocol clients.
//!
//! Alice and Bob register, Alice hears about Bob, Alice goes silent and Bob
//! hears she was evicted.

use std::net::SocketAddr;
use std::time::Duration;

use chat_discovery::{DiscoveryServer, ServerConfig};
use chat_proto::*;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

struct Client {
    framed: Framed<TcpStream, EnvelopeCodec>,
    id: String,
}

impl Client {
    async fn register(addr: SocketAddr, username: &str, port: u16) -> (Self, RegisterAck) {
        let stream = TcpStream::connect(addr).await.unwrap();
        let mut framed = Framed::new(stream, EnvelopeCodec::new());
        let req = RegisterRequest {
            port,
            username: username.into(),
            ip: Some("127.0.0.1".into()),
        };
        let env = Envelope::with_payload(MessageType::Register, username, &req).unwrap();
        framed.send(env).await.unwrap();

        let ack = recv(&mut framed, Duration::from_secs(2)).await.unwrap();
        assert_eq!(ack.msg_type, MessageType::RegisterAck);
        let ack: RegisterAck = ack.payload().unwrap();
        (
            Self {
                framed,
                id: ack.peer_id.clone(),
            },
            ack,
        )
    }

    async fn send(&mut self, env: Envelope) {
        self.framed.send(env).await.unwrap();
    }

    async fn heartbeat(&mut self) {
        let env = Envelope::new(MessageType::Heartbeat, self.id.clone());
        self.send(env).await;
    }

    async fn recv(&mut self, wait: Duration) -> Option<Envelope> {
        recv(&mut self.framed, wait).await
    }
}

async fn recv(framed: &mut Framed<TcpStream, EnvelopeCodec>, wait: Duration) -> Option<Envelope> {
    match tokio::time::timeout(wait, framed.next()).await {
        Ok(Some(Ok(env))) => Some(env),
        _ => None,
    }
}

async fn start_server(config: ServerConfig) -> (SocketAddr, CancellationToken) {
    let server = DiscoveryServer::bind(ServerConfig {
        listen: "127.0.0.1:0".into(),
        ..config
    })
    .await
    .unwrap();
    let addr = server.local_addr().unwrap();
    let shutdown = CancellationToken::new();
    tokio::spawn(server.serve(shutdown.clone()));
    (addr, shutdown)
}

#[tokio::test]
async fn alice_and_bob_scenario() {
    let (addr, shutdown) = start_server(ServerConfig {
        heartbeat_timeout: Duration::from_millis(300),
        sweep_interval: Duration::from_millis(100),
        ..Default::default()
    })
    .await;

    let (mut alice, ack) = Client::register(addr, "alice", 10001).await;
    assert_eq!(alice.id, "alice@127.0.0.1:10001");
    // The ACK snapshot is taken after insertion, so the first peer sees itself.
    assert_eq!(
        serde_json::to_value(&ack).unwrap(),
        serde_json::json!({
            "peer_id": "alice@127.0.0.1:10001",
            "peer_list": {
                "alice@127.0.0.1:10001": {"ip": "127.0.0.1", "port": 10001, "username": "alice"}
            }
        })
    );

    let (mut bob, ack) = Client::register(addr, "bob", 10002).await;
    assert_eq!(bob.id, "bob@127.0.0.1:10002");
    assert_eq!(ack.peer_list["alice@127.0.0.1:10001"].username, "alice");

    let update = alice.recv(Duration::from_secs(2)).await.unwrap();
    assert_eq!(update.msg_type, MessageType::PeerListUpdate);
    let delta: PeerListUpdate = update.payload().unwrap();
    let new_peer = delta.new_peer.unwrap();
    assert_eq!(new_peer["bob@127.0.0.1:10002"].port, 10002);

    // Alice goes quiet; Bob keeps heartbeating and waits for the eviction notice.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    let mut removed = None;
    while tokio::time::Instant::now() < deadline {
        bob.heartbeat().await;
        if let Some(env) = bob.recv(Duration::from_millis(50)).await {
            if env.msg_type == MessageType::PeerListUpdate {
                removed = env.payload::<PeerListUpdate>().unwrap().removed_peer;
                break;
            }
        }
    }
    assert_eq!(removed.as_deref(), Some("alice@127.0.0.1:10001"));

    shutdown.cancel();
}

#[tokio::test]
async fn new_peer_never_hears_about_itself() {
    let (addr, shutdown) = start_server(ServerConfig::default()).await;

    let (mut alice, _) = Client::register(addr, "alice", 10001).await;
    let (mut bob, _) = Client::register(addr, "bob", 10002).await;

    assert!(alice.recv(Duration::from_secs(1)).await.is_some());
    assert!(bob.recv(Duration::from_millis(300)).await.is_none());

    shutdown.cancel();
}

#[tokio::test]
async fn graceful_unregister_is_broadcast() {
    let (addr, shutdown) = start_server(ServerConfig::default()).await;

    let (mut alice, _) = Client::register(addr, "alice", 10001).await;
    let (mut bob, _) = Client::register(addr, "bob", 10002).await;
    alice.recv(Duration::from_secs(1)).await.unwrap();

    let bye = Envelope::new(MessageType::Unregister, bob.id.clone());
    bob.send(bye).await;

    let update = alice.recv(Duration::from_secs(2)).await.unwrap();
    let delta: PeerListUpdate = update.payload().unwrap();
    assert_eq!(delta.removed_peer.as_deref(), Some("bob@127.0.0.1:10002"));

    shutdown.cancel();
}

#[tokio::test]
async fn relay_request_is_forwarded_to_target() {
    let (addr, shutdown) = start_server(ServerConfig::default()).await;

    let (mut alice, _) = Client::register(addr, "alice", 10001).await;
    let (mut bob, _) = Client::register(addr, "bob", 10002).await;
    alice.recv(Duration::from_secs(1)).await.unwrap();

    let req = RelayRequest {
        target_peer_id: alice.id.clone(),
        message: "via server".into(),
    };
    let env = Envelope::with_payload(MessageType::RelayRequest, bob.id.clone(), &req).unwrap();
    bob.send(env).await;

    let relayed = alice.recv(Duration::from_secs(2)).await.unwrap();
    assert_eq!(relayed.msg_type, MessageType::RelayMessage);
    let msg: RelayMessage = relayed.payload().unwrap();
    assert_eq!(msg.original_sender, bob.id);
    assert_eq!(msg.message, "via server");

    shutdown.cancel();
}

#[tokio::test]
async fn get_peers_returns_snapshot() {
    let (addr, shutdown) = start_server(ServerConfig::default()).await;

    let (mut alice, _) = Client::register(addr, "alice", 10001).await;
    let (_bob, _) = Client::register(addr, "bob", 10002).await;
    alice.recv(Duration::from_secs(1)).await.unwrap();

    let ask = Envelope::new(MessageType::GetPeers, alice.id.clone());
    alice.send(ask).await;
    let reply = alice.recv(Duration::from_secs(2)).await.unwrap();
    assert_eq!(reply.msg_type, MessageType::SyncPeersResponse);
    let snapshot: SyncPeersResponse = reply.payload().unwrap();
    assert_eq!(snapshot.peer_list.len(), 2);

    shutdown.cancel();
}

#[tokio::test]
async fn bind_conflict_is_reported() {
    let first = DiscoveryServer::bind(ServerConfig {
        listen: "127.0.0.1:0".into(),
        ..Default::default()
    })
    .await
    .unwrap();
    let taken = first.local_addr().unwrap();

    let second = DiscoveryServer::bind(ServerConfig {
        listen: taken.to_string(),
        ..Default::default()
    })
    .await;
    assert!(second.is_err());
}
