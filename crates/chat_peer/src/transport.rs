//! Peer-to-peer transport.
//!
//! Every exchange uses a fresh TCP connection carrying newline-delimited JSON.
//! `send` writes one envelope and closes; `request` writes one envelope and
//! waits for the first envelope back.

use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chat_proto::{Envelope, EnvelopeCodec};
use futures::{Sink, SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

/// Transport abstraction so routing and gossip can be tested without sockets.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Send an envelope to a peer and close the connection.
    async fn send(&self, address: &str, port: u16, envelope: &Envelope) -> Result<()>;

    /// Send an envelope and wait up to `wait` for the reply, connect included.
    async fn request(
        &self,
        address: &str,
        port: u16,
        envelope: &Envelope,
        wait: Duration,
    ) -> Result<Envelope>;
}

/// Write one envelope to `sink`, failing if the peer does not take it within
/// `wait`.
pub(crate) async fn send_within<S>(sink: &mut S, envelope: Envelope, wait: Duration) -> Result<()>
where
    S: Sink<Envelope> + Unpin,
    S::Error: std::error::Error + Send + Sync + 'static,
{
    tokio::time::timeout(wait, sink.send(envelope))
        .await
        .with_context(|| format!("write not accepted within {wait:?}"))??;
    Ok(())
}

pub struct TcpTransport {
    connect_timeout: Duration,
}

impl TcpTransport {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }

    async fn connect(&self, address: &str, port: u16) -> Result<Framed<TcpStream, EnvelopeCodec>> {
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect((address, port)))
            .await
            .with_context(|| format!("connect to {address}:{port} timed out"))?
            .with_context(|| format!("connect to {address}:{port}"))?;
        Ok(Framed::new(stream, EnvelopeCodec::new()))
    }
}

#[async_trait::async_trait]
impl Transport for TcpTransport {
    async fn send(&self, address: &str, port: u16, envelope: &Envelope) -> Result<()> {
        let mut framed = self.connect(address, port).await?;
        send_within(&mut framed, envelope.clone(), self.connect_timeout)
            .await
            .with_context(|| format!("write to {address}:{port}"))?;
        tokio::time::timeout(self.connect_timeout, framed.close())
            .await
            .ok();
        Ok(())
    }

    async fn request(
        &self,
        address: &str,
        port: u16,
        envelope: &Envelope,
        wait: Duration,
    ) -> Result<Envelope> {
        let exchange = async {
            let mut framed = self.connect(address, port).await?;
            framed
                .send(envelope.clone())
                .await
                .with_context(|| format!("write to {address}:{port}"))?;
            let reply = framed
                .next()
                .await
                .ok_or_else(|| anyhow!("{address}:{port} closed without replying"))?
                .with_context(|| format!("read from {address}:{port}"))?;
            framed.close().await.ok();
            Ok::<_, anyhow::Error>(reply)
        };
        tokio::time::timeout(wait, exchange)
            .await
            .with_context(|| format!("no reply from {address}:{port} within {wait:?}"))?
    }
}

/// Records sent envelopes and answers requests from a queue of canned replies.
/// Addresses marked unreachable fail both calls.
#[derive(Default)]
pub struct MockTransport {
    responses: Mutex<VecDeque<Envelope>>,
    sent: Mutex<Vec<(String, u16, Envelope)>>,
    unreachable: Mutex<HashSet<(String, u16)>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_response(&self, env: Envelope) {
        self.responses.lock().unwrap().push_back(env);
    }

    pub fn set_unreachable(&self, address: &str, port: u16) {
        self.unreachable
            .lock()
            .unwrap()
            .insert((address.to_string(), port));
    }

    pub fn take_sent(&self) -> Vec<(String, u16, Envelope)> {
        std::mem::take(&mut *self.sent.lock().unwrap())
    }

    fn dial(&self, address: &str, port: u16, envelope: &Envelope) -> Result<()> {
        if self
            .unreachable
            .lock()
            .unwrap()
            .contains(&(address.to_string(), port))
        {
            return Err(anyhow!("connect to {address}:{port}: connection refused"));
        }
        self.sent
            .lock()
            .unwrap()
            .push((address.to_string(), port, envelope.clone()));
        Ok(())
    }
}

#[async_trait::async_trait]
impl Transport for MockTransport {
    async fn send(&self, address: &str, port: u16, envelope: &Envelope) -> Result<()> {
        self.dial(address, port, envelope)
    }

    async fn request(
        &self,
        address: &str,
        port: u16,
        envelope: &Envelope,
        _wait: Duration,
    ) -> Result<Envelope> {
        self.dial(address, port, envelope)?;
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| anyhow!("no canned response"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chat_proto::MessageType;
    use tokio::net::TcpListener;

    const WAIT: Duration = Duration::from_secs(2);

    #[tokio::test]
    async fn mock_send_records() {
        let transport = MockTransport::new();
        let hello = Envelope::chat("alice", "bob", "hi");
        transport.send("192.168.1.10", 9000, &hello).await.unwrap();

        let sent = transport.take_sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "192.168.1.10");
        assert_eq!(sent[0].1, 9000);
        assert_eq!(sent[0].2, hello);
    }

    #[tokio::test]
    async fn mock_request_returns_responses_in_order() {
        let transport = MockTransport::new();
        transport.push_response(Envelope::new(MessageType::ConnectionReply, "bob"));
        transport.push_response(Envelope::new(MessageType::SyncPeersResponse, "bob"));

        let probe = Envelope::new(MessageType::ConnectionTest, "alice");
        let first = transport.request("10.0.0.2", 9000, &probe, WAIT).await.unwrap();
        let second = transport.request("10.0.0.2", 9000, &probe, WAIT).await.unwrap();
        assert_eq!(first.msg_type, MessageType::ConnectionReply);
        assert_eq!(second.msg_type, MessageType::SyncPeersResponse);
        assert!(transport.request("10.0.0.2", 9000, &probe, WAIT).await.is_err());
    }

    #[tokio::test]
    async fn mock_unreachable_records_nothing() {
        let transport = MockTransport::new();
        transport.set_unreachable("10.0.0.3", 9000);
        let env = Envelope::chat("alice", "carol", "hi");
        assert!(transport.send("10.0.0.3", 9000, &env).await.is_err());
        assert!(transport.take_sent().is_empty());
    }

    #[tokio::test]
    async fn tcp_request_reads_first_reply() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut framed = Framed::new(stream, EnvelopeCodec::new());
            let req = framed.next().await.unwrap().unwrap();
            assert_eq!(req.msg_type, MessageType::ConnectionTest);
            framed
                .send(Envelope::new(MessageType::ConnectionReply, "server-side"))
                .await
                .unwrap();
        });

        let transport = TcpTransport::new(WAIT);
        let probe = Envelope::new(MessageType::ConnectionTest, "alice");
        let reply = transport
            .request("127.0.0.1", port, &probe, WAIT)
            .await
            .unwrap();
        assert_eq!(reply.msg_type, MessageType::ConnectionReply);
        assert_eq!(reply.sender_id, "server-side");
    }

    #[tokio::test]
    async fn tcp_request_times_out_on_silent_peer() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (_stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let transport = TcpTransport::new(WAIT);
        let probe = Envelope::new(MessageType::ConnectionTest, "alice");
        let result = transport
            .request("127.0.0.1", port, &probe, Duration::from_millis(200))
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn write_to_stalled_reader_times_out() {
        let (client, _server) = tokio::io::duplex(64);
        let mut framed = Framed::new(client, EnvelopeCodec::new());
        let big = Envelope::chat("alice", "bob", &"x".repeat(64 * 1024));

        let started = tokio::time::Instant::now();
        let result = send_within(&mut framed, big, Duration::from_millis(100)).await;
        assert!(result.is_err());
        assert!(started.elapsed() < WAIT);
    }

    #[tokio::test]
    async fn write_to_live_reader_succeeds() {
        let (client, server) = tokio::io::duplex(64);
        let mut framed = Framed::new(client, EnvelopeCodec::new());
        let mut reader = Framed::new(server, EnvelopeCodec::new());
        let env = Envelope::chat("alice", "bob", &"y".repeat(4 * 1024));

        let (sent, received) = tokio::join!(
            send_within(&mut framed, env.clone(), WAIT),
            reader.next()
        );
        sent.unwrap();
        assert_eq!(received.unwrap().unwrap(), env);
    }

    #[tokio::test]
    async fn tcp_send_to_closed_port_fails() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let transport = TcpTransport::new(WAIT);
        let env = Envelope::chat("alice", "bob", "hi");
        assert!(transport.send("127.0.0.1", port, &env).await.is_err());
    }
}
