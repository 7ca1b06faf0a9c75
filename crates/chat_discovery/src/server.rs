//! TCP front end of the discovery server.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use chat_proto::{
    Envelope, EnvelopeCodec, MessageType, RegisterRequest, RelayRequest, SyncPeersResponse,
    SERVER_SENDER,
};
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::actor::{Connection, RegistryHandle};
use crate::config::ServerConfig;

pub struct DiscoveryServer {
    listener: TcpListener,
    registry: RegistryHandle,
    config: ServerConfig,
}

impl DiscoveryServer {
    /// Bind the listening socket and start the registry actor. A port already
    /// in use is returned as an error.
    pub async fn bind(config: ServerConfig) -> Result<Self> {
        let listener = TcpListener::bind(&config.listen)
            .await
            .with_context(|| format!("bind discovery server to {}", config.listen))?;
        let registry = RegistryHandle::spawn(config.heartbeat_timeout);
        Ok(Self {
            listener,
            registry,
            config,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn registry(&self) -> RegistryHandle {
        self.registry.clone()
    }

    /// Run the accept loop and the liveness monitor until `shutdown` fires.
    pub async fn serve(self, shutdown: CancellationToken) -> Result<()> {
        info!("discovery server listening on {}", self.local_addr()?);

        tokio::spawn(liveness_monitor(
            self.registry.clone(),
            self.config.sweep_interval,
            shutdown.clone(),
        ));

        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("discovery server shutting down");
                    return Ok(());
                }
                accepted = self.listener.accept() => accepted,
            };

            let (stream, peer_addr) = match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    warn!("accept failed: {e}");
                    continue;
                }
            };
            debug!("new connection from {peer_addr}");

            tokio::spawn(handle_connection(
                stream,
                peer_addr,
                self.registry.clone(),
                self.config.outbound_queue,
                shutdown.child_token(),
            ));
        }
    }
}

/// Wake every `every`, evict peers past their heartbeat timeout.
async fn liveness_monitor(registry: RegistryHandle, every: Duration, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }
        match registry.sweep().await {
            Ok(evicted) if !evicted.is_empty() => {
                info!("liveness sweep evicted {} peers", evicted.len())
            }
            Ok(_) => {}
            Err(e) => {
                warn!("liveness monitor stopping: {e}");
                break;
            }
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    registry: RegistryHandle,
    queue: usize,
    closed: CancellationToken,
) {
    let conn_id = uuid::Uuid::new_v4();
    let (tx, mut rx) = mpsc::channel::<Envelope>(queue);
    let (mut sink, mut frames) = Framed::new(stream, EnvelopeCodec::new()).split();

    let writer_closed = closed.clone();
    let writer = tokio::spawn(async move {
        loop {
            let env = tokio::select! {
                _ = writer_closed.cancelled() => break,
                env = rx.recv() => env,
            };
            let Some(env) = env else { break };
            if let Err(e) = sink.send(env).await {
                debug!("write to {peer_addr} failed: {e}");
                break;
            }
        }
        let _ = sink.close().await;
        writer_closed.cancel();
    });

    let mut registered: Option<String> = None;
    loop {
        let next = tokio::select! {
            _ = closed.cancelled() => break,
            next = frames.next() => next,
        };
        let env = match next {
            Some(Ok(env)) => env,
            Some(Err(e)) => {
                warn!("read from {peer_addr} failed: {e}");
                break;
            }
            None => {
                debug!("connection from {peer_addr} closed");
                break;
            }
        };

        let sender = registered.clone().unwrap_or_else(|| env.sender_id.clone());
        let result = match env.msg_type {
            MessageType::Register => match env.payload::<RegisterRequest>() {
                Ok(req) => {
                    let conn = Connection {
                        id: conn_id,
                        tx: tx.clone(),
                        closed: closed.clone(),
                    };
                    registry
                        .register(conn, peer_addr.ip().to_string(), req)
                        .await
                        .map(|peer_id| registered = Some(peer_id))
                }
                Err(e) => {
                    warn!("malformed REGISTER from {peer_addr}: {e}");
                    Ok(())
                }
            },
            MessageType::Heartbeat => registry.heartbeat(sender).await,
            MessageType::Unregister => {
                info!("peer {sender} unregistered");
                break;
            }
            MessageType::RelayRequest => match env.payload::<RelayRequest>() {
                Ok(req) => registry.relay(sender, req).await,
                Err(e) => {
                    warn!("malformed RELAY_REQUEST from {sender}: {e}");
                    Ok(())
                }
            },
            MessageType::GetPeers => send_peer_list(&registry, &tx, &sender).await,
            other => {
                warn!("unexpected {other} from {sender}, ignoring");
                Ok(())
            }
        };

        if let Err(e) = result {
            warn!("dropping connection from {peer_addr}: {e}");
            break;
        }
    }

    closed.cancel();
    if let Some(peer_id) = registered {
        if let Err(e) = registry.unregister(peer_id, Some(conn_id)).await {
            debug!("unregister after disconnect failed: {e}");
        }
    }
    let _ = writer.await;
}

async fn send_peer_list(
    registry: &RegistryHandle,
    tx: &mpsc::Sender<Envelope>,
    requester: &str,
) -> Result<()> {
    let peer_list = registry.peers().await?;
    let env = Envelope::with_payload(
        MessageType::SyncPeersResponse,
        SERVER_SENDER,
        &SyncPeersResponse { peer_list },
    )?
    .addressed_to(requester);
    tx.send(env).await.context("queue peer list")?;
    Ok(())
}
