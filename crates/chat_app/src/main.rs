use anyhow::{Context, Result};
use chat_app::{load_config, parse_input, Cli, Command, Input};
use chat_discovery::DiscoveryServer;
use chat_peer::{PeerConfig, PeerNode};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli.config)?;

    match cli.command {
        Command::Server { listen } => run_server(config.server_config(listen)).await,
        Command::Peer {
            username,
            port,
            discovery,
            ip,
        } => run_peer(config.peer_config(username, port, discovery, ip)?).await,
    }
}

async fn run_server(config: chat_discovery::ServerConfig) -> Result<()> {
    let server = DiscoveryServer::bind(config).await?;
    tracing::info!("discovery server listening on {}", server.local_addr()?);

    let shutdown = CancellationToken::new();
    let serve = tokio::spawn(server.serve(shutdown.clone()));

    tokio::signal::ctrl_c().await.context("wait for Ctrl-C")?;
    tracing::info!("shutting down discovery server");
    shutdown.cancel();
    serve.await.context("join server task")?
}

async fn run_peer(config: PeerConfig) -> Result<()> {
    let (node, mut inbound) = PeerNode::start(config).await?;
    tracing::info!("peer {} listening on port {}", node.id().await, node.listen_port());

    tokio::spawn(async move {
        while let Some(msg) = inbound.recv().await {
            println!("[{}] {}: {}", msg.route, msg.sender, msg.content);
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line() => line.context("read stdin")?,
        };
        let Some(line) = line else { break };
        handle_input(&node, parse_input(&line)).await;
    }

    node.shutdown().await;
    Ok(())
}

async fn handle_input(node: &PeerNode, input: Input) {
    match input {
        Input::Empty => {}
        Input::Peers => {
            let own_id = node.id().await;
            let mut peers: Vec<_> = node.peers().await.into_iter().collect();
            peers.sort_by(|a, b| a.0.cmp(&b.0));
            println!("discovery: {}", node.discovery_state());
            for (peer_id, info) in peers {
                let marker = if peer_id == own_id { " (you)" } else { "" };
                println!("  {peer_id} -> {}{marker}", info.socket_addr());
            }
        }
        Input::Sync => println!("gossip: {:?}", node.run_gossip_cycle().await),
        Input::Refresh => {
            if let Err(e) = node.refresh_from_server().await {
                println!("refresh failed: {e:#}");
            }
        }
        Input::Direct { target, text } => match node.send_direct_or_relay(&target, &text).await {
            Ok(route) => println!("-> {target} ({route})"),
            Err(e) => println!("send failed: {e}"),
        },
        Input::Broadcast(text) => {
            for (peer_id, result) in node.broadcast(&text).await {
                if let Err(e) = result {
                    println!("-> {peer_id}: {e}");
                }
            }
        }
        Input::Invalid(reason) => println!("{reason}"),
    }
}
