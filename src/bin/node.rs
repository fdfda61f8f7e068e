//! Full DHT node: answers all four KRPC queries and maintains a
//! Kademlia routing table for as long as the process runs.
use std::net::{Ipv4Addr, SocketAddrV4};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use mldht::krpc::{DhtNode, PeerSink};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Well-known DHT UDP port.
const DEFAULT_BIND: SocketAddrV4 = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 6881);

#[derive(Parser, Debug)]
#[command(about = "Mainline DHT node: answers ping/find_node/get_peers/announce_peer")]
struct Cli {
    /// UDP address to bind. Defaults to the well-known DHT port.
    #[arg(long, default_value_t = DEFAULT_BIND)]
    bind: SocketAddrV4,

    /// Log level filter, e.g. "info", "mldht=debug".
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn discovered_peer_sink() -> PeerSink {
    Arc::new(|info_hash, ip, port| {
        println!("magnet:?xt=urn:btih:{} {}:{}", info_hash, ip, port);
    })
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let node = DhtNode::bind(cli.bind, discovered_peer_sink())
        .await
        .with_context(|| format!("failed to bind DHT socket on {}", cli.bind))?;
    info!(id = %node.id, addr = %cli.bind, "dht node listening");

    node.serve().await.context("dht node exited")?;
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&cli.log_level).unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            error!(%error, "dht node failed");
            ExitCode::FAILURE
        }
    }
}
