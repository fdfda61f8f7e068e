//! DHT crawler: fires a continuous stream of randomized `find_node`
//! probes to maximize visibility into the global DHT, retaining no
//! routing-table state of its own — just a bounded
//! buffer of addresses discovered from replies, fed back in as the
//! next round's targets.
use std::net::{Ipv4Addr, SocketAddrV4};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use mldht::krpc::DhtNode;
use mldht::node_id::NodeId;
use mldht::protocol::CompactNode;
use tokio::sync::{mpsc, Mutex};
use tracing::{error, info, trace, warn};
use tracing_subscriber::EnvFilter;

/// Well-known bootstrap seed for the Mainline DHT.
const BOOTSTRAP_HOST: &str = "router.bittorrent.com:6881";
const DISCOVERY_BUFFER_LEN: usize = 10_000;
const WORKER_COUNT: usize = 3_000;

#[derive(Parser, Debug)]
#[command(about = "Mainline DHT crawler: continuous randomized find_node probing")]
struct Cli {
    /// Log level filter, e.g. "info", "mldht=debug".
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Concurrent probing workers.
    #[arg(long, default_value_t = WORKER_COUNT)]
    workers: usize,

    /// Discovery buffer capacity.
    #[arg(long, default_value_t = DISCOVERY_BUFFER_LEN)]
    buffer_len: usize,
}

/// An address to probe next, with its claimed id if one is already
/// known (bootstrap entries have none).
#[derive(Clone, Copy)]
struct Candidate {
    id: Option<NodeId>,
    addr: SocketAddrV4,
}

async fn resolve_bootstrap() -> std::io::Result<SocketAddrV4> {
    tokio::net::lookup_host(BOOTSTRAP_HOST)
        .await?
        .find_map(|addr| match addr {
            std::net::SocketAddr::V4(v4) => Some(v4),
            std::net::SocketAddr::V6(_) => None,
        })
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, "no IPv4 address for bootstrap host"))
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let bootstrap = resolve_bootstrap()
        .await
        .with_context(|| format!("failed to resolve bootstrap host {BOOTSTRAP_HOST}"))?;

    let sink = Arc::new(|info_hash, ip, port| {
        println!("magnet:?xt=urn:btih:{} {}:{}", info_hash, ip, port);
    });
    let node = DhtNode::bind_with_options(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0), sink, false)
        .await
        .context("failed to bind crawler socket")?;
    info!(id = %node.id, bootstrap = %bootstrap, workers = cli.workers, "crawler starting");
    tokio::spawn(Arc::clone(&node).serve());

    let (tx, rx) = mpsc::channel::<Candidate>(cli.buffer_len);
    let rx = Arc::new(Mutex::new(rx));

    let mut workers = Vec::with_capacity(cli.workers);
    for _ in 0..cli.workers {
        let node = Arc::clone(&node);
        let tx = tx.clone();
        let rx = Arc::clone(&rx);
        workers.push(tokio::spawn(probe_loop(node, tx, rx, bootstrap)));
    }

    for worker in workers {
        let _ = worker.await;
    }
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
            error!(%error, "crawler failed");
            ExitCode::FAILURE
        }
    }
}

/// One probing worker: pulls a candidate address (or falls back to
/// the bootstrap router when the buffer is empty), sends it a
/// `find_node` with a fresh random target, and feeds any nodes it
/// learns about back into the shared buffer for the next round.
async fn probe_loop(
    node: Arc<DhtNode>,
    tx: mpsc::Sender<Candidate>,
    rx: Arc<Mutex<mpsc::Receiver<Candidate>>>,
    bootstrap: SocketAddrV4,
) {
    loop {
        let candidate = {
            let mut rx = rx.lock().await;
            match rx.try_recv() {
                Ok(candidate) => candidate,
                Err(_) => Candidate {
                    id: None,
                    addr: bootstrap,
                },
            }
        };

        let target = NodeId::generate();
        match node.find_node(candidate.addr, candidate.id, target).await {
            Ok(nodes) => {
                trace!(count = nodes.len(), addr = %candidate.addr, "find_node reply");
                feed_discoveries(&tx, &nodes).await;
            }
            Err(error) => {
                trace!(%error, addr = %candidate.addr, "find_node failed");
            }
        }
    }
}

/// Pushes newly discovered nodes into the bounded buffer, dropping
/// any that don't fit rather than evicting something already queued —
/// simpler than evict-on-full, and doesn't amplify churn under a
/// discovery burst.
async fn feed_discoveries(tx: &mpsc::Sender<Candidate>, nodes: &[CompactNode]) {
    for node in nodes {
        let candidate = Candidate {
            id: Some(node.id),
            addr: node.addr,
        };
        if tx.try_send(candidate).is_err() {
            warn!("discovery buffer full, dropping newly found node");
        }
    }
}
