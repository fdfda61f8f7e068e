//! The KRPC engine: owns the UDP socket, the outstanding-transaction
//! registry, and the reader/dispatch tasks that turn raw datagrams
//! into [`Query`]/[`Reply`] traffic.
//!
//! A single [`DhtNode`] is the shared handle every layer above this
//! module calls through — there is deliberately no global/static
//! routing table or token manager, unlike the reference this was
//! modeled on, so more than one node can run in a process (useful for
//! the crawler, which runs many lookups concurrently off one socket).
use std::net::{IpAddr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::{oneshot, Mutex, Semaphore};
use tokio::time;
use tracing::{trace, warn};

use crate::node_id::NodeId;
use crate::protocol::{self, CompactNode, CompactPeer, ProtocolError, Query, Reply};
use crate::routing::RoutingTable;
use crate::token::TokenManager;

/// Maximum datagrams admitted for concurrent processing at once; an
/// inbound query arriving once this many are already in flight is
/// dropped rather than queued, shedding load instead of building an
/// unbounded backlog.
pub const MAX_IN_FLIGHT: usize = 100_000;

/// How long an outbound call waits for a matching reply before giving
/// up.
pub const CALL_TIMEOUT: Duration = Duration::from_secs(5);

const RECV_BUFFER_LEN: usize = 10_000;

#[derive(Debug, Error)]
pub enum KrpcError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("call timed out")]
    Timeout,

    #[error("remote returned error {code}: {message}")]
    Remote { code: i64, message: String },

    #[error("transaction channel closed without a reply")]
    ChannelClosed,
}

pub type KrpcResult<T> = Result<T, KrpcError>;

/// Result of an outbound `get_peers` call: a remote that actually
/// tracks swarms answers with `values`, one that doesn't falls back to
/// `nodes` closer to the infohash, same as any `find_node` reply.
#[derive(Debug, Clone)]
pub enum GetPeersResult {
    Peers { token: Vec<u8>, values: Vec<CompactPeer> },
    Nodes { token: Vec<u8>, nodes: Vec<CompactNode> },
}

/// Invoked whenever a valid `announce_peer` names a peer for an
/// infohash — the only place a discovered peer surfaces, since this
/// node keeps no swarm state of its own (see [`crate::routing`]'s
/// `get_peers` handling, which only ever returns closer nodes).
pub type PeerSink = Arc<dyn Fn(NodeId, IpAddr, u16) + Send + Sync>;

struct Transaction {
    method: &'static [u8],
    reply_tx: oneshot::Sender<Result<Reply, KrpcError>>,
}

/// A running DHT participant: one UDP socket, one identity, one
/// routing table.
pub struct DhtNode {
    pub id: NodeId,
    socket: UdpSocket,
    routing: Mutex<RoutingTable>,
    tokens: Arc<TokenManager>,
    tx_counter: AtomicU64,
    transactions: Mutex<std::collections::HashMap<Vec<u8>, Transaction>>,
    admission: Semaphore,
    on_peer_announced: PeerSink,
    /// Whether inbound contacts and call outcomes feed the routing
    /// table. The crawler binary runs with this off: it fires a
    /// continuous stream of randomized `find_node` probes and has no
    /// use for bucket state, so there's no reason to pay for (or
    /// split buckets over) contacts it will never query again.
    retain_routing: bool,
}

impl DhtNode {
    /// Binds a UDP socket at `addr` and returns a full routing node
    /// ready to be driven by [`DhtNode::serve`].
    pub async fn bind(addr: SocketAddrV4, on_peer_announced: PeerSink) -> KrpcResult<Arc<Self>> {
        Self::bind_with_options(addr, on_peer_announced, true).await
    }

    /// Like [`DhtNode::bind`], but with routing-table retention
    /// configurable — used by the crawler, which keeps no bucket
    /// state.
    pub async fn bind_with_options(
        addr: SocketAddrV4,
        on_peer_announced: PeerSink,
        retain_routing: bool,
    ) -> KrpcResult<Arc<Self>> {
        let socket = UdpSocket::bind(SocketAddr::V4(addr)).await?;
        let id = NodeId::generate();
        Ok(Arc::new(DhtNode {
            id,
            socket,
            routing: Mutex::new(RoutingTable::new(id)),
            tokens: Arc::new(TokenManager::new()),
            tx_counter: AtomicU64::new(seed_transaction_counter()),
            transactions: Mutex::new(std::collections::HashMap::new()),
            admission: Semaphore::new(MAX_IN_FLIGHT),
            on_peer_announced,
            retain_routing,
        }))
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub async fn routing_table_len(&self) -> usize {
        self.routing.lock().await.len()
    }

    /// Spawns the token rotation ticker and runs the reader loop until
    /// the socket errors out. Intended to be the body of a task that
    /// outlives every outbound call made through this node.
    pub async fn serve(self: Arc<Self>) -> KrpcResult<()> {
        tokio::spawn(Arc::clone(&self.tokens).run_rotation());

        let mut buf = vec![0u8; RECV_BUFFER_LEN];
        loop {
            let (n, from) = self.socket.recv_from(&mut buf).await?;
            let from = match from {
                SocketAddr::V4(v4) => v4,
                SocketAddr::V6(_) => {
                    trace!("dropping datagram from IPv6 peer, unsupported");
                    continue;
                }
            };
            let permit = match self.admission.clone().try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => {
                    warn!("in-flight query limit reached, dropping datagram");
                    continue;
                }
            };
            let datagram = buf[..n].to_vec();
            let node = Arc::clone(&self);
            tokio::spawn(async move {
                node.handle_datagram(datagram, from).await;
                drop(permit);
            });
        }
    }

    #[tracing::instrument(skip(self, datagram), fields(from = %from))]
    async fn handle_datagram(self: Arc<Self>, datagram: Vec<u8>, from: SocketAddrV4) {
        let transaction_id = match protocol::peek_transaction_id(&datagram) {
            Some(tid) => tid,
            None => return,
        };
        let hint = {
            let transactions = self.transactions.lock().await;
            transactions.get(&transaction_id).map(|t| t.method)
        };
        let message = match protocol::decode_message(&datagram, hint) {
            Ok(message) => message,
            Err(error) => {
                trace!(%error, "dropping malformed datagram");
                return;
            }
        };
        match message {
            protocol::Message::Query {
                transaction_id,
                query,
            } => self.handle_query(transaction_id, query, from).await,
            protocol::Message::Reply {
                transaction_id,
                reply,
            } => self.complete_transaction(&transaction_id, Ok(reply)).await,
            protocol::Message::Error {
                transaction_id,
                code,
                message,
            } => {
                self.complete_transaction(&transaction_id, Err(KrpcError::Remote { code, message }))
                    .await
            }
        }
    }

    async fn complete_transaction(&self, transaction_id: &[u8], result: Result<Reply, KrpcError>) {
        let slot = self.transactions.lock().await.remove(transaction_id);
        if let Some(slot) = slot {
            let _ = slot.reply_tx.send(result);
        }
    }

    /// Handles one inbound query. A reply is sent only when the query
    /// is well formed and valid; anything that fails is dropped
    /// without an error reply — unlike the reference this was modeled
    /// on, which (by what reads as a bug) only replied on handler
    /// failure and stayed silent on success.
    async fn handle_query(self: &Arc<Self>, transaction_id: Vec<u8>, query: Query, from: SocketAddrV4) {
        if self.retain_routing {
            self.routing.lock().await.insert(query.id(), from);
        }

        let reply = match &query {
            Query::Ping { .. } => Reply::Ping { id: self.id },
            Query::FindNode { target, .. } => {
                let nodes = self.lookup_or_closest(target).await;
                Reply::FindNode { id: self.id, nodes }
            }
            Query::GetPeers { info_hash, .. } => {
                let nodes = self.lookup_or_closest(info_hash).await;
                Reply::GetPeers {
                    id: self.id,
                    token: self.tokens.current_token().await,
                    nodes: Some(nodes),
                    values: None,
                }
            }
            Query::AnnouncePeer { info_hash, token, .. } => {
                if !self.tokens.validate(token).await {
                    trace!("announce_peer rejected: bad token");
                    return;
                }
                let port = query.announced_port(from.port()).unwrap_or_else(|| from.port());
                (self.on_peer_announced)(*info_hash, IpAddr::V4(*from.ip()), port);
                Reply::AnnouncePeer { id: self.id }
            }
        };

        if let Ok(bytes) = protocol::encode_reply(&transaction_id, &reply) {
            let _ = self.socket.send_to(&bytes, from).await;
        }
    }

    async fn lookup_or_closest(&self, target: &NodeId) -> Vec<CompactNode> {
        let routing = self.routing.lock().await;
        match routing.find_exact(target) {
            Some(node) => vec![node.as_compact()],
            None => routing.closest_nodes(target).iter().map(crate::routing::Node::as_compact).collect(),
        }
    }

    fn next_transaction_id(&self) -> Vec<u8> {
        self.tx_counter.fetch_add(1, Ordering::Relaxed).to_string().into_bytes()
    }

    /// Sends `query` to `addr` and waits up to [`CALL_TIMEOUT`] for a
    /// matching reply, registering the caller's known id (if any) as
    /// the contact to mark failed on timeout.
    async fn call(&self, addr: SocketAddrV4, known_id: Option<NodeId>, query: Query) -> KrpcResult<Reply> {
        let transaction_id = self.next_transaction_id();
        let (reply_tx, reply_rx) = oneshot::channel();
        self.transactions.lock().await.insert(
            transaction_id.clone(),
            Transaction {
                method: query.method_name(),
                reply_tx,
            },
        );

        let bytes = protocol::encode_query(&transaction_id, &query)?;
        if let Err(error) = self.socket.send_to(&bytes, addr).await {
            self.transactions.lock().await.remove(&transaction_id);
            return Err(error.into());
        }

        let outcome = time::timeout(CALL_TIMEOUT, reply_rx).await;
        self.transactions.lock().await.remove(&transaction_id);

        match outcome {
            Ok(Ok(Ok(reply))) => {
                if self.retain_routing {
                    self.routing.lock().await.insert(reply.id(), addr);
                }
                Ok(reply)
            }
            Ok(Ok(Err(error))) => {
                if self.retain_routing {
                    if let Some(id) = known_id {
                        self.routing.lock().await.fail(&id);
                    }
                }
                Err(error)
            }
            Ok(Err(_canceled)) => Err(KrpcError::ChannelClosed),
            Err(_elapsed) => {
                if self.retain_routing {
                    if let Some(id) = known_id {
                        self.routing.lock().await.fail(&id);
                    }
                }
                Err(KrpcError::Timeout)
            }
        }
    }

    pub async fn ping(&self, addr: SocketAddrV4, known_id: Option<NodeId>) -> KrpcResult<NodeId> {
        let reply = self.call(addr, known_id, Query::Ping { id: self.id }).await?;
        Ok(reply.id())
    }

    pub async fn find_node(
        &self,
        addr: SocketAddrV4,
        known_id: Option<NodeId>,
        target: NodeId,
    ) -> KrpcResult<Vec<CompactNode>> {
        let reply = self
            .call(addr, known_id, Query::FindNode { id: self.id, target })
            .await?;
        match reply {
            Reply::FindNode { nodes, .. } => Ok(nodes),
            _ => Err(KrpcError::Protocol(ProtocolError::UnexpectedKind)),
        }
    }

    pub async fn get_peers(
        &self,
        addr: SocketAddrV4,
        known_id: Option<NodeId>,
        info_hash: NodeId,
    ) -> KrpcResult<GetPeersResult> {
        let reply = self
            .call(
                addr,
                known_id,
                Query::GetPeers {
                    id: self.id,
                    info_hash,
                },
            )
            .await?;
        match reply {
            Reply::GetPeers {
                token,
                values: Some(values),
                ..
            } => Ok(GetPeersResult::Peers { token, values }),
            Reply::GetPeers {
                token,
                nodes: Some(nodes),
                ..
            } => Ok(GetPeersResult::Nodes { token, nodes }),
            Reply::GetPeers { token, .. } => Ok(GetPeersResult::Nodes { token, nodes: Vec::new() }),
            _ => Err(KrpcError::Protocol(ProtocolError::UnexpectedKind)),
        }
    }

    pub async fn announce_peer(
        &self,
        addr: SocketAddrV4,
        known_id: Option<NodeId>,
        info_hash: NodeId,
        token: Vec<u8>,
        port: u16,
    ) -> KrpcResult<()> {
        let reply = self
            .call(
                addr,
                known_id,
                Query::AnnouncePeer {
                    id: self.id,
                    info_hash,
                    token,
                    implied_port: false,
                    port: Some(port),
                },
            )
            .await?;
        match reply {
            Reply::AnnouncePeer { .. } => Ok(()),
            _ => Err(KrpcError::Protocol(ProtocolError::UnexpectedKind)),
        }
    }
}

/// Seeds the transaction counter from the wall clock at startup, same
/// idea as the reference's `sync.Once`-seeded global, but scoped to
/// one node's `AtomicU64` instead of a package-level singleton.
fn seed_transaction_counter() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::sync::atomic::AtomicUsize;

    fn loopback(port: u16) -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::LOCALHOST, port)
    }

    async fn spawn_node(port: u16, sink: PeerSink) -> Arc<DhtNode> {
        let node = DhtNode::bind(loopback(port), sink).await.unwrap();
        tokio::spawn(Arc::clone(&node).serve());
        node
    }

    #[tokio::test]
    async fn ping_round_trip_between_two_nodes() {
        let sink: PeerSink = Arc::new(|_, _, _| {});
        let a = spawn_node(16881, sink.clone()).await;
        let b = spawn_node(16882, sink).await;

        let got_id = a.ping(loopback(16882), None).await.unwrap();
        assert_eq!(got_id, b.id);
    }

    #[tokio::test]
    async fn find_node_returns_closest_known_contacts() {
        let sink: PeerSink = Arc::new(|_, _, _| {});
        let a = spawn_node(16883, sink.clone()).await;
        let b = spawn_node(16884, sink).await;

        // seed b's table with a so it has something to answer with
        b.routing.lock().await.insert(a.id, loopback(16883));

        let nodes = a.find_node(loopback(16884), None, NodeId::generate()).await.unwrap();
        assert!(nodes.iter().any(|n| n.id == a.id));
    }

    #[tokio::test]
    async fn announce_peer_invokes_sink_with_resolved_port() {
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_clone = Arc::clone(&seen);
        let sink: PeerSink = Arc::new(move |_, _, port| {
            if port == 6969 {
                seen_clone.fetch_add(1, Ordering::SeqCst);
            }
        });
        let a = spawn_node(16885, Arc::new(|_, _, _| {})).await;
        let b = spawn_node(16886, sink).await;

        let info_hash = NodeId::generate();
        let get_peers = a.get_peers(loopback(16886), None, info_hash).await.unwrap();
        let token = match get_peers {
            GetPeersResult::Nodes { token, .. } => token,
            GetPeersResult::Peers { token, .. } => token,
        };

        a.announce_peer(loopback(16886), Some(b.id), info_hash, token, 6969)
            .await
            .unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn announce_peer_with_bad_token_times_out() {
        let a = spawn_node(16887, Arc::new(|_, _, _| {})).await;
        let _b = spawn_node(16888, Arc::new(|_, _, _| {})).await;

        let handle = tokio::spawn(async move {
            a.announce_peer(loopback(16888), None, NodeId::generate(), b"bogus".to_vec(), 1)
                .await
        });
        tokio::time::advance(CALL_TIMEOUT + Duration::from_millis(10)).await;
        let result = handle.await.unwrap();
        assert!(matches!(result, Err(KrpcError::Timeout)));
    }
}
