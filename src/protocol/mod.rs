//! KRPC protocol messages: the typed request/response records carried
//! inside a bencoded envelope, and the compact wire encodings they
//! embed.
//!
//! A KRPC envelope is a bencode dictionary with a transaction id (`t`)
//! and a message kind (`y`) of `"q"` (query), `"r"` (reply) or `"e"`
//! (error). This module only deals with the typed payload; the
//! transaction bookkeeping (matching a reply back to the call that
//! sent it) lives in [`crate::krpc`].
use std::collections::HashMap;
use std::net::SocketAddrV4;

use thiserror::Error;

use crate::bencode::{self, BencodeError, BencodeValue};
use crate::node_id::NodeId;

pub mod compact;

pub use compact::{CompactNode, CompactPeer};

/// Errors decoding or validating a KRPC message.
///
/// All of these are protocol-level parse failures — per the error
/// taxonomy, an inbound query that fails to parse gets no reply, and
/// an outbound call never waits on one (a malformed datagram is
/// simply not a matching transaction).
#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum ProtocolError {
    #[error("bencode error: {0}")]
    Bencode(#[from] BencodeError),

    #[error("missing field: {0}")]
    MissingField(&'static str),

    #[error("invalid type for field: {0}")]
    InvalidFieldType(&'static str),

    #[error("invalid compact encoding: {0}")]
    InvalidCompactLength(&'static str),

    #[error("unknown method: {0}")]
    UnknownMethod(String),

    #[error("unexpected message kind")]
    UnexpectedKind,

    #[error("remote error {code}: {message}")]
    Remote { code: i64, message: String },
}

pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// The four KRPC query methods and their arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Query {
    Ping {
        id: NodeId,
    },
    FindNode {
        id: NodeId,
        target: NodeId,
    },
    GetPeers {
        id: NodeId,
        info_hash: NodeId,
    },
    AnnouncePeer {
        id: NodeId,
        info_hash: NodeId,
        token: Vec<u8>,
        implied_port: bool,
        port: Option<u16>,
    },
}

impl Query {
    pub fn method_name(&self) -> &'static [u8] {
        match self {
            Query::Ping { .. } => b"ping",
            Query::FindNode { .. } => b"find_node",
            Query::GetPeers { .. } => b"get_peers",
            Query::AnnouncePeer { .. } => b"announce_peer",
        }
    }

    pub fn id(&self) -> NodeId {
        match self {
            Query::Ping { id }
            | Query::FindNode { id, .. }
            | Query::GetPeers { id, .. }
            | Query::AnnouncePeer { id, .. } => *id,
        }
    }

    /// Resolves the port this announce targets per the
    /// `implied_port` rule: 1 means use the caller's observed UDP
    /// source port, otherwise the `port` argument is authoritative.
    pub fn announced_port(&self, source_port: u16) -> Option<u16> {
        match self {
            Query::AnnouncePeer {
                implied_port, port, ..
            } => {
                if *implied_port {
                    Some(source_port)
                } else {
                    *port
                }
            }
            _ => None,
        }
    }
}

/// The reply payloads for the four methods.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Ping {
        id: NodeId,
    },
    FindNode {
        id: NodeId,
        nodes: Vec<CompactNode>,
    },
    GetPeers {
        id: NodeId,
        token: Vec<u8>,
        nodes: Option<Vec<CompactNode>>,
        values: Option<Vec<CompactPeer>>,
    },
    AnnouncePeer {
        id: NodeId,
    },
}

impl Reply {
    pub fn id(&self) -> NodeId {
        match self {
            Reply::Ping { id }
            | Reply::FindNode { id, .. }
            | Reply::GetPeers { id, .. }
            | Reply::AnnouncePeer { id } => *id,
        }
    }
}

/// A fully decoded inbound datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Query {
        transaction_id: Vec<u8>,
        query: Query,
    },
    Reply {
        transaction_id: Vec<u8>,
        reply: Reply,
    },
    Error {
        transaction_id: Vec<u8>,
        code: i64,
        message: String,
    },
}

impl Message {
    pub fn transaction_id(&self) -> &[u8] {
        match self {
            Message::Query { transaction_id, .. }
            | Message::Reply { transaction_id, .. }
            | Message::Error { transaction_id, .. } => transaction_id,
        }
    }
}

// --- dict accessor helpers -------------------------------------------------

fn get<'a>(
    dict: &'a HashMap<Vec<u8>, BencodeValue>,
    key: &'static str,
) -> ProtocolResult<&'a BencodeValue> {
    dict.get(key.as_bytes())
        .ok_or(ProtocolError::MissingField(key))
}

fn get_bytes<'a>(
    dict: &'a HashMap<Vec<u8>, BencodeValue>,
    key: &'static str,
) -> ProtocolResult<&'a [u8]> {
    get(dict, key)?
        .as_bytes()
        .ok_or(ProtocolError::InvalidFieldType(key))
}

fn get_node_id(
    dict: &HashMap<Vec<u8>, BencodeValue>,
    key: &'static str,
) -> ProtocolResult<NodeId> {
    NodeId::from_slice(get_bytes(dict, key)?).ok_or(ProtocolError::InvalidFieldType(key))
}

fn get_int(dict: &HashMap<Vec<u8>, BencodeValue>, key: &'static str) -> ProtocolResult<i64> {
    get(dict, key)?
        .as_int()
        .ok_or(ProtocolError::InvalidFieldType(key))
}

fn dict_of(fields: Vec<(&str, BencodeValue)>) -> BencodeValue {
    let mut map = HashMap::with_capacity(fields.len());
    for (k, v) in fields {
        map.insert(k.as_bytes().to_vec(), v);
    }
    BencodeValue::Dict(map)
}

// --- query (de)serialization ------------------------------------------------

fn args_dict(query: &Query) -> BencodeValue {
    match query {
        Query::Ping { id } => dict_of(vec![("id", BencodeValue::bytes(id.as_bytes().to_vec()))]),
        Query::FindNode { id, target } => dict_of(vec![
            ("id", BencodeValue::bytes(id.as_bytes().to_vec())),
            ("target", BencodeValue::bytes(target.as_bytes().to_vec())),
        ]),
        Query::GetPeers { id, info_hash } => dict_of(vec![
            ("id", BencodeValue::bytes(id.as_bytes().to_vec())),
            ("info_hash", BencodeValue::bytes(info_hash.as_bytes().to_vec())),
        ]),
        Query::AnnouncePeer {
            id,
            info_hash,
            token,
            implied_port,
            port,
        } => {
            let mut fields = vec![
                ("id", BencodeValue::bytes(id.as_bytes().to_vec())),
                ("info_hash", BencodeValue::bytes(info_hash.as_bytes().to_vec())),
                ("token", BencodeValue::bytes(token.clone())),
                ("implied_port", BencodeValue::Int(*implied_port as i64)),
            ];
            if let Some(port) = port {
                fields.push(("port", BencodeValue::Int(*port as i64)));
            }
            dict_of(fields)
        }
    }
}

fn parse_query(method: &[u8], args: &HashMap<Vec<u8>, BencodeValue>) -> ProtocolResult<Query> {
    match method {
        b"ping" => Ok(Query::Ping {
            id: get_node_id(args, "id")?,
        }),
        b"find_node" => Ok(Query::FindNode {
            id: get_node_id(args, "id")?,
            target: get_node_id(args, "target")?,
        }),
        b"get_peers" => Ok(Query::GetPeers {
            id: get_node_id(args, "id")?,
            info_hash: get_node_id(args, "info_hash")?,
        }),
        b"announce_peer" => {
            let implied_port = args
                .get(&b"implied_port"[..].to_vec())
                .and_then(BencodeValue::as_int)
                .unwrap_or(0)
                != 0;
            let port = if implied_port {
                None
            } else {
                Some(get_int(args, "port")? as u16)
            };
            Ok(Query::AnnouncePeer {
                id: get_node_id(args, "id")?,
                info_hash: get_node_id(args, "info_hash")?,
                token: get_bytes(args, "token")?.to_vec(),
                implied_port,
                port,
            })
        }
        other => Err(ProtocolError::UnknownMethod(
            String::from_utf8_lossy(other).into_owned(),
        )),
    }
}

// --- reply (de)serialization ------------------------------------------------

fn reply_dict(reply: &Reply) -> BencodeValue {
    match reply {
        Reply::Ping { id } | Reply::AnnouncePeer { id } => {
            dict_of(vec![("id", BencodeValue::bytes(id.as_bytes().to_vec()))])
        }
        Reply::FindNode { id, nodes } => dict_of(vec![
            ("id", BencodeValue::bytes(id.as_bytes().to_vec())),
            ("nodes", BencodeValue::bytes(CompactNode::encode_list(nodes))),
        ]),
        Reply::GetPeers {
            id,
            token,
            nodes,
            values,
        } => {
            let mut fields = vec![
                ("id", BencodeValue::bytes(id.as_bytes().to_vec())),
                ("token", BencodeValue::bytes(token.clone())),
            ];
            if let Some(values) = values {
                let list = CompactPeer::encode_list(values)
                    .into_iter()
                    .map(BencodeValue::bytes)
                    .collect();
                fields.push(("values", BencodeValue::List(list)));
            } else if let Some(nodes) = nodes {
                fields.push(("nodes", BencodeValue::bytes(CompactNode::encode_list(nodes))));
            }
            dict_of(fields)
        }
    }
}

fn parse_reply(
    r: &HashMap<Vec<u8>, BencodeValue>,
    method_hint: Option<&[u8]>,
) -> ProtocolResult<Reply> {
    let id = get_node_id(r, "id")?;
    let has_token = r.contains_key(&b"token"[..].to_vec());
    let has_nodes = r.contains_key(&b"nodes"[..].to_vec());
    let has_values = r.contains_key(&b"values"[..].to_vec());

    // Replies carry no method name of their own; the caller's method
    // hint (from the outstanding transaction) disambiguates `ping`
    // from `announce_peer`, both of which reply with only `id`.
    if has_token || has_values || has_nodes {
        let token = if has_token {
            get_bytes(r, "token")?.to_vec()
        } else {
            Vec::new()
        };
        let nodes = if has_nodes {
            Some(CompactNode::decode_list(get_bytes(r, "nodes")?)?)
        } else {
            None
        };
        let values = if has_values {
            let list = get(r, "values")?
                .as_list()
                .ok_or(ProtocolError::InvalidFieldType("values"))?;
            let mut peers = Vec::with_capacity(list.len());
            for item in list {
                let bytes = item.as_bytes().ok_or(ProtocolError::InvalidFieldType("values"))?;
                peers.push(CompactPeer::decode_one(bytes)?);
            }
            Some(peers)
        } else {
            None
        };
        if has_token {
            return Ok(Reply::GetPeers {
                id,
                token,
                nodes,
                values,
            });
        }
        if let Some(nodes) = nodes {
            return Ok(Reply::FindNode { id, nodes });
        }
    }

    match method_hint {
        Some(b"announce_peer") => Ok(Reply::AnnouncePeer { id }),
        _ => Ok(Reply::Ping { id }),
    }
}

// --- envelope encode/decode --------------------------------------------------

#[tracing::instrument(skip(query), level = "trace")]
pub fn encode_query(transaction_id: &[u8], query: &Query) -> ProtocolResult<Vec<u8>> {
    let envelope = dict_of(vec![
        ("t", BencodeValue::bytes(transaction_id.to_vec())),
        ("y", BencodeValue::bytes(&b"q"[..])),
        ("q", BencodeValue::bytes(query.method_name())),
        ("a", args_dict(query)),
    ]);
    Ok(bencode::encode(&envelope)?)
}

#[tracing::instrument(skip(reply), level = "trace")]
pub fn encode_reply(transaction_id: &[u8], reply: &Reply) -> ProtocolResult<Vec<u8>> {
    let envelope = dict_of(vec![
        ("t", BencodeValue::bytes(transaction_id.to_vec())),
        ("y", BencodeValue::bytes(&b"r"[..])),
        ("r", reply_dict(reply)),
    ]);
    Ok(bencode::encode(&envelope)?)
}

#[tracing::instrument(level = "trace")]
pub fn encode_error(transaction_id: &[u8], code: i64, message: &str) -> ProtocolResult<Vec<u8>> {
    let envelope = dict_of(vec![
        ("t", BencodeValue::bytes(transaction_id.to_vec())),
        ("y", BencodeValue::bytes(&b"e"[..])),
        (
            "e",
            BencodeValue::List(vec![
                BencodeValue::Int(code),
                BencodeValue::bytes(message.as_bytes().to_vec()),
            ]),
        ),
    ]);
    Ok(bencode::encode(&envelope)?)
}

/// Decodes a raw datagram into a [`Message`].
///
/// `method_hint` supplies the method name of the outstanding
/// transaction a reply is expected to belong to, since a `"r"`
/// envelope does not itself say which query it is answering — without
/// it a bare `{id: ...}` reply to `announce_peer` cannot be told apart
/// from one to `ping`.
#[tracing::instrument(skip(data), level = "trace")]
pub fn decode_message(data: &[u8], method_hint: Option<&[u8]>) -> ProtocolResult<Message> {
    let term = bencode::decode(data)?;
    let dict = term.into_dict().ok_or(ProtocolError::UnexpectedKind)?;

    let transaction_id = get_bytes(&dict, "t")?.to_vec();
    let kind = get_bytes(&dict, "y")?;

    match kind {
        b"q" => {
            let method = get_bytes(&dict, "q")?.to_vec();
            let args = get(&dict, "a")?
                .as_dict()
                .ok_or(ProtocolError::InvalidFieldType("a"))?;
            let query = parse_query(&method, args)?;
            Ok(Message::Query {
                transaction_id,
                query,
            })
        }
        b"r" => {
            let r = get(&dict, "r")?
                .as_dict()
                .ok_or(ProtocolError::InvalidFieldType("r"))?;
            let reply = parse_reply(r, method_hint)?;
            Ok(Message::Reply {
                transaction_id,
                reply,
            })
        }
        b"e" => {
            let e = get(&dict, "e")?
                .as_list()
                .ok_or(ProtocolError::InvalidFieldType("e"))?;
            if e.len() < 2 {
                return Err(ProtocolError::InvalidFieldType("e"));
            }
            let code = e[0].as_int().ok_or(ProtocolError::InvalidFieldType("e"))?;
            let message = e[1]
                .as_bytes()
                .map(|b| String::from_utf8_lossy(b).into_owned())
                .ok_or(ProtocolError::InvalidFieldType("e"))?;
            Ok(Message::Error {
                transaction_id,
                code,
                message,
            })
        }
        _ => Err(ProtocolError::UnexpectedKind),
    }
}

/// Extracts just the transaction id from a raw datagram, without
/// committing to a full parse of the rest of the envelope.
///
/// The engine needs `t` before it can decide which outstanding
/// transaction's method hint (if any) to feed back into
/// [`decode_message`], so this is a cheaper first pass over the same
/// bencode dict rather than decoding the whole message twice.
pub fn peek_transaction_id(data: &[u8]) -> Option<Vec<u8>> {
    let term = bencode::decode(data).ok()?;
    let dict = term.into_dict()?;
    get_bytes(&dict, "t").ok().map(|b| b.to_vec())
}

/// Helper for handlers: builds a `CompactNode` for the peer a query
/// arrived from, using the id the query claims and the UDP source
/// address observed by the engine (never the port the query argued
/// for — that only applies to `announce_peer`).
pub fn caller_node(id: NodeId, source: SocketAddrV4) -> CompactNode {
    CompactNode::new(id, source)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn encodes_ping_query_byte_for_byte() {
        let id = NodeId::from_slice(b"abcdefghij0123456789").unwrap();
        let bytes = encode_query(b"aa", &Query::Ping { id }).unwrap();
        assert_eq!(
            bytes,
            b"d1:ad2:id20:abcdefghij0123456789e1:q4:ping1:t2:aa1:y1:qe".to_vec()
        );
    }

    #[test]
    fn round_trips_find_node_query() {
        let id = NodeId::generate();
        let target = NodeId::generate();
        let query = Query::FindNode { id, target };
        let bytes = encode_query(b"t1", &query).unwrap();
        let decoded = decode_message(&bytes, None).unwrap();
        match decoded {
            Message::Query {
                transaction_id,
                query: decoded_query,
            } => {
                assert_eq!(transaction_id, b"t1");
                assert_eq!(decoded_query, query);
            }
            _ => panic!("expected query"),
        }
    }

    #[test]
    fn round_trips_get_peers_reply_with_values() {
        let id = NodeId::generate();
        let reply = Reply::GetPeers {
            id,
            token: b"tok".to_vec(),
            nodes: None,
            values: Some(vec![CompactPeer::new(SocketAddrV4::new(
                Ipv4Addr::new(1, 2, 3, 4),
                5150,
            ))]),
        };
        let bytes = encode_reply(b"t2", &reply).unwrap();
        let decoded = decode_message(&bytes, Some(b"get_peers")).unwrap();
        match decoded {
            Message::Reply {
                reply: decoded_reply,
                ..
            } => assert_eq!(decoded_reply, reply),
            _ => panic!("expected reply"),
        }
    }

    #[test]
    fn round_trips_remote_error() {
        let bytes = encode_error(b"t3", 201, "generic error").unwrap();
        let decoded = decode_message(&bytes, None).unwrap();
        match decoded {
            Message::Error {
                code, message, ..
            } => {
                assert_eq!(code, 201);
                assert_eq!(message, "generic error");
            }
            _ => panic!("expected error"),
        }
    }

    #[test]
    fn announce_peer_implied_port_uses_source_port() {
        let query = Query::AnnouncePeer {
            id: NodeId::generate(),
            info_hash: NodeId::generate(),
            token: b"tok".to_vec(),
            implied_port: true,
            port: None,
        };
        assert_eq!(query.announced_port(6881), Some(6881));
    }
}
