//! Compact node and peer encodings: the fixed-layout 26- and 6-byte
//! records embedded in `nodes` and `values` bencode strings.
//!
//! Only IPv4 is supported (see Non-goals) — the compact form is
//! always exactly 4 octets of address plus 2 octets of big-endian
//! port.
use crate::node_id::{NodeId, ID_LEN};
use std::net::{Ipv4Addr, SocketAddrV4};

use super::ProtocolError;

/// Wire size of one compact node record: 20-byte id + 4-byte IPv4 +
/// 2-byte port.
pub const NODE_LEN: usize = ID_LEN + 6;
/// Wire size of one compact peer record: 4-byte IPv4 + 2-byte port.
pub const PEER_LEN: usize = 6;

/// A `(NodeId, Address)` pair as carried in a `nodes` compact list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactNode {
    pub id: NodeId,
    pub addr: SocketAddrV4,
}

impl CompactNode {
    pub fn new(id: NodeId, addr: SocketAddrV4) -> Self {
        CompactNode { id, addr }
    }

    pub fn to_bytes(&self) -> [u8; NODE_LEN] {
        let mut buf = [0u8; NODE_LEN];
        buf[..ID_LEN].copy_from_slice(self.id.as_bytes());
        buf[ID_LEN..ID_LEN + 4].copy_from_slice(&self.addr.ip().octets());
        buf[ID_LEN + 4..].copy_from_slice(&self.addr.port().to_be_bytes());
        buf
    }

    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() != NODE_LEN {
            return None;
        }
        let id = NodeId::from_slice(&data[..ID_LEN])?;
        let ip = Ipv4Addr::new(data[ID_LEN], data[ID_LEN + 1], data[ID_LEN + 2], data[ID_LEN + 3]);
        let port = u16::from_be_bytes([data[ID_LEN + 4], data[ID_LEN + 5]]);
        Some(CompactNode::new(id, SocketAddrV4::new(ip, port)))
    }

    /// Concatenates a slice of nodes into their compact wire form.
    pub fn encode_list(nodes: &[CompactNode]) -> Vec<u8> {
        let mut buf = Vec::with_capacity(nodes.len() * NODE_LEN);
        for node in nodes {
            buf.extend_from_slice(&node.to_bytes());
        }
        buf
    }

    /// Splits a `nodes` bencode string into individual compact nodes.
    /// Errors if the input length is not a multiple of 26.
    pub fn decode_list(data: &[u8]) -> Result<Vec<CompactNode>, ProtocolError> {
        if data.len() % NODE_LEN != 0 {
            return Err(ProtocolError::InvalidCompactLength("nodes"));
        }
        Ok(data
            .chunks_exact(NODE_LEN)
            .map(|chunk| CompactNode::from_bytes(chunk).expect("chunk is exactly NODE_LEN"))
            .collect())
    }
}

/// A bare `(Address)` pair as carried in a `values` compact list —
/// the last six bytes of a `CompactNode`'s wire form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactPeer {
    pub addr: SocketAddrV4,
}

impl CompactPeer {
    pub fn new(addr: SocketAddrV4) -> Self {
        CompactPeer { addr }
    }

    pub fn to_bytes(&self) -> [u8; PEER_LEN] {
        let mut buf = [0u8; PEER_LEN];
        buf[..4].copy_from_slice(&self.addr.ip().octets());
        buf[4..].copy_from_slice(&self.addr.port().to_be_bytes());
        buf
    }

    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() != PEER_LEN {
            return None;
        }
        let ip = Ipv4Addr::new(data[0], data[1], data[2], data[3]);
        let port = u16::from_be_bytes([data[4], data[5]]);
        Some(CompactPeer::new(SocketAddrV4::new(ip, port)))
    }

    pub fn encode_list(peers: &[CompactPeer]) -> Vec<Vec<u8>> {
        peers.iter().map(|p| p.to_bytes().to_vec()).collect()
    }

    pub fn decode_one(data: &[u8]) -> Result<CompactPeer, ProtocolError> {
        CompactPeer::from_bytes(data).ok_or(ProtocolError::InvalidCompactLength("peer"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compact_node_round_trips() {
        let node = CompactNode::new(
            NodeId::from_bytes([b'A'; ID_LEN]),
            SocketAddrV4::new(Ipv4Addr::new(192, 168, 0, 1), 0x1AE1),
        );
        let bytes = node.to_bytes();
        assert_eq!(CompactNode::from_bytes(&bytes), Some(node));
    }

    #[test]
    fn parses_compact_node_with_known_layout() {
        let mut raw = vec![b'A'; ID_LEN];
        raw.extend_from_slice(&[192, 168, 0, 1]);
        raw.extend_from_slice(&[0x1A, 0xE1]);
        let node = CompactNode::from_bytes(&raw).unwrap();
        assert_eq!(node.id, NodeId::from_bytes([b'A'; ID_LEN]));
        assert_eq!(node.addr.to_string(), "192.168.0.1:6881");
    }

    #[test]
    fn rejects_non_multiple_of_26() {
        let data = vec![0u8; NODE_LEN + 1];
        assert!(CompactNode::decode_list(&data).is_err());
    }
}
