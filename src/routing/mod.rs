//! Kademlia routing table: an ordered sequence of buckets covering the
//! full 160-bit id space, each holding up to [`K`] contacts.
//!
//! Only the bucket containing this node's own id (the "home" bucket)
//! ever splits — every other bucket simply stops accepting new
//! contacts once full, per the standard Kademlia optimization for a
//! node that only cares about its own neighborhood in detail.
use std::net::SocketAddrV4;
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::node_id::{midpoint, NodeId, UpperBound};
use crate::protocol::CompactNode;

/// Contacts per bucket.
pub const K: usize = 8;
/// Consecutive failed calls before a node is considered bad and
/// evictable.
pub const MAX_FAIL_TIMES: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeStatus {
    Good,
    Bad,
}

/// One routing table contact.
#[derive(Debug, Clone)]
pub struct Node {
    pub id: NodeId,
    pub addr: SocketAddrV4,
    pub last_active: Instant,
    pub fail_times: u32,
    pub status: NodeStatus,
    /// Marks the sentinel entry seeded into the root bucket for this
    /// node's own id — never returned from a query, never evicted.
    pub is_self: bool,
}

impl Node {
    fn new(id: NodeId, addr: SocketAddrV4) -> Self {
        Node {
            id,
            addr,
            last_active: Instant::now(),
            fail_times: 0,
            status: NodeStatus::Good,
            is_self: false,
        }
    }

    fn touch(&mut self) {
        self.last_active = Instant::now();
        self.fail_times = 0;
        self.status = NodeStatus::Good;
    }

    fn fail(&mut self) {
        self.fail_times += 1;
        if self.fail_times >= MAX_FAIL_TIMES {
            self.status = NodeStatus::Bad;
        }
    }

    pub fn as_compact(&self) -> CompactNode {
        CompactNode::new(self.id, self.addr)
    }
}

struct Bucket {
    nodes: Vec<Node>,
    min: NodeId,
    max: UpperBound,
    last_active: Instant,
}

impl Bucket {
    fn root(self_id: NodeId) -> Self {
        let mut node = Node::new(self_id, SocketAddrV4::new(std::net::Ipv4Addr::UNSPECIFIED, 0));
        node.is_self = true;
        Bucket {
            nodes: vec![node],
            min: NodeId::ZERO,
            max: UpperBound::Unbounded,
            last_active: Instant::now(),
        }
    }

    fn in_range(&self, id: &NodeId) -> bool {
        *id >= self.min && self.max.contains(id)
    }

    fn is_full(&self) -> bool {
        self.nodes.len() >= K
    }

    fn contains_id(&self, id: &NodeId) -> bool {
        self.nodes.iter().any(|n| &n.id == id)
    }

    /// Inserts or refreshes a contact. Returns `true` if the bucket
    /// now holds (or already held) the node, `false` if it was full
    /// of good nodes and had no room.
    fn insert(&mut self, id: NodeId, addr: SocketAddrV4) -> bool {
        if let Some(existing) = self.nodes.iter_mut().find(|n| n.id == id) {
            existing.addr = addr;
            existing.touch();
            self.last_active = Instant::now();
            return true;
        }
        if self.nodes.len() < K {
            self.nodes.push(Node::new(id, addr));
            self.last_active = Instant::now();
            return true;
        }
        // Full: evict the first bad contact to make room, if any.
        if let Some(pos) = self
            .nodes
            .iter()
            .position(|n| !n.is_self && n.status == NodeStatus::Bad)
        {
            self.nodes[pos] = Node::new(id, addr);
            self.last_active = Instant::now();
            return true;
        }
        false
    }

    fn fail(&mut self, id: &NodeId) {
        if let Some(node) = self.nodes.iter_mut().find(|n| &n.id == id && !n.is_self) {
            node.fail();
        }
    }
}

/// A Kademlia routing table rooted at a single node's own id.
///
/// The buckets vector is always kept sorted by `min` so bucket lookup
/// and the left/right fan-out used by [`RoutingTable::closest_nodes`]
/// can walk it as an ordered sequence.
pub struct RoutingTable {
    self_id: NodeId,
    buckets: Vec<Bucket>,
}

impl RoutingTable {
    pub fn new(self_id: NodeId) -> Self {
        RoutingTable {
            self_id,
            buckets: vec![Bucket::root(self_id)],
        }
    }

    fn find_bucket_index(&self, id: &NodeId) -> usize {
        self.buckets
            .iter()
            .position(|b| b.in_range(id))
            .expect("buckets cover the full id space")
    }

    /// Splits the bucket at `idx` at its midpoint, inserting the new
    /// right-hand bucket immediately after it. Only ever called on the
    /// home bucket (the one containing `self_id`).
    fn split_bucket(&mut self, idx: usize) {
        let bucket = &self.buckets[idx];
        let mid = midpoint(&bucket.min, &bucket.max);
        let (left_nodes, right_nodes): (Vec<Node>, Vec<Node>) =
            bucket.nodes.iter().cloned().partition(|n| n.id < mid);

        let right = Bucket {
            nodes: right_nodes,
            min: mid,
            max: bucket.max,
            last_active: Instant::now(),
        };
        let left = &mut self.buckets[idx];
        left.nodes = left_nodes;
        left.max = UpperBound::Finite(mid);
        left.last_active = Instant::now();

        self.buckets.insert(idx + 1, right);
        debug!(bucket_count = self.buckets.len(), "split home bucket");
    }

    /// Inserts or refreshes a contact, recursively splitting the home
    /// bucket as needed to make room.
    #[tracing::instrument(skip(self), fields(id = %id))]
    pub fn insert(&mut self, id: NodeId, addr: SocketAddrV4) {
        if id == self.self_id {
            return;
        }
        loop {
            let idx = self.find_bucket_index(&id);
            if self.buckets[idx].insert(id, addr) {
                return;
            }
            // Bucket is full of good contacts. Only the bucket holding
            // our own id is ever allowed to grow past K by splitting.
            if !self.buckets[idx].in_range(&self.self_id) {
                trace!("dropping contact, bucket full and not splittable");
                return;
            }
            self.split_bucket(idx);
        }
    }

    /// Records a failed call to `id`, marking it bad after
    /// [`MAX_FAIL_TIMES`] consecutive failures.
    pub fn fail(&mut self, id: &NodeId) {
        let idx = self.find_bucket_index(id);
        self.buckets[idx].fail(id);
    }

    /// Number of contacts across all buckets, excluding the self
    /// sentinel seeded into the root bucket.
    pub fn len(&self) -> usize {
        self.buckets
            .iter()
            .map(|b| b.nodes.iter().filter(|n| !n.is_self).count())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        let idx = self.find_bucket_index(id);
        self.buckets[idx].contains_id(id)
    }

    pub fn get(&self, id: &NodeId) -> Option<&Node> {
        let idx = self.find_bucket_index(id);
        self.buckets[idx].nodes.iter().find(|n| &n.id == id)
    }

    /// Returns the contact for `id` itself, if this table already
    /// knows it exactly (distinct from `closest_nodes`, which never
    /// includes the id it was asked to find neighbors of).
    pub fn find_exact(&self, id: &NodeId) -> Option<Node> {
        if *id == self.self_id {
            return None;
        }
        let idx = self.find_bucket_index(id);
        self.buckets[idx]
            .nodes
            .iter()
            .find(|n| &n.id == id && !n.is_self)
            .cloned()
    }

    /// Returns up to `K` of the contacts closest to `target` by XOR
    /// distance, excluding `target` itself and the self sentinel,
    /// fanning outward from target's home bucket until enough
    /// candidates are gathered.
    #[tracing::instrument(skip(self), fields(target = %target))]
    pub fn closest_nodes(&self, target: &NodeId) -> Vec<Node> {
        let home = self.find_bucket_index(target);
        let mut candidates: Vec<Node> = Vec::new();
        let (mut left, mut right) = (home as isize - 1, home + 1);

        for node in &self.buckets[home].nodes {
            if &node.id != target && !node.is_self {
                candidates.push(node.clone());
            }
        }
        while candidates.len() < K && (left >= 0 || right < self.buckets.len()) {
            if left >= 0 {
                for node in &self.buckets[left as usize].nodes {
                    if !node.is_self {
                        candidates.push(node.clone());
                    }
                }
                left -= 1;
            }
            if candidates.len() >= K {
                break;
            }
            if right < self.buckets.len() {
                for node in &self.buckets[right].nodes {
                    if !node.is_self {
                        candidates.push(node.clone());
                    }
                }
                right += 1;
            }
        }

        candidates.sort_by_key(|n| n.id.distance(target));
        candidates.truncate(K);
        candidates
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn addr(port: u16) -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::new(127, 0, 0, 1), port)
    }

    fn id_with_first_byte(b: u8) -> NodeId {
        let mut bytes = [0u8; 20];
        bytes[0] = b;
        NodeId::from_bytes(bytes)
    }

    #[test]
    fn inserts_and_finds_a_node() {
        let mut table = RoutingTable::new(id_with_first_byte(0x00));
        let id = id_with_first_byte(0x10);
        table.insert(id, addr(1));
        assert!(table.contains(&id));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn ignores_inserting_self() {
        let self_id = id_with_first_byte(0x00);
        let mut table = RoutingTable::new(self_id);
        table.insert(self_id, addr(1));
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn splits_home_bucket_when_full_and_still_inserts() {
        // Six ids below the midpoint (top bit 0, same half as
        // self=ZERO) and six above it (top bit 1): the root bucket
        // fills to K with entries from both halves, so the single
        // split this forces divides them roughly in two instead of
        // cascading, since ids clustered entirely on one side of
        // every successive midpoint would keep re-splitting the home
        // bucket down to their shared prefix.
        let self_id = NodeId::ZERO;
        let mut table = RoutingTable::new(self_id);
        for i in 0..6u8 {
            let mut bytes = [0u8; 20];
            bytes[0] = i + 1;
            table.insert(NodeId::from_bytes(bytes), addr(1000 + i as u16));
        }
        for i in 0..6u8 {
            let mut bytes = [0u8; 20];
            bytes[0] = 0x90 + i;
            table.insert(NodeId::from_bytes(bytes), addr(1010 + i as u16));
        }
        assert_eq!(table.bucket_count(), 2);
        assert_eq!(table.len(), K + 4);
    }

    #[test]
    fn does_not_split_non_home_bucket() {
        let self_id = id_with_first_byte(0x00);
        let mut table = RoutingTable::new(self_id);
        // self_id is 0x00.., so these ids (spread across the upper
        // half rather than clustered under one shared prefix) all
        // sit above the midpoint and, once the root bucket splits
        // once (forced by the 8th of them arriving while the bucket
        // still holds the self sentinel), land together in a single
        // non-home bucket that never splits again no matter how full
        // it gets.
        let mut far = Vec::new();
        for i in 0..(K as u8 + 1) {
            let mut bytes = [0u8; 20];
            bytes[0] = 0x80 + i * 12;
            far.push(NodeId::from_bytes(bytes));
        }
        for (i, id) in far.iter().enumerate() {
            table.insert(*id, addr(2000 + i as u16));
        }
        assert_eq!(table.len(), K, "9th far contact should have been dropped");

        let before = table.bucket_count();
        let mut extra = [0u8; 20];
        extra[0] = 0xf0;
        table.insert(NodeId::from_bytes(extra), addr(3000));
        assert_eq!(table.bucket_count(), before);
        assert_eq!(table.len(), K);
    }

    #[test]
    fn fail_marks_node_bad_after_max_fail_times() {
        let self_id = id_with_first_byte(0x00);
        let mut table = RoutingTable::new(self_id);
        let id = id_with_first_byte(0x10);
        table.insert(id, addr(1));
        for _ in 0..MAX_FAIL_TIMES {
            table.fail(&id);
        }
        assert_eq!(table.get(&id).unwrap().status, NodeStatus::Bad);
    }

    #[test]
    fn closest_nodes_excludes_target_and_orders_by_distance() {
        let self_id = id_with_first_byte(0x00);
        let mut table = RoutingTable::new(self_id);
        let target = id_with_first_byte(0x50);
        table.insert(target, addr(1));
        table.insert(id_with_first_byte(0x51), addr(2));
        table.insert(id_with_first_byte(0x70), addr(3));

        let closest = table.closest_nodes(&target);
        assert!(closest.iter().all(|n| n.id != target));
        assert!(closest[0].id.distance(&target) <= closest[1].id.distance(&target));
    }
}
