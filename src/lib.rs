//! Library root for mldht: a Mainline DHT (BEP 5) node.
//!
//! `bencode` and `node_id` are the leaf layers; `protocol` builds typed
//! KRPC messages on top of `bencode`; `routing` and `token` are the
//! two pieces of per-node state; `krpc` ties a UDP socket, the
//! transaction registry and both of those together into a runnable
//! [`krpc::DhtNode`].
pub mod bencode;
pub mod krpc;
pub mod node_id;
pub mod protocol;
pub mod routing;
pub mod token;
