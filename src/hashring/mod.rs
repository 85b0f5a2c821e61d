//! Consistent hash ring over cache nodes.
//!
//! Grounded on the original Go `pkg/client/hashing.go`: node hash is the
//! first four bytes (big-endian) of `SHA-1(address)`, nodes are kept in a
//! `Vec` sorted by hash, and key lookup does a search for the first node
//! whose hash is `>=` the key's hash, wrapping to the first node if none
//! qualifies.

use sha1::{Digest, Sha1};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RingError {
    #[error("hash ring has no nodes")]
    Empty,
}

pub type Result<T> = std::result::Result<T, RingError>;

fn hash32(data: &str) -> u32 {
    let digest = Sha1::digest(data.as_bytes());
    u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]])
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RingNode {
    pub id: String,
    pub address: String,
    pub hash: u32,
}

impl RingNode {
    pub fn new(id: impl Into<String>, address: impl Into<String>) -> Self {
        let address = address.into();
        let hash = hash32(&address);
        Self {
            id: id.into(),
            address,
            hash,
        }
    }
}

/// Sorted-by-hash ring. Not internally synchronized: callers share it
/// behind an `Arc` and rebuild a new `Ring` on membership change rather
/// than mutating nodes in place, since membership changes are rare next to
/// the read-heavy `node_for` lookup path.
#[derive(Debug, Clone, Default)]
pub struct Ring {
    nodes: Vec<RingNode>,
}

impl Ring {
    pub fn new() -> Self {
        Self { nodes: Vec::new() }
    }

    pub fn from_nodes(mut nodes: Vec<RingNode>) -> Self {
        nodes.sort_by_key(|n| n.hash);
        Self { nodes }
    }

    pub fn add_node(&mut self, node: RingNode) {
        let pos = self.nodes.partition_point(|n| n.hash < node.hash);
        self.nodes.insert(pos, node);
    }

    pub fn remove_node(&mut self, id: &str) {
        self.nodes.retain(|n| n.id != id);
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn nodes(&self) -> &[RingNode] {
        &self.nodes
    }

    /// Find the node owning `key`: the first node with hash >= the key's
    /// hash, wrapping around to the first node in the ring.
    pub fn node_for(&self, key: &str) -> Result<&RingNode> {
        if self.nodes.is_empty() {
            return Err(RingError::Empty);
        }
        let key_hash = hash32(key);
        let pos = self.nodes.partition_point(|n| n.hash < key_hash);
        Ok(&self.nodes[if pos == self.nodes.len() { 0 } else { pos }])
    }
}
