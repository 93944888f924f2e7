use std::collections::{HashMap, HashSet};
use std::fmt::Display;

use sha2::{Digest, Sha256};

/// Virtual nodes inserted per physical node unless configured otherwise.
pub const DEFAULT_REPLICAS: usize = 160;

/// 128-bit digest of `input` rendered as 32 lowercase hex characters.
///
/// Ring keys and lookup keys go through the same function, and ordering is a
/// plain string comparison on the result.
pub fn hash_key(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    hex::encode(&digest[..16])
}

/// Consistent hash ring mapping arbitrary keys onto physical nodes.
///
/// Each node owns `replicas` positions, keyed by `hash_key("{node}:{i}")`.
/// Lookups resolve to the *predecessor*: the greatest ring key that is
/// `<=` the hashed lookup key, wrapping to the greatest key overall when the
/// hash sorts below every ring key. Switching to successor lookup would move
/// ownership of every resource, so the rule is fixed.
///
/// `Clone` is a deep copy, which lets callers grow a ring node by node and
/// keep a snapshot at each size.
#[derive(Debug, Clone)]
pub struct HashRing<N> {
    replicas: usize,
    ring: HashMap<String, N>,
    /// Sorted ascending after every insertion.
    keys: Vec<String>,
    nodes: Vec<N>,
}

impl<N> HashRing<N>
where
    N: Display + Clone + PartialEq,
{
    pub fn new(replicas: usize) -> Self {
        Self {
            replicas,
            ring: HashMap::new(),
            keys: Vec::new(),
            nodes: Vec::new(),
        }
    }

    pub fn replicas(&self) -> usize {
        self.replicas
    }

    /// Physical nodes in insertion order.
    pub fn nodes(&self) -> &[N] {
        &self.nodes
    }

    /// Number of virtual-node keys on the ring.
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Insert `replicas` virtual nodes for `node`. Adding a node that is
    /// already present is a no-op.
    pub fn add_node(&mut self, node: N) {
        if self.nodes.contains(&node) {
            return;
        }
        for i in 0..self.replicas {
            let key = hash_key(&format!("{node}:{i}"));
            if self.ring.insert(key.clone(), node.clone()).is_none() {
                self.keys.push(key);
            }
        }
        self.keys.sort();
        self.nodes.push(node);
    }

    /// Drop every virtual node belonging to `node`.
    pub fn remove_node(&mut self, node: &N) {
        let mut removed = HashSet::with_capacity(self.replicas);
        for i in 0..self.replicas {
            let key = hash_key(&format!("{node}:{i}"));
            // only drop keys this node actually owns
            if self.ring.get(&key) == Some(node) {
                self.ring.remove(&key);
                removed.insert(key);
            }
        }
        self.keys.retain(|k| !removed.contains(k));
        self.nodes.retain(|n| n != node);
    }

    /// Resolve `key` to its owning node. `None` when the ring is empty.
    pub fn get_node(&self, key: &str) -> Option<&N> {
        let last = self.keys.last()?;
        let hashed = hash_key(key);
        // number of ring keys <= hashed; the predecessor sits just before it
        let idx = self.keys.partition_point(|k| k.as_str() <= hashed.as_str());
        let ring_key = match idx {
            0 => last,
            n => &self.keys[n - 1],
        };
        self.ring.get(ring_key)
    }
}

impl<N> Default for HashRing<N>
where
    N: Display + Clone + PartialEq,
{
    fn default() -> Self {
        Self::new(DEFAULT_REPLICAS)
    }
}
