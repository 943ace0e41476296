use md5::{Digest, Md5};
use std::collections::BTreeMap;

/// A node identifier in the distributed cache.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub String);

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        NodeId(s.to_string())
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        NodeId(s)
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One entry on the ring: a 32-bit slot and the node it was inserted for.
/// Kept as a `Vec` alongside a `BTreeMap` index so ringSlot collisions keep
/// first-insertion order instead of silently clobbering each other.
struct Slot {
    hash: u32,
    node: NodeId,
}

/// Consistent-hash ring used to place keys onto a subset of live nodes.
///
/// The hash function is a protocol detail, not an implementation choice: it
/// must be the first 8 hex characters of the MD5 digest, reduced to a u32,
/// because every node in the cluster derives placement independently and
/// must agree bit-for-bit.
pub struct HashRing {
    /// ringSlot -> index into `slots`, kept sorted for the circular scan.
    index: BTreeMap<u32, usize>,
    slots: Vec<Slot>,
    replicas: usize,
    nodes: Vec<NodeId>,
}

impl HashRing {
    /// Create a new hash ring with `replicas` virtual slots per physical node.
    pub fn new(replicas: usize) -> Self {
        HashRing {
            index: BTreeMap::new(),
            slots: Vec::new(),
            replicas,
            nodes: Vec::new(),
        }
    }

    /// Reduce an MD5 digest of `value` to a 32-bit slot, taking the first 8
    /// hex characters (the high 4 bytes of the digest) as a big-endian u32.
    pub fn hash32(value: &str) -> u32 {
        let mut hasher = Md5::new();
        hasher.update(value.as_bytes());
        let digest = hasher.finalize();
        u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]])
    }

    /// Add a node to the ring, creating exactly `replicas` virtual slots.
    /// A no-op if the node is already present.
    pub fn add_node(&mut self, node: NodeId) {
        if self.nodes.contains(&node) {
            return;
        }

        for i in 0..self.replicas {
            let virtual_key = format!("{}:{}", node.0, i);
            let hash = Self::hash32(&virtual_key);
            let idx = self.slots.len();
            self.slots.push(Slot {
                hash,
                node: node.clone(),
            });
            // first-inserted wins on lookup: only index the slot if no
            // earlier slot already claimed this exact hash.
            self.index.entry(hash).or_insert(idx);
        }

        self.nodes.push(node);
    }

    /// Remove a node and exactly its `replicas` virtual slots.
    pub fn remove_node(&mut self, node: &NodeId) {
        if !self.nodes.contains(node) {
            return;
        }

        self.slots.retain(|s| &s.node != node);
        self.nodes.retain(|n| n != node);

        // Rebuild the index: slot vector indices shifted after retain, and
        // first-insertion order must be preserved among the survivors.
        self.index.clear();
        for (idx, slot) in self.slots.iter().enumerate() {
            self.index.entry(slot.hash).or_insert(idx);
        }
    }

    /// The primary node responsible for `key`, or `None` if the ring is empty.
    pub fn primary_for(&self, key: &str) -> Option<&NodeId> {
        if self.index.is_empty() {
            return None;
        }

        let hash = Self::hash32(key);
        let idx = self
            .index
            .range(hash..)
            .next()
            .or_else(|| self.index.iter().next())
            .map(|(_, &idx)| idx)?;

        Some(&self.slots[idx].node)
    }

    /// Up to `count` distinct replica nodes for `key`, walking the ring
    /// clockwise from the key's hash and wrapping once.
    pub fn replicas_for(&self, key: &str, count: usize) -> Vec<NodeId> {
        if self.index.is_empty() || count == 0 {
            return Vec::new();
        }

        let hash = Self::hash32(key);
        let mut replicas = Vec::new();
        let mut seen = std::collections::HashSet::new();

        let after = self.index.range(hash..).map(|(_, &idx)| idx);
        let wrapped = self.index.range(..hash).map(|(_, &idx)| idx);

        for idx in after.chain(wrapped) {
            let node = &self.slots[idx].node;
            if seen.insert(node.clone()) {
                replicas.push(node.clone());
                if replicas.len() >= count.min(self.nodes.len()) {
                    break;
                }
            }
        }

        replicas
    }

    /// All physical nodes currently on the ring.
    pub fn members(&self) -> Vec<NodeId> {
        self.nodes.clone()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash32_matches_known_md5_prefix() {
        // md5("node-1:0") = a prefix we can check deterministically without
        // trusting our own hashing code to validate itself.
        let digest_hex = format!("{:x}", Md5::digest(b"node-1:0"));
        let expected = u32::from_str_radix(&digest_hex[0..8], 16).unwrap();
        assert_eq!(HashRing::hash32("node-1:0"), expected);
    }

    #[test]
    fn add_then_remove_restores_empty_ring() {
        let mut ring = HashRing::new(100);
        ring.add_node("a".into());
        ring.add_node("b".into());
        ring.remove_node(&"a".into());
        ring.remove_node(&"b".into());

        assert!(ring.is_empty());
        assert!(ring.slots.is_empty());
        assert!(ring.index.is_empty());
    }

    #[test]
    fn replicas_for_are_unique_and_deterministic() {
        let mut ring = HashRing::new(100);
        ring.add_node("a".into());
        ring.add_node("b".into());
        ring.add_node("c".into());

        let r1 = ring.replicas_for("some-key", 3);
        let r2 = ring.replicas_for("some-key", 3);
        assert_eq!(r1, r2);
        assert_eq!(r1.len(), 3);

        let unique: std::collections::HashSet<_> = r1.iter().collect();
        assert_eq!(unique.len(), r1.len());
    }

    #[test]
    fn replicas_for_caps_at_member_count() {
        let mut ring = HashRing::new(100);
        ring.add_node("only-node".into());

        let replicas = ring.replicas_for("k", 3);
        assert_eq!(replicas.len(), 1);
    }

    #[test]
    fn empty_ring_returns_none_and_empty_vec() {
        let ring = HashRing::new(100);
        assert_eq!(ring.primary_for("k"), None);
        assert_eq!(ring.replicas_for("k", 3), Vec::new());
    }

    #[test]
    fn distribution_is_roughly_even() {
        let mut ring = HashRing::new(150);
        ring.add_node("a".into());
        ring.add_node("b".into());
        ring.add_node("c".into());

        let mut counts = std::collections::HashMap::new();
        for i in 0..10_000 {
            let key = format!("key{}", i);
            if let Some(node) = ring.primary_for(&key) {
                *counts.entry(node.clone()).or_insert(0) += 1;
            }
        }

        for (_, count) in counts {
            let ratio = count as f64 / 10_000.0;
            assert!(ratio > 0.2 && ratio < 0.45, "skewed distribution: {}", ratio);
        }
    }

    #[test]
    fn adding_a_node_only_moves_a_minority_of_keys() {
        let mut ring = HashRing::new(150);
        ring.add_node("a".into());
        ring.add_node("b".into());
        ring.add_node("c".into());

        let before: Vec<_> = (0..1000)
            .map(|i| ring.primary_for(&format!("key{}", i)).cloned())
            .collect();

        ring.add_node("d".into());

        let moved = (0..1000)
            .filter(|&i| {
                ring.primary_for(&format!("key{}", i)).cloned() != before[i]
            })
            .count();

        let ratio = moved as f64 / 1000.0;
        assert!(ratio < 0.5, "too much churn on add: {}", ratio);
    }
}
