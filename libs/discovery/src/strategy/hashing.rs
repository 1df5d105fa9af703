//! Key-affinity strategies: hash ring, modulo hash and rendezvous hashing
//!
//! All hashing uses CRC32 so results are stable across processes and
//! releases, which keeps client affinity intact across restarts.

use crate::registry::NodeSlot;

/// Stable 32-bit hash of a string
pub fn key_hash(key: &str) -> u32 {
    crc32fast::hash(key.as_bytes())
}

fn pair_hash(a: &str, b: &str) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(a.as_bytes());
    hasher.update(&[0xff]);
    hasher.update(b.as_bytes());
    hasher.finalize()
}

/// Client key hash modulo the candidate count
pub fn modulo_hash(len: usize, key: &str) -> usize {
    key_hash(key) as usize % len
}

/// Hash ring with `replicas` virtual points per node, rebuilt from the
/// current candidates
///
/// Removing a node only remaps keys that landed on its points.
pub fn consistent_hash(candidates: &[&NodeSlot], key: &str, replicas: usize) -> Option<usize> {
    if candidates.is_empty() {
        return None;
    }
    let mut ring: Vec<(u32, usize)> = Vec::with_capacity(candidates.len() * replicas.max(1));
    for (i, slot) in candidates.iter().enumerate() {
        for replica in 0..replicas.max(1) {
            ring.push((pair_hash(&slot.node.name, &replica.to_string()), i));
        }
    }
    // Ties on the hash resolve by candidate position, keeping lookups stable
    ring.sort_unstable();

    let point = key_hash(key);
    let at = ring.partition_point(|&(hash, _)| hash < point);
    let (_, index) = ring[at % ring.len()];
    Some(index)
}

/// Highest-random-weight: the node maximizing hash(key, node) wins
pub fn rendezvous(candidates: &[&NodeSlot], key: &str) -> Option<usize> {
    candidates
        .iter()
        .enumerate()
        .max_by_key(|(i, slot)| (pair_hash(key, &slot.node.name), std::cmp::Reverse(*i)))
        .map(|(i, _)| i)
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use crate::registry::NodeSlot;

    #[test]
    fn test_consistent_hash_is_deterministic() {
        let slots: Vec<NodeSlot> = (1..=5).map(slot).collect();
        let candidates = refs(&slots);
        let first = consistent_hash(&candidates, "user-42", 64);
        for _ in 0..1000 {
            assert_eq!(consistent_hash(&candidates, "user-42", 64), first);
        }
    }

    #[test]
    fn test_consistent_hash_limits_remapping() {
        let slots: Vec<NodeSlot> = (1..=5).map(slot).collect();
        let fewer: Vec<NodeSlot> = slots[..4].to_vec();
        let keys: Vec<String> = (0..500).map(|i| format!("client-{}", i)).collect();

        let mut moved = 0;
        for key in &keys {
            let before = consistent_hash(&refs(&slots), key, 64).unwrap();
            let after = consistent_hash(&refs(&fewer), key, 64).unwrap();
            let before_name = &slots[before].node.name;
            let after_name = &fewer[after].node.name;
            if before_name != after_name {
                // Only keys owned by the removed node may move
                assert_eq!(before_name, &slots[4].node.name);
                moved += 1;
            }
        }
        assert!(moved < keys.len() / 2);
    }

    #[test]
    fn test_modulo_and_rendezvous_are_stable() {
        let slots: Vec<NodeSlot> = (1..=3).map(slot).collect();
        let candidates = refs(&slots);
        assert_eq!(modulo_hash(3, "10.1.1.1"), modulo_hash(3, "10.1.1.1"));
        let pick = rendezvous(&candidates, "alice");
        assert!(pick.is_some());
        assert_eq!(rendezvous(&candidates, "alice"), pick);
        assert_eq!(rendezvous(&[], "alice"), None);
    }
}
