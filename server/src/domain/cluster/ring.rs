//! Consistent-hash ring mapping topic names onto cluster nodes.
//!
//! Every node derives the same ring from the same live-node list, so the set
//! of masters is a partition of topic names without coordination. FxHash is
//! deterministic across processes, which is all the placement needs.

use std::hash::Hasher as _;

use rustc_hash::FxHasher;

use crate::core::constants::RING_VNODES;

fn hash(key: &str) -> u64 {
    let mut hasher = FxHasher::default();
    hasher.write(key.as_bytes());
    hasher.finish()
}

/// Immutable ring over a set of node names. Rebuilt wholesale on topology
/// change.
#[derive(Debug, Clone)]
pub struct Ring {
    /// `(point, node index)` sorted by point.
    points: Vec<(u64, usize)>,
    nodes: Vec<String>,
}

impl Ring {
    pub fn new(nodes: &[String]) -> Ring {
        let mut nodes: Vec<String> = nodes.to_vec();
        nodes.sort();
        nodes.dedup();
        let mut points = Vec::with_capacity(nodes.len() * RING_VNODES);
        for (idx, node) in nodes.iter().enumerate() {
            for vnode in 0..RING_VNODES {
                points.push((hash(&format!("{}:{}", node, vnode)), idx));
            }
        }
        points.sort_unstable();
        Ring { points, nodes }
    }

    /// Node owning `key`. `None` only for an empty ring.
    pub fn get(&self, key: &str) -> Option<&str> {
        if self.points.is_empty() {
            return None;
        }
        let h = hash(key);
        let idx = match self.points.binary_search_by_key(&h, |(p, _)| *p) {
            Ok(i) => i,
            Err(i) if i == self.points.len() => 0,
            Err(i) => i,
        };
        Some(&self.nodes[self.points[idx].1])
    }

    pub fn nodes(&self) -> &[String] {
        &self.nodes
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

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_empty_ring() {
        let ring = Ring::new(&[]);
        assert!(ring.is_empty());
        assert_eq!(ring.get("grp1"), None);
    }

    #[test]
    fn test_single_node_owns_everything() {
        let ring = Ring::new(&names(&["n1"]));
        for key in ["grp1", "grp2", "usrAAAA", "p2pXYZ"] {
            assert_eq!(ring.get(key), Some("n1"));
        }
    }

    #[test]
    fn test_deterministic_across_instances() {
        let a = Ring::new(&names(&["n1", "n2", "n3"]));
        let b = Ring::new(&names(&["n3", "n1", "n2", "n2"]));
        for i in 0..200 {
            let key = format!("grp{}", i);
            assert_eq!(a.get(&key), b.get(&key));
        }
    }

    #[test]
    fn test_all_nodes_receive_keys() {
        let ring = Ring::new(&names(&["n1", "n2", "n3"]));
        let mut seen = std::collections::HashSet::new();
        for i in 0..500 {
            seen.insert(ring.get(&format!("grp{}", i)).unwrap().to_string());
        }
        assert_eq!(seen.len(), 3);
    }

    #[test]
    fn test_node_removal_moves_only_its_keys() {
        let full = Ring::new(&names(&["n1", "n2", "n3"]));
        let reduced = Ring::new(&names(&["n1", "n3"]));
        for i in 0..500 {
            let key = format!("grp{}", i);
            let before = full.get(&key).unwrap();
            let after = reduced.get(&key).unwrap();
            if before != "n2" {
                assert_eq!(before, after, "key {} moved needlessly", key);
            } else {
                assert_ne!(after, "n2");
            }
        }
    }
}
