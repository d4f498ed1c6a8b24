//! Consistent hash ring over the live judge endpoints

use md5::{Digest, Md5};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::{JudgeError, Result};

/// Virtual nodes per endpoint
pub const DEFAULT_REPLICAS: usize = 500;

fn ring_hash(key: &str) -> u64 {
    let digest = Md5::digest(key.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(bytes)
}

#[derive(Debug, Clone, Default)]
pub struct HashRing {
    nodes: BTreeMap<u64, String>,
    members: Vec<String>,
}

impl HashRing {
    pub fn new(members: &[String], replicas: usize) -> Self {
        let mut members: Vec<String> = members.to_vec();
        members.sort();
        members.dedup();

        let mut nodes = BTreeMap::new();
        for member in &members {
            for i in 0..replicas.max(1) {
                nodes.insert(ring_hash(&format!("{}#{}", member, i)), member.clone());
            }
        }
        Self { nodes, members }
    }

    /// Endpoint owning `key`
    pub fn get_node(&self, key: &str) -> Result<String> {
        let hash = ring_hash(key);
        self.nodes
            .range(hash..)
            .next()
            .or_else(|| self.nodes.iter().next())
            .map(|(_, node)| node.clone())
            .ok_or_else(|| JudgeError::RingUnassigned(key.to_string()))
    }

    pub fn members(&self) -> &[String] {
        &self.members
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

/// Shared, swappable ring snapshot
#[derive(Clone)]
pub struct RingHandle {
    ring: Arc<RwLock<Arc<HashRing>>>,
    replicas: usize,
}

impl Default for RingHandle {
    fn default() -> Self {
        Self::new(DEFAULT_REPLICAS)
    }
}

impl RingHandle {
    pub fn new(replicas: usize) -> Self {
        Self {
            ring: Arc::new(RwLock::new(Arc::new(HashRing::default()))),
            replicas,
        }
    }

    /// Rebuild from `members`; returns whether the member set changed
    pub fn update(&self, members: &[String]) -> bool {
        let next = HashRing::new(members, self.replicas);
        let mut guard = self.ring.write();
        if guard.members() == next.members() {
            return false;
        }
        *guard = Arc::new(next);
        true
    }

    pub fn snapshot(&self) -> Arc<HashRing> {
        Arc::clone(&self.ring.read())
    }

    pub fn get_node(&self, key: &str) -> Result<String> {
        self.snapshot().get_node(key)
    }

    pub fn members(&self) -> Vec<String> {
        self.snapshot().members().to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn endpoints(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn test_empty_ring_is_unassigned() {
        let ring = HashRing::default();
        assert!(matches!(ring.get_node("42"), Err(JudgeError::RingUnassigned(k)) if k == "42"));
    }

    #[test]
    fn test_assignment_is_stable_and_order_independent() {
        let a = HashRing::new(&endpoints(&["10.0.0.1:8080", "10.0.0.2:8080"]), 100);
        let b = HashRing::new(&endpoints(&["10.0.0.2:8080", "10.0.0.1:8080", "10.0.0.1:8080"]), 100);

        assert_eq!(a.members(), b.members());
        for id in 0..200 {
            let key = id.to_string();
            assert_eq!(a.get_node(&key).unwrap(), b.get_node(&key).unwrap());
        }
    }

    #[test]
    fn test_keys_spread_over_members() {
        let ring = HashRing::new(&endpoints(&["a:1", "b:1", "c:1"]), DEFAULT_REPLICAS);
        let mut counts: HashMap<String, usize> = HashMap::new();
        for id in 0..3000 {
            *counts.entry(ring.get_node(&id.to_string()).unwrap()).or_default() += 1;
        }

        assert_eq!(counts.len(), 3);
        assert!(counts.values().all(|c| *c > 500), "{counts:?}");
    }

    #[test]
    fn test_removing_a_member_only_moves_its_keys() {
        let before = HashRing::new(&endpoints(&["a:1", "b:1", "c:1"]), 100);
        let after = HashRing::new(&endpoints(&["a:1", "b:1"]), 100);

        for id in 0..500 {
            let key = id.to_string();
            let old = before.get_node(&key).unwrap();
            if old != "c:1" {
                assert_eq!(after.get_node(&key).unwrap(), old);
            }
        }
    }

    #[test]
    fn test_handle_update_reports_changes() {
        let handle = RingHandle::new(10);
        assert!(handle.get_node("1").is_err());

        assert!(handle.update(&endpoints(&["a:1"])));
        assert!(!handle.update(&endpoints(&["a:1"])));
        assert_eq!(handle.get_node("1").unwrap(), "a:1");
        assert!(handle.update(&endpoints(&["a:1", "b:1"])));
        assert_eq!(handle.members(), endpoints(&["a:1", "b:1"]));
    }
}
