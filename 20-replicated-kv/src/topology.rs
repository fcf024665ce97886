use std::collections::HashMap;

use anyhow::{Result, ensure};

/// Voter set of a cluster. Guarantees an odd, non-empty membership.
pub struct ReplicaTopology {
    nodes: Vec<u64>,
}

impl ReplicaTopology {
    pub fn new(mut nodes: Vec<u64>) -> Result<Self> {
        nodes.sort_unstable();
        nodes.dedup();
        ensure!(!nodes.is_empty(), "topology requires at least one node");
        ensure!(
            nodes.len() % 2 == 1,
            "topology must have an odd number of nodes"
        );
        Ok(Self { nodes })
    }

    pub fn from_peers(peers: &HashMap<u64, String>) -> Result<Self> {
        Self::new(peers.keys().copied().collect())
    }

    pub fn ids(&self) -> &[u64] {
        &self.nodes
    }

    pub fn contains(&self, id: u64) -> bool {
        self.nodes.binary_search(&id).is_ok()
    }

    /// Majority size needed to commit.
    pub fn quorum(&self) -> usize {
        self.nodes.len() / 2 + 1
    }
}
