//! Harness for clusters of real replicas talking Raft over localhost TCP.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Result, bail};
use raft::StateRole;
use replicated_kv::client::Clerk;
use replicated_kv::config::{ServerConfig, SnapshotPolicy};
use replicated_kv::consensus::Consensus;
use replicated_kv::runtime::RaftHandle;
use replicated_kv::server::KvServer;

pub type Replica = Arc<KvServer<RaftHandle>>;

pub struct TestCluster {
    peers: HashMap<u64, String>,
    policy: SnapshotPolicy,
    replicas: HashMap<u64, Replica>,
}

impl TestCluster {
    /// Describes an `n`-node cluster on sequential ports from `base_port`
    /// without starting anything.
    pub fn new(n: usize, base_port: u16, policy: SnapshotPolicy) -> Self {
        let peers = (1..=n as u64)
            .map(|id| (id, format!("127.0.0.1:{}", base_port + id as u16 - 1)))
            .collect();
        Self {
            peers,
            policy,
            replicas: HashMap::new(),
        }
    }

    /// Spawns all `n` nodes.
    pub fn spawn(n: usize, base_port: u16, policy: SnapshotPolicy) -> Result<Self> {
        let mut cluster = Self::new(n, base_port, policy);
        for id in 1..=n as u64 {
            cluster.start(id)?;
        }
        Ok(cluster)
    }

    pub fn start(&mut self, id: u64) -> Result<Replica> {
        let config = ServerConfig::new(id, self.peers[&id].clone(), self.peers.clone())
            .with_snapshot(self.policy);
        let replica = Arc::new(KvServer::start(&config)?);
        self.replicas.insert(id, Arc::clone(&replica));
        Ok(replica)
    }

    pub fn node(&self, id: u64) -> &Replica {
        &self.replicas[&id]
    }

    /// A clerk that knows every started replica.
    pub fn clerk(&self) -> Clerk<RaftHandle> {
        let mut ids: Vec<_> = self.replicas.keys().copied().collect();
        ids.sort_unstable();
        Clerk::new(ids.iter().map(|id| Arc::clone(&self.replicas[id])).collect())
    }

    /// Forces `id` to campaign and waits until it leads with a committed
    /// entry in its own term.
    pub fn elect(&self, id: u64) -> Result<()> {
        self.node(id).campaign()?;
        self.wait_for("leader election", Duration::from_secs(5), |cluster| {
            let status = cluster.node(id).raft_status();
            status.is_ok_and(|s| s.role == StateRole::Leader)
                && !cluster.node(id).consensus().has_uncommitted_term_entries()
        })
    }

    pub fn wait_for(
        &self,
        what: &str,
        timeout: Duration,
        mut done: impl FnMut(&Self) -> bool,
    ) -> Result<()> {
        let start = Instant::now();
        while !done(self) {
            if start.elapsed() > timeout {
                bail!("timeout waiting for {what}");
            }
            thread::sleep(Duration::from_millis(50));
        }
        Ok(())
    }

    /// Waits until every live replica holds `key = value`.
    pub fn wait_for_replicated(&self, key: &str, value: &str) -> Result<()> {
        self.wait_for(&format!("{key}={value} everywhere"), Duration::from_secs(5), |cluster| {
            cluster.replicas.values().filter(|r| !r.is_killed()).all(|r| {
                r.status().entries.get(key).map(String::as_str) == Some(value)
            })
        })
    }

    pub fn shutdown(self) {
        for replica in self.replicas.values() {
            replica.kill();
        }
        // Give listeners time to release their ports
        thread::sleep(Duration::from_millis(100));
    }
}
