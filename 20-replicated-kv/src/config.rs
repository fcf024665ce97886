//! Server configuration.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Result, anyhow};

use crate::topology::ReplicaTopology;

/// Raft logical clock interval.
///
/// Election timeout is 10 ticks and heartbeats go out every 3, so the default
/// gives ~1s elections and ~300ms heartbeats.
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_millis(100);

/// How long a read waits for its barrier entry before serving anyway.
pub const DEFAULT_READ_BARRIER_GRACE: Duration = Duration::from_millis(100);

/// When the apply loop should compact the log into a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SnapshotPolicy {
    #[default]
    Disabled,
    /// Snapshot once the persisted raft log grows past this many bytes.
    MaxLogBytes(u64),
}

impl SnapshotPolicy {
    /// Maps the conventional `maxraftstate` knob: negative disables snapshots.
    pub fn from_max_raft_state(max: i64) -> Self {
        u64::try_from(max).map_or(Self::Disabled, Self::MaxLogBytes)
    }

    pub fn should_snapshot(&self, log_bytes: u64) -> bool {
        match *self {
            Self::Disabled => false,
            Self::MaxLogBytes(limit) => log_bytes > limit,
        }
    }
}

/// Configuration for spawning a replica.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// This node's unique ID (must appear in `peers`)
    pub id: u64,
    /// Address to bind for incoming Raft messages (e.g., "127.0.0.1:7101")
    pub listen_addr: String,
    /// Node ID → address for all cluster members, including self
    pub peers: HashMap<u64, String>,
    pub snapshot: SnapshotPolicy,
    pub read_barrier_grace: Duration,
    pub tick_interval: Duration,
}

impl ServerConfig {
    pub fn new(id: u64, listen_addr: impl Into<String>, peers: HashMap<u64, String>) -> Self {
        Self {
            id,
            listen_addr: listen_addr.into(),
            peers,
            snapshot: SnapshotPolicy::Disabled,
            read_barrier_grace: DEFAULT_READ_BARRIER_GRACE,
            tick_interval: DEFAULT_TICK_INTERVAL,
        }
    }

    pub fn with_snapshot(mut self, snapshot: SnapshotPolicy) -> Self {
        self.snapshot = snapshot;
        self
    }

    pub fn with_read_barrier_grace(mut self, grace: Duration) -> Self {
        self.read_barrier_grace = grace;
        self
    }

    /// Checks membership and returns the sorted voter list.
    pub fn validate(&self) -> Result<ReplicaTopology> {
        if !self.peers.contains_key(&self.id) {
            return Err(anyhow!("node id {} missing from peers map", self.id));
        }
        if self.tick_interval.is_zero() {
            return Err(anyhow!("tick interval must be non-zero"));
        }
        ReplicaTopology::from_peers(&self.peers)
    }
}
