//! The apply side of a replica: the commit loop and the snapshot installer.
//!
//! Each runs on its own thread and exits when the consensus module closes
//! its stream.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result};
use crossbeam_channel::Receiver;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::command::CommandPayload;
use crate::config::SnapshotPolicy;
use crate::consensus::{CommittedEntry, Consensus, SnapshotInstall};
use crate::snapshot;
use crate::state::{ApplyOutcome, ReplicaState};

/// Consumes committed entries in log order.
pub struct ApplyEngine<C> {
    node: u64,
    state: Arc<Mutex<ReplicaState>>,
    consensus: Arc<C>,
    policy: SnapshotPolicy,
}

impl<C: Consensus> ApplyEngine<C> {
    pub fn new(
        node: u64,
        state: Arc<Mutex<ReplicaState>>,
        consensus: Arc<C>,
        policy: SnapshotPolicy,
    ) -> Self {
        Self {
            node,
            state,
            consensus,
            policy,
        }
    }

    pub fn spawn(self, commits: Receiver<CommittedEntry>) -> Result<JoinHandle<()>> {
        thread::Builder::new()
            .name(format!("kv-apply-{}", self.node))
            .spawn(move || self.run(commits))
            .context("failed to spawn apply loop")
    }

    pub fn run(self, commits: Receiver<CommittedEntry>) {
        for entry in commits.iter() {
            self.apply(&entry);
        }
        debug!(node = self.node, "commit stream closed, apply loop exiting");
    }

    /// Applies one entry and, if the log has outgrown the policy, hands a
    /// snapshot covering it to the consensus module.
    pub fn apply(&self, entry: &CommittedEntry) {
        let payload = match CommandPayload::decode(&entry.data) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(node = self.node, index = entry.index, error = ?err, "skipping undecodable entry");
                self.state.lock().skip(entry.index);
                return;
            }
        };

        let snapshot = {
            let mut state = self.state.lock();
            let outcome = state.apply_committed(entry.index, &payload);
            if let CommandPayload::Op(op) = &payload {
                debug!(
                    node = self.node,
                    index = entry.index,
                    client = op.client,
                    seq = op.seq,
                    ?outcome,
                    "applied"
                );
            }
            if outcome == ApplyOutcome::Stale
                || !self.policy.should_snapshot(self.consensus.persisted_log_size())
            {
                None
            } else {
                match state.encode_snapshot() {
                    Ok(bytes) => Some(bytes),
                    Err(err) => {
                        warn!(node = self.node, index = entry.index, error = %err, "snapshot encoding failed");
                        None
                    }
                }
            }
        };

        if let Some(bytes) = snapshot {
            debug!(node = self.node, index = entry.index, bytes = bytes.len(), "requesting log compaction");
            self.consensus.persist_snapshot_and_truncate(bytes, entry.index);
        }
    }
}

/// Adopts snapshots the leader ships to a lagging replica.
pub struct SnapshotInstaller {
    node: u64,
    state: Arc<Mutex<ReplicaState>>,
}

impl SnapshotInstaller {
    pub fn new(node: u64, state: Arc<Mutex<ReplicaState>>) -> Self {
        Self { node, state }
    }

    pub fn spawn(self, installs: Receiver<SnapshotInstall>) -> Result<JoinHandle<()>> {
        thread::Builder::new()
            .name(format!("kv-install-{}", self.node))
            .spawn(move || self.run(installs))
            .context("failed to spawn snapshot installer")
    }

    pub fn run(self, installs: Receiver<SnapshotInstall>) {
        for install in installs.iter() {
            self.install(install);
        }
        debug!(node = self.node, "install stream closed, installer exiting");
    }

    /// Replaces the replica state. The ack fires when `install` is dropped,
    /// after the lock is released, including when the blob is rejected.
    pub fn install(&self, install: SnapshotInstall) {
        let (store, ledger) = match snapshot::decode(&install.data) {
            Ok(decoded) => decoded,
            Err(err) => {
                warn!(node = self.node, index = install.index, error = %err, "ignoring undecodable snapshot");
                return;
            }
        };
        let keys = store.len();
        let installed = self.state.lock().install(install.index, store, ledger);
        if installed {
            info!(node = self.node, index = install.index, keys, "installed snapshot");
        } else {
            debug!(node = self.node, index = install.index, "snapshot older than applied state");
        }
    }
}
