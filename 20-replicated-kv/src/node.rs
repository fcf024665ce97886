//! Core Raft node implementation.
//!
//! This module wraps the tikv/raft library to provide a simplified interface for
//! running a Raft consensus node. [`RaftNode`] owns the raw state machine and the
//! snapshot-aware [`LogStore`]; it knows nothing about keys and values. Committed
//! entries and installed snapshots are handed back to the caller, who feeds them
//! to the replicated state machine.

use anyhow::{Context, Result, ensure};
use raft::StateRole;
use raft::prelude::{ConfState, Config, Entry, EntryType, Message, RawNode};
use slog::{Logger, o};

use crate::command::CommandPayload;
use crate::consensus::{CommittedEntry, Leadership};
use crate::log_store::LogStore;

/// Creates a logger that discards all output.
///
/// The tikv/raft library requires a logger, but we handle logging at the application
/// level with `tracing` instead.
fn silent_logger() -> Logger {
    Logger::root(slog::Discard, o!())
}

/// A snapshot received from the leader and already written to the log store.
pub struct ReceivedSnapshot {
    pub index: u64,
    pub term: u64,
    pub data: Vec<u8>,
}

/// Output from processing a Raft ready state.
///
/// Consumers must handle the fields in order: send `messages`, install
/// `snapshot` if present, then apply `committed`. Everything in `committed`
/// follows the snapshot in the log.
pub struct ReadyBundle {
    pub messages: Vec<Message>,
    pub snapshot: Option<ReceivedSnapshot>,
    pub committed: Vec<CommittedEntry>,
}

/// A Raft consensus node over an in-memory, compactable log.
///
/// The node exposes a simplified interface: `propose` to submit commands,
/// `step` to process incoming Raft messages, `poll_ready` to advance state,
/// `compact` to fold applied entries into an application snapshot.
pub struct RaftNode {
    id: u64,
    raw: RawNode<LogStore>,
    storage: LogStore,
}

impl RaftNode {
    /// Creates a new Raft node with the given ID and cluster configuration.
    ///
    /// `election_tick: 10` and `heartbeat_tick: 3` assume the runtime ticks every
    /// 100ms. `check_quorum` makes a partitioned leader step down, which is what
    /// releases clients blocked on its proposals.
    pub fn new(id: u64, voters: &[u64]) -> Result<Self> {
        let cfg = Config {
            id,
            election_tick: 10,
            heartbeat_tick: 3,
            max_inflight_msgs: 256,
            check_quorum: true,
            ..Default::default()
        };
        let storage = LogStore::new_with_conf_state(ConfState::from((voters.to_vec(), vec![])));
        let logger = silent_logger();
        let raw = RawNode::new(&cfg, storage.clone(), &logger)
            .with_context(|| format!("failed to construct RawNode {id}"))?;
        Ok(Self { id, raw, storage })
    }

    /// Advances Raft's logical clock by one tick.
    pub fn tick(&mut self) {
        self.raw.tick();
    }

    /// Starts an election to become leader.
    pub fn campaign(&mut self) -> Result<()> {
        self.raw.campaign().context("campaign failed")
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Returns this node's current role (Follower, Candidate, or Leader).
    pub fn role(&self) -> StateRole {
        self.raw.raft.state
    }

    /// Returns the current leader's ID, or 0 if no leader is known.
    pub fn leader_id(&self) -> u64 {
        self.raw.raft.leader_id
    }

    pub fn term(&self) -> u64 {
        self.raw.raft.term
    }

    pub fn leadership(&self) -> Leadership {
        Leadership {
            term: self.term(),
            is_leader: self.role() == StateRole::Leader,
            leader_id: self.leader_id(),
        }
    }

    /// True until the log holds a committed entry from the current term.
    ///
    /// A fresh leader commits its own empty entry first; before that, entries
    /// inherited from earlier terms are not yet known to be committed here.
    pub fn has_uncommitted_term_entries(&self) -> bool {
        let log = &self.raw.raft.raft_log;
        log.term(log.committed).map_or(true, |t| t != self.term())
    }

    pub fn last_index(&self) -> u64 {
        self.raw.raft.raft_log.last_index()
    }

    pub fn applied_index(&self) -> u64 {
        self.raw.raft.raft_log.applied
    }

    pub fn log_size_bytes(&self) -> u64 {
        self.storage.rl().log_size_bytes()
    }

    pub fn snapshot_index(&self) -> u64 {
        self.storage.rl().snapshot_index()
    }

    /// Proposes a command to be replicated via Raft.
    ///
    /// Success here only means "added to the leader's log" at the returned index,
    /// not "committed". Fails on followers.
    pub fn propose(&mut self, payload: &CommandPayload) -> Result<u64> {
        ensure!(
            self.role() == StateRole::Leader,
            "node {} is not the leader",
            self.id
        );
        let data = payload.encode()?;
        self.raw.propose(vec![], data).context("propose failed")?;
        let index = self.last_index();
        Ok(index)
    }

    /// Processes a Raft message from another node.
    pub fn step(&mut self, msg: Message) -> Result<()> {
        self.raw.step(msg).context("step failed")
    }

    /// Replaces the log prefix up to `index` with an application snapshot.
    ///
    /// Returns `false` if an equal or newer snapshot is already stored.
    pub fn compact(&mut self, index: u64, data: Vec<u8>) -> Result<bool> {
        ensure!(
            index <= self.applied_index(),
            "cannot compact past applied index {} (requested {index})",
            self.applied_index()
        );
        self.storage
            .wl()
            .compact(index, data)
            .with_context(|| format!("compact to {index} failed"))
    }

    /// Checks if Raft has work to do, processes it, and returns results.
    ///
    /// Returns `None` if there is nothing to do.
    ///
    /// Raft uses a two-phase advancement protocol (Ready → LightReady). Phase 1
    /// persists hard state, new entries and any received snapshot, then collects
    /// committed entries and messages. Phase 2 picks up the commit index advance
    /// and any further committed entries. Since the log is in memory, both phases
    /// complete immediately.
    pub fn poll_ready(&mut self) -> Result<Option<ReadyBundle>> {
        if !self.raw.has_ready() {
            return Ok(None);
        }

        let mut ready = self.raw.ready();
        let mut committed = Vec::new();
        let mut outbound = Vec::new();
        let mut snapshot = None;

        // Phase 1: persist durable state

        if !ready.snapshot().is_empty() {
            let snap = ready.snapshot().clone();
            let meta = snap.get_metadata();
            let received = ReceivedSnapshot {
                index: meta.index,
                term: meta.term,
                data: snap.data.to_vec(),
            };
            self.storage
                .wl()
                .apply_snapshot(snap)
                .context("apply snapshot failed")?;
            snapshot = Some(received);
        }

        if !ready.entries().is_empty() {
            self.storage
                .wl()
                .append(ready.entries())
                .context("append entries failed")?;
        }

        if let Some(hard_state) = ready.hs() {
            self.storage.wl().set_hardstate(hard_state.clone());
        }

        outbound.extend(ready.take_messages());
        committed.extend(self.committed_commands(ready.take_committed_entries()));
        outbound.extend(ready.take_persisted_messages());

        // Phase 2: continue after persistence acknowledgment

        let mut light_ready = self.raw.advance(ready);

        if let Some(commit) = light_ready.commit_index() {
            self.storage.wl().set_commit(commit);
        }

        outbound.extend(light_ready.take_messages());
        committed.extend(self.committed_commands(light_ready.take_committed_entries()));

        self.raw.advance_apply();

        Ok(Some(ReadyBundle {
            messages: outbound,
            snapshot,
            committed,
        }))
    }

    /// Keeps normal entries that carry a command.
    ///
    /// Empty entries (a new leader's no-op) and configuration changes never reach
    /// the state machine.
    fn committed_commands(&self, entries: Vec<Entry>) -> Vec<CommittedEntry> {
        entries
            .into_iter()
            .filter(|entry| !entry.data.is_empty() && entry.entry_type() == EntryType::EntryNormal)
            .map(|entry| CommittedEntry {
                index: entry.index,
                term: entry.term,
                data: entry.data.to_vec(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, HashSet};

    use crate::command::{OpKind, Operation};

    /// Test harness for simulating a Raft cluster without networking.
    ///
    /// Routes messages between nodes in-memory and records what each node
    /// delivered to its state machine. Isolated nodes neither tick nor
    /// exchange messages.
    struct TestCluster {
        nodes: HashMap<u64, RaftNode>,
        isolated: HashSet<u64>,
        committed: HashMap<u64, Vec<CommittedEntry>>,
        snapshots: HashMap<u64, Vec<ReceivedSnapshot>>,
    }

    impl TestCluster {
        fn new(n: usize) -> Result<Self> {
            let ids: Vec<u64> = (1..=n as u64).collect();
            let mut nodes = HashMap::new();
            for &id in &ids {
                nodes.insert(id, RaftNode::new(id, &ids)?);
            }
            Ok(Self {
                nodes,
                isolated: HashSet::new(),
                committed: HashMap::new(),
                snapshots: HashMap::new(),
            })
        }

        fn node_mut(&mut self, id: u64) -> &mut RaftNode {
            self.nodes.get_mut(&id).expect("node not found")
        }

        fn node(&self, id: u64) -> &RaftNode {
            self.nodes.get(&id).expect("node not found")
        }

        fn tick_all(&mut self) {
            for (id, node) in self.nodes.iter_mut() {
                if !self.isolated.contains(id) {
                    node.tick();
                }
            }
        }

        /// Drains ready states and routes messages until the cluster is quiet.
        fn deliver_messages(&mut self) -> Result<usize> {
            let mut total_delivered = 0;
            loop {
                let mut messages = Vec::new();
                for (id, node) in self.nodes.iter_mut() {
                    while let Some(bundle) = node.poll_ready()? {
                        messages.extend(bundle.messages);
                        if let Some(snap) = bundle.snapshot {
                            self.snapshots.entry(*id).or_default().push(snap);
                        }
                        self.committed.entry(*id).or_default().extend(bundle.committed);
                    }
                }

                messages.retain(|m| !self.isolated.contains(&m.to) && !self.isolated.contains(&m.from));
                if messages.is_empty() {
                    break;
                }
                total_delivered += messages.len();
                for msg in messages {
                    if let Some(node) = self.nodes.get_mut(&msg.to) {
                        node.step(msg)?;
                    }
                }
            }
            Ok(total_delivered)
        }

        fn run_rounds(&mut self, rounds: usize) -> Result<()> {
            for _ in 0..rounds {
                self.tick_all();
                self.deliver_messages()?;
            }
            Ok(())
        }

        fn elect(&mut self, id: u64) -> Result<()> {
            self.node_mut(id).campaign()?;
            self.deliver_messages()?;
            assert_eq!(self.node(id).role(), StateRole::Leader);
            Ok(())
        }

        fn put(&mut self, leader: u64, seq: u64) -> Result<u64> {
            let payload = CommandPayload::Op(Operation {
                kind: OpKind::Put,
                key: format!("k{seq}"),
                value: format!("v{seq}"),
                client: 1,
                seq,
            });
            let index = self.node_mut(leader).propose(&payload)?;
            self.deliver_messages()?;
            Ok(index)
        }

        fn seqs_applied(&self, id: u64) -> Vec<u64> {
            self.committed
                .get(&id)
                .into_iter()
                .flatten()
                .filter_map(|e| match CommandPayload::decode(&e.data) {
                    Ok(CommandPayload::Op(op)) => Some(op.seq),
                    _ => None,
                })
                .collect()
        }
    }

    #[test]
    fn committed_commands_reach_every_node_in_order() -> Result<()> {
        let mut cluster = TestCluster::new(3)?;
        cluster.elect(1)?;
        for seq in 1..=3 {
            cluster.put(1, seq)?;
        }

        for id in 1..=3 {
            assert_eq!(cluster.seqs_applied(id), vec![1, 2, 3], "node {id}");
        }
        let indexes: Vec<u64> = cluster.committed[&2].iter().map(|e| e.index).collect();
        assert!(indexes.windows(2).all(|w| w[0] < w[1]));
        Ok(())
    }

    #[test]
    fn followers_refuse_proposals() -> Result<()> {
        let mut cluster = TestCluster::new(3)?;
        cluster.elect(1)?;
        let payload = CommandPayload::Barrier(crate::command::BarrierId { origin: 2, nonce: 1 });
        assert!(cluster.node_mut(2).propose(&payload).is_err());
        Ok(())
    }

    #[test]
    fn new_leader_reports_uncommitted_term_until_its_entry_commits() -> Result<()> {
        let mut cluster = TestCluster::new(3)?;
        cluster.node_mut(1).campaign()?;
        assert!(cluster.node(1).has_uncommitted_term_entries());
        cluster.deliver_messages()?;
        assert_eq!(cluster.node(1).role(), StateRole::Leader);
        assert!(!cluster.node(1).has_uncommitted_term_entries());
        Ok(())
    }

    #[test]
    fn compaction_shrinks_the_log() -> Result<()> {
        let mut cluster = TestCluster::new(3)?;
        cluster.elect(1)?;
        let mut last = 0;
        for seq in 1..=5 {
            last = cluster.put(1, seq)?;
        }
        let before = cluster.node(1).log_size_bytes();

        assert!(cluster.node_mut(1).compact(last, b"image".to_vec())?);
        assert_eq!(cluster.node(1).snapshot_index(), last);
        assert!(cluster.node(1).log_size_bytes() < before);
        assert!(!cluster.node_mut(1).compact(last, b"image".to_vec())?);
        assert!(cluster.node_mut(1).compact(last + 100, vec![]).is_err());
        Ok(())
    }

    #[test]
    fn lagging_follower_catches_up_from_snapshot() -> Result<()> {
        let mut cluster = TestCluster::new(3)?;
        cluster.elect(1)?;
        cluster.isolated.insert(3);

        let mut last = 0;
        for seq in 1..=5 {
            last = cluster.put(1, seq)?;
        }
        assert_eq!(cluster.seqs_applied(2), vec![1, 2, 3, 4, 5]);
        assert!(cluster.seqs_applied(3).is_empty());

        cluster.node_mut(1).compact(last, b"image-at-last".to_vec())?;
        cluster.isolated.clear();
        cluster.run_rounds(30)?;

        let installed = cluster.snapshots.get(&3).expect("node 3 received a snapshot");
        assert_eq!(installed.len(), 1);
        assert_eq!(installed[0].index, last);
        assert_eq!(installed[0].data, b"image-at-last".to_vec());
        assert!(cluster.seqs_applied(3).is_empty(), "compacted entries are not replayed");

        // Replication continues normally after the install.
        let next = cluster.put(1, 6)?;
        assert!(next > last);
        assert_eq!(cluster.seqs_applied(3), vec![6]);
        Ok(())
    }

    #[test]
    fn no_split_brain_during_forced_campaign() -> Result<()> {
        let mut cluster = TestCluster::new(3)?;
        cluster.elect(1)?;

        cluster.node_mut(2).campaign()?;
        for _ in 0..20 {
            cluster.tick_all();
            cluster.deliver_messages()?;
            let leaders = cluster
                .nodes
                .values()
                .filter(|n| n.role() == StateRole::Leader)
                .count();
            assert!(leaders <= 1, "SPLIT BRAIN DETECTED: {leaders} leaders at same time");
        }
        Ok(())
    }
}
