//! Request gateway of a replica: admission, leader gating and the blocking
//! wait for a write to come back out of the log.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use anyhow::Result;
use crossbeam_channel::{Receiver, TryRecvError, select};
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::apply::{ApplyEngine, SnapshotInstaller};
use crate::command::{BarrierId, CommandPayload};
use crate::config::{ServerConfig, SnapshotPolicy};
use crate::consensus::{ApplyStreams, Consensus, Leadership};
use crate::rpc::{GetArgs, GetReply, PutAppendArgs, PutAppendReply, Status};
use crate::runtime::{RaftHandle, RaftStatus, spawn_raft};
use crate::state::ReplicaState;

/// Snapshot of a replica for the STATUS command.
#[derive(Debug, Clone)]
pub struct ServerStatus {
    pub id: u64,
    pub leadership: Leadership,
    pub applied_index: u64,
    pub entries: BTreeMap<String, String>,
    /// Registered waiters across writes and read barriers.
    pub pending: usize,
    pub killed: bool,
}

pub struct KvServer<C: Consensus> {
    id: u64,
    state: Arc<Mutex<ReplicaState>>,
    consensus: Arc<C>,
    killed: AtomicBool,
    next_barrier: AtomicU64,
    read_barrier_grace: Duration,
}

impl KvServer<RaftHandle> {
    /// Starts a replica backed by a Raft node listening on `config.listen_addr`.
    pub fn start(config: &ServerConfig) -> Result<Self> {
        let (raft, streams) = spawn_raft(config)?;
        info!(node = config.id, addr = %config.listen_addr, "replica started");
        Self::with_consensus(
            config.id,
            Arc::new(raft),
            streams,
            config.snapshot,
            config.read_barrier_grace,
        )
    }

    pub fn campaign(&self) -> Result<()> {
        self.consensus.campaign()
    }

    pub fn raft_status(&self) -> Result<RaftStatus> {
        self.consensus.status()
    }
}

impl<C: Consensus> KvServer<C> {
    /// Wires a replica to an already running consensus module and starts the
    /// apply loop and snapshot installer on its streams.
    pub fn with_consensus(
        id: u64,
        consensus: Arc<C>,
        streams: ApplyStreams,
        snapshot: SnapshotPolicy,
        read_barrier_grace: Duration,
    ) -> Result<Self> {
        let state = Arc::new(Mutex::new(ReplicaState::new()));
        ApplyEngine::new(id, Arc::clone(&state), Arc::clone(&consensus), snapshot)
            .spawn(streams.commits)?;
        SnapshotInstaller::new(id, Arc::clone(&state)).spawn(streams.installs)?;
        Ok(Self {
            id,
            state,
            consensus,
            killed: AtomicBool::new(false),
            next_barrier: AtomicU64::new(1),
            read_barrier_grace,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn consensus(&self) -> &Arc<C> {
        &self.consensus
    }

    pub fn is_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }

    /// Reads `key` from the local store if this replica leads.
    pub fn get(&self, args: &GetArgs) -> GetReply {
        let Some(leadership) = self.leading() else {
            return GetReply::failed(Status::ErrWrongLeader, self.leader_hint());
        };

        if self.consensus.has_uncommitted_term_entries() {
            self.read_barrier(leadership.term);
            if self.leading().is_none() {
                return GetReply::failed(Status::ErrWrongLeader, self.leader_hint());
            }
        }

        let state = self.state.lock();
        match state.store.get(&args.key) {
            Some(value) => GetReply::found(value.to_string()),
            None => GetReply::failed(Status::ErrNoKey, None),
        }
    }

    /// Submits a write and blocks until it is applied or leadership is lost.
    pub fn put_append(&self, args: &PutAppendArgs) -> PutAppendReply {
        if self.leading().is_none() {
            return PutAppendReply::wrong_leader(self.leader_hint());
        }

        let op = args.to_operation();
        let id = op.id();
        let applied = {
            let mut state = self.state.lock();
            if state.ledger.is_duplicate(id) {
                return PutAppendReply::new(Status::Ok);
            }
            state.writes.register(id)
        };

        let submission = match self.consensus.submit(&CommandPayload::Op(op)) {
            Ok(submission) => submission,
            Err(err) => {
                debug!(node = self.id, client = id.client, seq = id.seq, error = %err, "submit refused");
                self.state.lock().writes.release(&id, &applied);
                return PutAppendReply::wrong_leader(self.leader_hint());
            }
        };

        let lost = self.consensus.leadership_lost(submission.term);
        let status = select! {
            recv(applied) -> _ => Status::Ok,
            recv(lost) -> _ => settled_status(&applied),
        };
        self.state.lock().writes.release(&id, &applied);

        if self.is_killed() {
            return PutAppendReply::wrong_leader(None);
        }
        if status == Status::ErrTimeout {
            debug!(
                node = self.id,
                client = id.client,
                seq = id.seq,
                index = submission.index,
                term = submission.term,
                "leadership lost before commit"
            );
        }
        PutAppendReply::new(status)
    }

    /// Stops the replica. Blocked callers return and later calls are refused.
    pub fn kill(&self) {
        if self.killed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.consensus.shutdown();
        self.state.lock().release_all();
        info!(node = self.id, "replica killed");
    }

    pub fn status(&self) -> ServerStatus {
        let state = self.state.lock();
        ServerStatus {
            id: self.id,
            leadership: self.consensus.leadership(),
            applied_index: state.applied_index,
            entries: state.store.to_map(),
            pending: state.writes.len() + state.barriers.len(),
            killed: self.is_killed(),
        }
    }

    fn leading(&self) -> Option<Leadership> {
        if self.is_killed() {
            return None;
        }
        let leadership = self.consensus.leadership();
        leadership.is_leader.then_some(leadership)
    }

    fn leader_hint(&self) -> Option<u64> {
        if self.is_killed() {
            return None;
        }
        let leader = self.consensus.leadership().leader_id;
        (leader != 0 && leader != self.id).then_some(leader)
    }

    /// Pushes a no-op through the log so entries from earlier terms commit
    /// before a read. Best-effort: gives up after the grace period.
    fn read_barrier(&self, term: u64) {
        let id = BarrierId {
            origin: self.id,
            nonce: self.next_barrier.fetch_add(1, Ordering::Relaxed),
        };
        let applied = self.state.lock().barriers.register(id);

        match self.consensus.submit(&CommandPayload::Barrier(id)) {
            Ok(submission) => {
                let lost = self.consensus.leadership_lost(submission.term);
                select! {
                    recv(applied) -> _ => {}
                    recv(lost) -> _ => {}
                    default(self.read_barrier_grace) => {
                        debug!(node = self.id, term, "read barrier not applied within grace period");
                    }
                }
            }
            Err(err) => debug!(node = self.id, term, error = %err, "read barrier refused"),
        }
        self.state.lock().barriers.release(&id, &applied);
    }
}

impl<C: Consensus> Drop for KvServer<C> {
    fn drop(&mut self) {
        self.kill();
    }
}

/// Leadership ended; the write still counts if it was applied in the meantime.
fn settled_status(applied: &Receiver<()>) -> Status {
    match applied.try_recv() {
        Err(TryRecvError::Disconnected) => Status::Ok,
        _ => Status::ErrTimeout,
    }
}
