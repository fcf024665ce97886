//! Worker runtime for a Raft node, exposed as a [`Consensus`] implementation.
//!
//! This module orchestrates the threading model:
//!
//! - **Worker thread**: owns the [`RaftNode`], drives ticks and ready states,
//!   serves proposals, and publishes committed entries and snapshots
//! - **Network listener thread** (see [`crate::transport`]): forwards peer
//!   messages to the worker
//!
//! The worker stays single-threaded. Everything the state machine needs to read
//! without a round trip (leadership, log size) is published to shared state
//! after each iteration, so callers holding the replica lock never wait on the
//! worker.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use crossbeam_channel::{Receiver, Sender, bounded, unbounded};
use parking_lot::Mutex;
use raft::StateRole;
use raft::prelude::Message;
use tracing::{debug, error, info, warn};

use crate::command::CommandPayload;
use crate::config::ServerConfig;
use crate::consensus::{
    ApplyStreams, CommittedEntry, Consensus, Leadership, SnapshotInstall, Submission, TermWatch,
};
use crate::error::SubmitError;
use crate::node::{RaftNode, ReadyBundle};
use crate::transport::{self, PeerListener};

/// Point-in-time view of the Raft node, for STATUS output and tests.
#[derive(Debug, Clone)]
pub struct RaftStatus {
    pub node_id: u64,
    pub role: StateRole,
    pub leader_id: u64,
    pub term: u64,
    pub last_index: u64,
    pub applied_index: u64,
    pub snapshot_index: u64,
    pub log_bytes: u64,
}

/// Requests sent to the worker thread.
enum WorkerRequest {
    Propose {
        payload: CommandPayload,
        respond_to: Sender<Result<Submission, SubmitError>>,
    },
    Compact {
        index: u64,
        data: Vec<u8>,
    },
    Campaign {
        respond_to: Sender<Result<()>>,
    },
    Status {
        respond_to: Sender<RaftStatus>,
    },
    Shutdown,
}

/// State the worker publishes for lock-free reads by the state machine.
#[derive(Default)]
struct Published {
    watch: Mutex<TermWatch>,
    uncommitted_term: AtomicBool,
    log_bytes: AtomicU64,
    stopped: AtomicBool,
}

impl Published {
    fn refresh(&self, node: &RaftNode) -> bool {
        self.uncommitted_term
            .store(node.has_uncommitted_term_entries(), Ordering::SeqCst);
        self.log_bytes.store(node.log_size_bytes(), Ordering::SeqCst);
        self.watch.lock().update(node.leadership())
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.watch.lock().close();
    }
}

/// Handle for talking to a running Raft worker.
pub struct RaftHandle {
    id: u64,
    request_tx: Sender<WorkerRequest>,
    published: Arc<Published>,
    listener: PeerListener,
}

impl RaftHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Forces this node to start an election campaign.
    pub fn campaign(&self) -> Result<()> {
        let (resp_tx, resp_rx) = bounded(1);
        self.request_tx
            .send(WorkerRequest::Campaign {
                respond_to: resp_tx,
            })
            .context("failed to send campaign request")?;
        resp_rx.recv().context("campaign response channel closed")?
    }

    pub fn status(&self) -> Result<RaftStatus> {
        let (resp_tx, resp_rx) = bounded(1);
        self.request_tx
            .send(WorkerRequest::Status {
                respond_to: resp_tx,
            })
            .context("failed to send status request")?;
        resp_rx.recv().context("status response channel closed")
    }

    pub fn is_stopped(&self) -> bool {
        self.published.stopped.load(Ordering::SeqCst)
    }
}

impl Consensus for RaftHandle {
    fn submit(&self, payload: &CommandPayload) -> Result<Submission, SubmitError> {
        if self.is_stopped() {
            return Err(SubmitError::Stopped);
        }
        let (resp_tx, resp_rx) = bounded(1);
        self.request_tx
            .send(WorkerRequest::Propose {
                payload: payload.clone(),
                respond_to: resp_tx,
            })
            .map_err(|_| SubmitError::Stopped)?;
        resp_rx.recv().map_err(|_| SubmitError::Stopped)?
    }

    fn leadership(&self) -> Leadership {
        self.published.watch.lock().leadership()
    }

    fn leadership_lost(&self, term: u64) -> Receiver<()> {
        self.published.watch.lock().lost_signal(term)
    }

    fn has_uncommitted_term_entries(&self) -> bool {
        self.published.uncommitted_term.load(Ordering::SeqCst)
    }

    fn persisted_log_size(&self) -> u64 {
        self.published.log_bytes.load(Ordering::SeqCst)
    }

    fn persist_snapshot_and_truncate(&self, snapshot: Vec<u8>, upto_index: u64) {
        let request = WorkerRequest::Compact {
            index: upto_index,
            data: snapshot,
        };
        if self.request_tx.send(request).is_err() {
            debug!(node = self.id, "worker gone, dropping snapshot");
        }
    }

    fn shutdown(&self) {
        self.published.stop();
        let _ = self.request_tx.send(WorkerRequest::Shutdown);
        self.listener.stop();
    }
}

/// Spawns the Raft worker and peer listener for `config`.
///
/// Returns the consensus handle plus the commit and install streams that the
/// state machine must drain.
pub fn spawn_raft(config: &ServerConfig) -> Result<(RaftHandle, ApplyStreams)> {
    let topology = config.validate()?;
    let node = RaftNode::new(config.id, topology.ids())?;

    let (request_tx, request_rx) = unbounded();
    let (network_tx, network_rx) = unbounded();
    let (commit_tx, commits) = unbounded();
    let (install_tx, installs) = unbounded();

    let listener = PeerListener::spawn(config.id, &config.listen_addr, network_tx)?;
    let published = Arc::new(Published::default());
    published.refresh(&node);

    let mut worker = Worker {
        last_role: node.role(),
        node,
        peers: config.peers.clone(),
        tick_interval: config.tick_interval,
        request_rx,
        network_rx,
        commit_tx,
        install_tx,
        published: Arc::clone(&published),
    };
    let crash_flag = Arc::clone(&published);
    let id = config.id;
    thread::Builder::new()
        .name(format!("raft-worker-{id}"))
        .spawn(move || {
            if let Err(err) = worker.run() {
                error!(node = id, error = ?err, "CRITICAL: raft worker crashed");
            }
            crash_flag.stop();
        })
        .context("failed to spawn raft worker")?;

    Ok((
        RaftHandle {
            id,
            request_tx,
            published,
            listener,
        },
        ApplyStreams { commits, installs },
    ))
}

/// The worker that runs the Raft event loop.
///
/// Processes three types of events: requests from the handle, Raft messages
/// from peers, and ticks.
struct Worker {
    node: RaftNode,
    peers: HashMap<u64, String>,
    tick_interval: Duration,
    request_rx: Receiver<WorkerRequest>,
    network_rx: Receiver<Message>,
    commit_tx: Sender<CommittedEntry>,
    install_tx: Sender<SnapshotInstall>,
    published: Arc<Published>,
    last_role: StateRole,
}

impl Worker {
    /// Runs the main event loop until shutdown.
    ///
    /// Each iteration waits for a request or peer message (bounded by the
    /// next tick), ticks if due, drains ready state, then republishes the
    /// leadership view.
    fn run(&mut self) -> Result<()> {
        let mut last_tick = Instant::now();
        loop {
            let timeout = self
                .tick_interval
                .checked_sub(last_tick.elapsed())
                .unwrap_or(Duration::ZERO);

            crossbeam_channel::select! {
                recv(self.request_rx) -> req => {
                    match req {
                        Ok(req) => {
                            if !self.handle_request(req)? {
                                break;
                            }
                        }
                        Err(_) => break,
                    }
                }
                recv(self.network_rx) -> msg => {
                    match msg {
                        Ok(msg) => {
                            if let Err(err) = self.node.step(msg) {
                                debug!(node = self.node.id(), error = ?err, "dropped peer message");
                            }
                        }
                        Err(_) => break,
                    }
                }
                default(timeout) => {}
            }

            if last_tick.elapsed() >= self.tick_interval {
                self.node.tick();
                last_tick = Instant::now();
            }

            self.process_ready()?;
            self.publish();
        }
        info!(node = self.node.id(), "raft worker stopped");
        Ok(())
    }

    /// Returns `false` if shutdown was requested.
    fn handle_request(&mut self, req: WorkerRequest) -> Result<bool> {
        match req {
            WorkerRequest::Propose {
                payload,
                respond_to,
            } => {
                let _ = respond_to.send(self.propose(&payload));
            }
            WorkerRequest::Compact { index, data } => self.compact(index, data),
            WorkerRequest::Campaign { respond_to } => {
                let old_role = self.node.role();
                let result = self.node.campaign();
                if result.is_ok() {
                    info!(node = self.node.id(), ?old_role, "campaign initiated");
                }
                let _ = respond_to.send(result);
            }
            WorkerRequest::Status { respond_to } => {
                let _ = respond_to.send(self.status());
            }
            WorkerRequest::Shutdown => return Ok(false),
        }
        Ok(true)
    }

    fn propose(&mut self, payload: &CommandPayload) -> Result<Submission, SubmitError> {
        if self.node.role() != StateRole::Leader {
            let leader = self.node.leader_id();
            return Err(SubmitError::NotLeader {
                leader_hint: (leader != 0).then_some(leader),
            });
        }
        let term = self.node.term();
        let index = self.node.propose(payload).map_err(SubmitError::Rejected)?;
        Ok(Submission { index, term })
    }

    fn compact(&mut self, index: u64, data: Vec<u8>) {
        let size = data.len();
        match self.node.compact(index, data) {
            Ok(true) => info!(
                node = self.node.id(),
                index,
                snapshot_bytes = size,
                log_bytes = self.node.log_size_bytes(),
                "log compacted"
            ),
            Ok(false) => debug!(node = self.node.id(), index, "snapshot already covers index"),
            Err(err) => warn!(node = self.node.id(), index, error = ?err, "compaction failed"),
        }
    }

    fn status(&self) -> RaftStatus {
        RaftStatus {
            node_id: self.node.id(),
            role: self.node.role(),
            leader_id: self.node.leader_id(),
            term: self.node.term(),
            last_index: self.node.last_index(),
            applied_index: self.node.applied_index(),
            snapshot_index: self.node.snapshot_index(),
            log_bytes: self.node.log_size_bytes(),
        }
    }

    /// Drains all ready state from Raft.
    ///
    /// Per batch: send messages, install a received snapshot and wait for the
    /// state machine to acknowledge it, then stream committed entries. The
    /// acknowledgement keeps the snapshot ordered before the entries after it.
    fn process_ready(&mut self) -> Result<()> {
        while let Some(bundle) = self.node.poll_ready()? {
            let ReadyBundle {
                messages,
                snapshot,
                committed,
            } = bundle;

            for msg in messages {
                self.dispatch_message(msg)?;
            }

            if let Some(snapshot) = snapshot {
                info!(
                    node = self.node.id(),
                    index = snapshot.index,
                    bytes = snapshot.data.len(),
                    "installing snapshot from leader"
                );
                let (ack, acked) = bounded::<()>(0);
                let install = SnapshotInstall {
                    index: snapshot.index,
                    term: snapshot.term,
                    data: snapshot.data,
                    ack,
                };
                if self.install_tx.send(install).is_ok() {
                    // Disconnects when the installer drops `ack`.
                    let _ = acked.recv();
                }
            }

            for entry in committed {
                if self.commit_tx.send(entry).is_err() {
                    return Err(anyhow!("commit stream closed"));
                }
            }
        }
        Ok(())
    }

    /// Messages addressed to this node are stepped directly; the rest go over TCP.
    fn dispatch_message(&mut self, msg: Message) -> Result<()> {
        if msg.to == self.node.id() {
            return self.node.step(msg);
        }
        match self.peers.get(&msg.to) {
            Some(addr) => transport::send_message(addr, &msg),
            None => warn!(node = self.node.id(), to = msg.to, "no address for peer, dropping message"),
        }
        Ok(())
    }

    fn publish(&mut self) {
        if self.published.refresh(&self.node) {
            debug!(node = self.node.id(), term = self.node.term(), "leadership view updated");
        }
        let current = self.node.role();
        if current != self.last_role {
            info!(
                node = self.node.id(),
                from = ?self.last_role,
                to = ?current,
                leader = self.node.leader_id(),
                term = self.node.term(),
                "role changed"
            );
            self.last_role = current;
        }
    }
}
