//! The narrow contract between the replicated state machine and the consensus log.
//!
//! [`crate::runtime::RaftHandle`] implements it on top of tikv/raft. Tests drive
//! the state machine through scripted implementations instead.

use crossbeam_channel::{Receiver, Sender, bounded};

use crate::command::CommandPayload;
use crate::error::SubmitError;

/// Where an accepted proposal landed in the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Submission {
    pub index: u64,
    pub term: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Leadership {
    pub term: u64,
    pub is_leader: bool,
    /// 0 when no leader is known.
    pub leader_id: u64,
}

/// One committed log entry, delivered in log order.
#[derive(Debug, Clone)]
pub struct CommittedEntry {
    pub index: u64,
    pub term: u64,
    pub data: Vec<u8>,
}

/// A leader-provided snapshot this replica must adopt.
///
/// The sender of `ack` is dropped once the state machine has replaced its
/// state; the consensus module holds back later commits until then.
#[derive(Debug)]
pub struct SnapshotInstall {
    pub index: u64,
    pub term: u64,
    pub data: Vec<u8>,
    pub ack: Sender<()>,
}

/// Streams the state machine consumes. Both close when the consensus module stops.
pub struct ApplyStreams {
    pub commits: Receiver<CommittedEntry>,
    pub installs: Receiver<SnapshotInstall>,
}

pub trait Consensus: Send + Sync + 'static {
    /// Appends `payload` to the log if this replica leads. Does not wait for commit.
    fn submit(&self, payload: &CommandPayload) -> Result<Submission, SubmitError>;

    fn leadership(&self) -> Leadership;

    /// A handle that disconnects once leadership for `term` ends.
    ///
    /// Already disconnected if this replica does not lead `term` right now.
    fn leadership_lost(&self, term: u64) -> Receiver<()>;

    /// True while the current leader's term has no committed entry yet, i.e.
    /// entries from earlier terms may still be unconfirmed.
    fn has_uncommitted_term_entries(&self) -> bool;

    fn persisted_log_size(&self) -> u64;

    /// Stores `snapshot` as covering the log up to `upto_index` and drops those entries.
    fn persist_snapshot_and_truncate(&self, snapshot: Vec<u8>, upto_index: u64);

    fn shutdown(&self);
}

/// Per-term leadership latch kept by a consensus implementation.
///
/// While this replica leads, a zero-capacity channel is held open; stepping
/// down or moving to a new term drops its sender, waking everyone waiting on
/// [`TermWatch::lost_signal`].
#[derive(Debug, Default)]
pub struct TermWatch {
    current: Leadership,
    open: Option<(Sender<()>, Receiver<()>)>,
}

impl TermWatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn leadership(&self) -> Leadership {
        self.current
    }

    /// Records the latest view. Returns `true` if the term or role changed.
    pub fn update(&mut self, next: Leadership) -> bool {
        let changed =
            next.term != self.current.term || next.is_leader != self.current.is_leader;
        if changed {
            self.open = next.is_leader.then(|| bounded(0));
        }
        self.current = next;
        changed
    }

    pub fn lost_signal(&self, term: u64) -> Receiver<()> {
        match &self.open {
            Some((_, rx)) if self.current.term == term => rx.clone(),
            _ => closed(),
        }
    }

    /// Ends any open leadership, e.g. on shutdown.
    pub fn close(&mut self) {
        self.open = None;
        self.current.is_leader = false;
    }
}

fn closed() -> Receiver<()> {
    let (_, rx) = bounded(0);
    rx
}
