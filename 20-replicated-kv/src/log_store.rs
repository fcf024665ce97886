//! In-memory Raft log that keeps the application's latest snapshot.
//!
//! `raft::storage::MemStorage` cannot carry snapshot payloads and cannot
//! compact without losing the term of the compaction point, so this store
//! keeps its own entries, hard state and snapshot. Entries covered by the
//! snapshot are dropped; `snapshot.metadata.{index, term}` stands in for them.

use std::sync::Arc;

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use prost::Message as ProstMessage;
use raft::prelude::{ConfState, Entry, HardState, Snapshot};
use raft::storage::{GetEntriesContext, RaftState, Storage};
use raft::{Error as RaftError, StorageError};

pub struct LogStoreCore {
    raft_state: RaftState,
    entries: Vec<Entry>,
    snapshot: Snapshot,
}

impl LogStoreCore {
    fn new(conf_state: ConfState) -> Self {
        Self {
            raft_state: RaftState {
                hard_state: HardState::default(),
                conf_state,
            },
            entries: Vec::new(),
            snapshot: Snapshot::default(),
        }
    }

    pub fn snapshot_index(&self) -> u64 {
        self.snapshot.get_metadata().index
    }

    pub fn first_index(&self) -> u64 {
        self.entries
            .first()
            .map_or(self.snapshot_index() + 1, |e| e.index)
    }

    pub fn last_index(&self) -> u64 {
        self.entries
            .last()
            .map_or(self.snapshot_index(), |e| e.index)
    }

    pub fn hard_state(&self) -> &HardState {
        &self.raft_state.hard_state
    }

    pub fn set_hardstate(&mut self, hs: HardState) {
        self.raft_state.hard_state = hs;
    }

    pub fn set_commit(&mut self, commit: u64) {
        self.raft_state.hard_state.commit = commit;
    }

    pub fn term(&self, idx: u64) -> raft::Result<u64> {
        let meta = self.snapshot.get_metadata();
        if idx == meta.index {
            return Ok(meta.term);
        }
        let first = self.first_index();
        if idx < first {
            return Err(RaftError::Store(StorageError::Compacted));
        }
        if idx > self.last_index() {
            return Err(RaftError::Store(StorageError::Unavailable));
        }
        Ok(self.entries[(idx - first) as usize].term)
    }

    fn entries_in(&self, low: u64, high: u64, max_size: Option<u64>) -> raft::Result<Vec<Entry>> {
        let first = self.first_index();
        if low < first {
            return Err(RaftError::Store(StorageError::Compacted));
        }
        if high > self.last_index() + 1 {
            return Err(RaftError::Store(StorageError::Unavailable));
        }
        let mut ents = self.entries[(low - first) as usize..(high - first) as usize].to_vec();
        limit_size(&mut ents, max_size);
        Ok(ents)
    }

    /// Appends entries, replacing any conflicting suffix.
    pub fn append(&mut self, ents: &[Entry]) -> raft::Result<()> {
        let Some(head) = ents.first() else {
            return Ok(());
        };
        let first = self.first_index();
        if head.index < first {
            return Err(RaftError::Store(StorageError::Compacted));
        }
        if head.index > self.last_index() + 1 {
            return Err(RaftError::Store(StorageError::Unavailable));
        }
        self.entries.truncate((head.index - first) as usize);
        self.entries.extend_from_slice(ents);
        Ok(())
    }

    /// Adopts a snapshot received from the leader, discarding the whole log.
    pub fn apply_snapshot(&mut self, snapshot: Snapshot) -> raft::Result<()> {
        let meta = snapshot.get_metadata();
        if meta.index < self.snapshot_index() {
            return Err(RaftError::Store(StorageError::SnapshotOutOfDate));
        }
        let hs = &mut self.raft_state.hard_state;
        hs.term = hs.term.max(meta.term);
        hs.commit = meta.index;
        self.raft_state.conf_state = meta.get_conf_state().clone();
        self.entries.clear();
        self.snapshot = snapshot;
        Ok(())
    }

    /// Records `data` as the state at `index` and drops the entries it covers.
    ///
    /// Returns `Ok(false)` when an equal or newer snapshot is already held.
    pub fn compact(&mut self, index: u64, data: Vec<u8>) -> raft::Result<bool> {
        if index <= self.snapshot_index() {
            return Ok(false);
        }
        if index > self.raft_state.hard_state.commit || index > self.last_index() {
            return Err(RaftError::Store(StorageError::Unavailable));
        }
        let term = self.term(index)?;

        let mut snapshot = Snapshot::default();
        snapshot.data = data.into();
        let meta = snapshot.mut_metadata();
        meta.index = index;
        meta.term = term;
        meta.set_conf_state(self.raft_state.conf_state.clone());

        let covered = (index + 1 - self.first_index()) as usize;
        self.entries.drain(..covered);
        self.snapshot = snapshot;
        Ok(true)
    }

    /// Encoded size of everything a durable log would have to keep.
    pub fn log_size_bytes(&self) -> u64 {
        let entries: usize = self.entries.iter().map(ProstMessage::encoded_len).sum();
        (entries + self.raft_state.hard_state.encoded_len()) as u64
    }
}

/// Keeps the longest prefix within `max_size` bytes, but always at least one entry.
fn limit_size(entries: &mut Vec<Entry>, max_size: Option<u64>) {
    let Some(max) = max_size else {
        return;
    };
    let mut size = 0u64;
    let keep = entries
        .iter()
        .take_while(|e| {
            size += e.encoded_len() as u64;
            size <= max
        })
        .count();
    entries.truncate(keep.max(1));
}

/// Shared handle to a [`LogStoreCore`]; clones see the same log.
#[derive(Clone)]
pub struct LogStore {
    core: Arc<RwLock<LogStoreCore>>,
}

impl LogStore {
    pub fn new_with_conf_state(conf_state: ConfState) -> Self {
        Self {
            core: Arc::new(RwLock::new(LogStoreCore::new(conf_state))),
        }
    }

    pub fn rl(&self) -> RwLockReadGuard<'_, LogStoreCore> {
        self.core.read()
    }

    pub fn wl(&self) -> RwLockWriteGuard<'_, LogStoreCore> {
        self.core.write()
    }
}

impl Storage for LogStore {
    fn initial_state(&self) -> raft::Result<RaftState> {
        Ok(self.rl().raft_state.clone())
    }

    fn entries(
        &self,
        low: u64,
        high: u64,
        max_size: impl Into<Option<u64>>,
        _context: GetEntriesContext,
    ) -> raft::Result<Vec<Entry>> {
        self.rl().entries_in(low, high, max_size.into())
    }

    fn term(&self, idx: u64) -> raft::Result<u64> {
        self.rl().term(idx)
    }

    fn first_index(&self) -> raft::Result<u64> {
        Ok(self.rl().first_index())
    }

    fn last_index(&self) -> raft::Result<u64> {
        Ok(self.rl().last_index())
    }

    fn snapshot(&self, request_index: u64, _to: u64) -> raft::Result<Snapshot> {
        let core = self.rl();
        let index = core.snapshot_index();
        if index == 0 || index < request_index {
            return Err(RaftError::Store(StorageError::SnapshotTemporarilyUnavailable));
        }
        Ok(core.snapshot.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(index: u64, term: u64) -> Entry {
        let mut e = Entry::default();
        e.index = index;
        e.term = term;
        e.data = b"payload".to_vec().into();
        e
    }

    fn store_with(entries: &[Entry], commit: u64) -> raft::Result<LogStore> {
        let store = LogStore::new_with_conf_state(ConfState::from((vec![1, 2, 3], vec![])));
        store.wl().append(entries)?;
        store.wl().set_commit(commit);
        Ok(store)
    }

    #[test]
    fn fresh_store_starts_after_index_zero() -> raft::Result<()> {
        let store = store_with(&[], 0)?;
        assert_eq!(store.first_index()?, 1);
        assert_eq!(store.last_index()?, 0);
        assert_eq!(store.term(0)?, 0);
        assert!(store.snapshot(0, 2).is_err());
        Ok(())
    }

    #[test]
    fn append_replaces_conflicting_suffix() -> raft::Result<()> {
        let store = store_with(&[entry(1, 1), entry(2, 1), entry(3, 1)], 0)?;
        store.wl().append(&[entry(2, 2)])?;
        assert_eq!(store.last_index()?, 2);
        assert_eq!(store.term(2)?, 2);
        assert!(store.wl().append(&[entry(5, 2)]).is_err(), "gaps are rejected");
        Ok(())
    }

    #[test]
    fn compaction_keeps_the_term_of_the_snapshot_index() -> raft::Result<()> {
        let store = store_with(&[entry(1, 1), entry(2, 1), entry(3, 2), entry(4, 2)], 3)?;
        let before = store.rl().log_size_bytes();

        assert!(store.wl().compact(3, b"state".to_vec())?);
        assert_eq!(store.first_index()?, 4);
        assert_eq!(store.last_index()?, 4);
        assert_eq!(store.term(3)?, 2);
        assert!(matches!(
            store.term(2),
            Err(RaftError::Store(StorageError::Compacted))
        ));
        assert!(matches!(
            store.entries(2, 4, None::<u64>, GetEntriesContext::empty(false)),
            Err(RaftError::Store(StorageError::Compacted))
        ));
        assert!(store.rl().log_size_bytes() < before);

        let snap = store.snapshot(0, 2)?;
        assert_eq!(snap.get_metadata().index, 3);
        assert_eq!(snap.get_metadata().term, 2);
        assert_eq!(snap.data.to_vec(), b"state".to_vec());
        assert_eq!(snap.get_metadata().get_conf_state().voters, vec![1, 2, 3]);
        Ok(())
    }

    #[test]
    fn compaction_refuses_uncommitted_and_stale_indexes() -> raft::Result<()> {
        let store = store_with(&[entry(1, 1), entry(2, 1), entry(3, 1)], 2)?;
        assert!(store.wl().compact(3, vec![]).is_err());
        assert!(store.wl().compact(2, vec![1])?);
        assert!(!store.wl().compact(1, vec![2])?);
        assert!(!store.wl().compact(2, vec![3])?);
        Ok(())
    }

    #[test]
    fn compacting_everything_keeps_indexes_consistent() -> raft::Result<()> {
        let store = store_with(&[entry(1, 1), entry(2, 1)], 2)?;
        store.wl().compact(2, vec![])?;
        assert_eq!(store.first_index()?, 3);
        assert_eq!(store.last_index()?, 2);
        store.wl().append(&[entry(3, 1)])?;
        assert_eq!(store.last_index()?, 3);
        Ok(())
    }

    #[test]
    fn installing_a_snapshot_resets_the_log() -> raft::Result<()> {
        let leader = store_with(&[entry(1, 1), entry(2, 1), entry(3, 1)], 3)?;
        leader.wl().compact(3, b"image".to_vec())?;
        let snap = leader.snapshot(0, 2)?;

        let follower = store_with(&[entry(1, 1)], 1)?;
        follower.wl().apply_snapshot(snap)?;
        assert_eq!(follower.first_index()?, 4);
        assert_eq!(follower.last_index()?, 3);
        assert_eq!(follower.rl().hard_state().commit, 3);
        assert_eq!(follower.snapshot(0, 1)?.data.to_vec(), b"image".to_vec());
        Ok(())
    }

    #[test]
    fn max_size_limits_but_never_empties_a_batch() -> raft::Result<()> {
        let store = store_with(&[entry(1, 1), entry(2, 1), entry(3, 1)], 0)?;
        let one = store.entries(1, 4, 1u64, GetEntriesContext::empty(false))?;
        assert_eq!(one.len(), 1);
        let all = store.entries(1, 4, None::<u64>, GetEntriesContext::empty(false))?;
        assert_eq!(all.len(), 3);
        Ok(())
    }
}
