//! Everything a replica guards with its single state lock.
//!
//! The gateway reads it, the apply loop and the snapshot installer mutate it.
//! Transitions live here as plain methods so the rules can be tested without
//! threads.

use crate::command::{BarrierId, CommandPayload, RequestId};
use crate::error::SnapshotError;
use crate::ledger::DedupLedger;
use crate::pending::PendingRegistry;
use crate::snapshot;
use crate::store::KvStore;

/// What applying one committed entry did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// A new write changed the store.
    Applied,
    /// The ledger had already seen this request; nothing changed.
    Duplicate,
    /// A read barrier; never changes the store.
    Barrier,
    /// At or below the applied index (already covered by a snapshot).
    Stale,
}

#[derive(Default)]
pub struct ReplicaState {
    pub store: KvStore,
    pub ledger: DedupLedger,
    pub writes: PendingRegistry<RequestId>,
    pub barriers: PendingRegistry<BarrierId>,
    /// Highest log index reflected in `store`.
    pub applied_index: u64,
}

impl ReplicaState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies the entry committed at `index` and wakes whoever waits on it.
    ///
    /// Waiters are resolved even for duplicates and stale entries: in both
    /// cases the request is reflected in the state.
    pub fn apply_committed(&mut self, index: u64, payload: &CommandPayload) -> ApplyOutcome {
        let stale = index <= self.applied_index;
        if !stale {
            self.applied_index = index;
        }

        match payload {
            CommandPayload::Op(op) => {
                let id = op.id();
                let outcome = if stale {
                    ApplyOutcome::Stale
                } else if self.ledger.record(id) {
                    self.store.apply(op);
                    ApplyOutcome::Applied
                } else {
                    ApplyOutcome::Duplicate
                };
                self.writes.resolve(&id);
                outcome
            }
            CommandPayload::Barrier(barrier) => {
                self.barriers.resolve(barrier);
                if stale {
                    ApplyOutcome::Stale
                } else {
                    ApplyOutcome::Barrier
                }
            }
        }
    }

    /// Advances past an entry that carries nothing to apply.
    pub fn skip(&mut self, index: u64) {
        self.applied_index = self.applied_index.max(index);
    }

    /// Replaces store and ledger with a snapshot taken at `index`.
    ///
    /// Returns `false` and changes nothing if the replica is already past it.
    pub fn install(&mut self, index: u64, store: KvStore, ledger: DedupLedger) -> bool {
        if index <= self.applied_index {
            return false;
        }
        self.store = store;
        self.ledger = ledger;
        self.applied_index = index;
        true
    }

    pub fn encode_snapshot(&self) -> Result<Vec<u8>, SnapshotError> {
        snapshot::encode(&self.store, &self.ledger)
    }

    /// Wakes every waiter. Used when the replica is killed.
    pub fn release_all(&mut self) {
        self.writes.clear();
        self.barriers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{OpKind, Operation};
    use crossbeam_channel::TryRecvError;

    fn op(kind: OpKind, key: &str, value: &str, client: u64, seq: u64) -> CommandPayload {
        CommandPayload::Op(Operation {
            kind,
            key: key.into(),
            value: value.into(),
            client,
            seq,
        })
    }

    #[test]
    fn duplicate_is_applied_once_but_still_resolves() {
        let mut state = ReplicaState::new();
        let put = op(OpKind::Append, "x", "a", 1, 1);

        assert_eq!(state.apply_committed(1, &put), ApplyOutcome::Applied);
        let waiter = state.writes.register(RequestId::new(1, 1));
        assert_eq!(state.apply_committed(2, &put), ApplyOutcome::Duplicate);

        assert_eq!(state.store.get("x"), Some("a"));
        assert_eq!(waiter.try_recv(), Err(TryRecvError::Disconnected));
        assert!(state.writes.is_empty());
        assert_eq!(state.applied_index, 2);
    }

    #[test]
    fn barrier_changes_nothing() {
        let mut state = ReplicaState::new();
        state.apply_committed(1, &op(OpKind::Put, "k", "v", 1, 1));
        let before = state.store.clone();

        let id = BarrierId { origin: 1, nonce: 9 };
        let waiter = state.barriers.register(id);
        assert_eq!(
            state.apply_committed(2, &CommandPayload::Barrier(id)),
            ApplyOutcome::Barrier
        );
        assert_eq!(state.store, before);
        assert_eq!(waiter.try_recv(), Err(TryRecvError::Disconnected));
    }

    #[test]
    fn install_replaces_state_and_later_redelivery_is_ignored() {
        let mut state = ReplicaState::new();
        state.apply_committed(1, &op(OpKind::Put, "old", "1", 1, 1));

        let mut store = KvStore::new();
        store.put("k".into(), "from-snapshot".into());
        let mut ledger = DedupLedger::new();
        ledger.record(RequestId::new(2, 4));

        assert!(state.install(10, store, ledger));
        assert_eq!(state.applied_index, 10);
        assert_eq!(state.store.get("old"), None);

        let waiter = state.writes.register(RequestId::new(3, 1));
        assert_eq!(
            state.apply_committed(7, &op(OpKind::Put, "k", "stale", 3, 1)),
            ApplyOutcome::Stale
        );
        assert_eq!(state.store.get("k"), Some("from-snapshot"));
        assert_eq!(waiter.try_recv(), Err(TryRecvError::Disconnected));

        assert!(!state.install(9, KvStore::new(), DedupLedger::new()));
        assert_eq!(state.store.get("k"), Some("from-snapshot"));
    }

    #[test]
    fn snapshot_of_state_round_trips() -> anyhow::Result<()> {
        let mut state = ReplicaState::new();
        state.apply_committed(1, &op(OpKind::Put, "a", "1", 5, 1));
        state.apply_committed(2, &op(OpKind::Append, "a", "2", 5, 2));

        let (store, ledger) = snapshot::decode(&state.encode_snapshot()?)?;
        assert_eq!(store, state.store);
        assert_eq!(ledger.last_applied(5), Some(2));
        Ok(())
    }

    #[test]
    fn release_all_wakes_everyone() {
        let mut state = ReplicaState::new();
        let write = state.writes.register(RequestId::new(1, 1));
        let read = state.barriers.register(BarrierId { origin: 1, nonce: 1 });
        state.release_all();
        assert_eq!(write.try_recv(), Err(TryRecvError::Disconnected));
        assert_eq!(read.try_recv(), Err(TryRecvError::Disconnected));
    }
}
