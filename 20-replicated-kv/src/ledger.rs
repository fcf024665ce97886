//! Per-client record of the highest applied sequence number.

use std::collections::BTreeMap;

use crate::command::{ClientId, RequestId, Seq};

/// The idempotence gate for client writes.
///
/// Sequence numbers only ever move forward per client. Anything at or below
/// the recorded value has already been applied and must not be applied again.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DedupLedger {
    applied: BTreeMap<ClientId, Seq>,
}

impl DedupLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(applied: BTreeMap<ClientId, Seq>) -> Self {
        Self { applied }
    }

    pub fn last_applied(&self, client: ClientId) -> Option<Seq> {
        self.applied.get(&client).copied()
    }

    pub fn is_duplicate(&self, id: RequestId) -> bool {
        self.last_applied(id.client)
            .is_some_and(|last| id.seq <= last)
    }

    /// Records `id` as applied. Returns `false` (and records nothing) for a duplicate.
    pub fn record(&mut self, id: RequestId) -> bool {
        if self.is_duplicate(id) {
            return false;
        }
        self.applied.insert(id.client, id.seq);
        true
    }

    pub fn as_map(&self) -> &BTreeMap<ClientId, Seq> {
        &self.applied
    }
}
