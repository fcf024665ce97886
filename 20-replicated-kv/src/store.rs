//! In-memory key-value storage for the replicated state machine.
//!
//! Commands from the Raft log are applied here, and nowhere else. The store
//! itself carries no lock: it lives inside the replica's shared state and is
//! only mutated by the apply loop while that lock is held.

use std::collections::BTreeMap;

use crate::command::{OpKind, Operation};

/// The key-value map each replica converges on.
///
/// `BTreeMap` keeps iteration order stable, so two replicas with the same
/// contents serialize to the same snapshot bytes.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct KvStore {
    data: BTreeMap<String, String>,
}

impl KvStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(data: BTreeMap<String, String>) -> Self {
        Self { data }
    }

    /// Applies a write. `Append` on a missing key behaves like `Put`.
    pub fn apply(&mut self, op: &Operation) {
        match op.kind {
            OpKind::Put => self.put(op.key.clone(), op.value.clone()),
            OpKind::Append => self.append(&op.key, &op.value),
        }
    }

    pub fn put(&mut self, key: String, value: String) {
        self.data.insert(key, value);
    }

    pub fn append(&mut self, key: &str, suffix: &str) {
        self.data.entry(key.to_string()).or_default().push_str(suffix);
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.data.get(key).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_map(&self) -> &BTreeMap<String, String> {
        &self.data
    }

    /// Clones the contents so callers can iterate without holding the replica lock.
    pub fn to_map(&self) -> BTreeMap<String, String> {
        self.data.clone()
    }
}
