//! Correlation table between submitted requests and the callers waiting on them.
//!
//! Each slot is a zero-capacity channel. Waiters hold clones of the receiver;
//! resolving a slot drops the only sender, which disconnects the channel and
//! wakes every waiter at once. A waiter that gives up calls
//! [`PendingRegistry::release`]; the slot is dropped with its last waiter, when
//! nobody is left to observe the disconnect.

use std::collections::HashMap;
use std::hash::Hash;

use crossbeam_channel::{Receiver, Sender, bounded};

struct Slot {
    // Never sent on; dropping it is the signal.
    _fire: Sender<()>,
    wait: Receiver<()>,
    waiters: usize,
}

pub struct PendingRegistry<K> {
    slots: HashMap<K, Slot>,
}

impl<K: Hash + Eq> Default for PendingRegistry<K> {
    fn default() -> Self {
        Self {
            slots: HashMap::new(),
        }
    }
}

impl<K: Hash + Eq> PendingRegistry<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the handle for `key`, creating the slot on first use.
    ///
    /// A retried request with the same key shares the existing slot.
    pub fn register(&mut self, key: K) -> Receiver<()> {
        let slot = self.slots.entry(key).or_insert_with(|| {
            let (fire, wait) = bounded(0);
            Slot {
                _fire: fire,
                wait,
                waiters: 0,
            }
        });
        slot.waiters += 1;
        slot.wait.clone()
    }

    /// Fires and removes the slot for `key`. Returns whether anyone was waiting.
    pub fn resolve(&mut self, key: &K) -> bool {
        self.slots.remove(key).is_some()
    }

    /// Drops one waiter's interest. The slot goes away with its last waiter.
    ///
    /// `handle` must be the receiver `register` returned; a release that
    /// arrives after its slot was resolved and reused for the same key leaves
    /// the newer slot alone.
    pub fn release(&mut self, key: &K, handle: &Receiver<()>) {
        if let Some(slot) = self.slots.get_mut(key) {
            if !slot.wait.same_channel(handle) {
                return;
            }
            slot.waiters = slot.waiters.saturating_sub(1);
            if slot.waiters == 0 {
                self.slots.remove(key);
            }
        }
    }

    pub fn contains(&self, key: &K) -> bool {
        self.slots.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Fires every slot.
    pub fn clear(&mut self) {
        self.slots.clear();
    }
}
