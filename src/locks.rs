//! Per-key write serialization.
//!
//! Writers to the same document id must not interleave; writers to
//! different ids may. Non-reentrant, non-fair.

use std::collections::HashSet;
use std::sync::{Condvar, Mutex};

#[derive(Default)]
pub struct KeyedLocks {
    held: Mutex<HashSet<String>>,
    released: Condvar,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until `key` is free, then hold it until the guard drops.
    pub fn lock(&self, key: impl Into<String>) -> KeyedGuard<'_> {
        let key = key.into();
        let mut held = self.held.lock().unwrap_or_else(|err| err.into_inner());
        while held.contains(&key) {
            held = self
                .released
                .wait(held)
                .unwrap_or_else(|err| err.into_inner());
        }
        held.insert(key.clone());
        KeyedGuard { locks: self, key }
    }

    pub fn is_held(&self, key: &str) -> bool {
        self.held
            .lock()
            .map(|held| held.contains(key))
            .unwrap_or(false)
    }
}

pub struct KeyedGuard<'a> {
    locks: &'a KeyedLocks,
    key: String,
}

impl Drop for KeyedGuard<'_> {
    fn drop(&mut self) {
        let mut held = self
            .locks
            .held
            .lock()
            .unwrap_or_else(|err| err.into_inner());
        held.remove(&self.key);
        self.locks.released.notify_all();
    }
}
