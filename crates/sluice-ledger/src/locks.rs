//! Named outpoint locks excluded from coin selection.

use parking_lot::RwLock;
use std::collections::HashMap;

use sluice_core::types::OutPoint;

/// In-memory set of locked outpoints, each tagged with the name of its lock.
///
/// An outpoint locked under any name is excluded from selection.
#[derive(Debug, Default)]
pub struct LockedOutpoints {
    locks: RwLock<HashMap<OutPoint, String>>,
}

impl LockedOutpoints {
    /// An empty lock set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock `outpoint` under `name`, replacing any previous lock name.
    pub fn lock(&self, outpoint: OutPoint, name: &str) {
        self.locks.write().insert(outpoint, name.to_string());
    }

    /// Release `outpoint` if it is locked under `name`. Returns whether it was released.
    pub fn unlock(&self, outpoint: &OutPoint, name: &str) -> bool {
        let mut locks = self.locks.write();
        match locks.get(outpoint) {
            Some(held) if held == name => {
                locks.remove(outpoint);
                true
            }
            _ => false,
        }
    }

    /// Release every outpoint locked under `name`. Returns how many were released.
    pub fn reset(&self, name: &str) -> usize {
        let mut locks = self.locks.write();
        let before = locks.len();
        locks.retain(|_, held| held != name);
        before - locks.len()
    }

    /// Whether `outpoint` is locked under any name.
    pub fn is_locked(&self, outpoint: &OutPoint) -> bool {
        self.locks.read().contains_key(outpoint)
    }

    /// Name of the lock on `outpoint`.
    pub fn lock_name(&self, outpoint: &OutPoint) -> Option<String> {
        self.locks.read().get(outpoint).cloned()
    }

    /// All locks, sorted by outpoint.
    pub fn list(&self) -> Vec<(OutPoint, String)> {
        let mut all: Vec<_> = self
            .locks
            .read()
            .iter()
            .map(|(op, name)| (*op, name.clone()))
            .collect();
        all.sort();
        all
    }
}
