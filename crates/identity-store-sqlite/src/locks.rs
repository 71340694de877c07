//! Transaction-scoped logical locks shared by every connection of one database handle.
//!
//! SQLite has neither advisory locks nor `SELECT ... FOR UPDATE`; this table stands in
//! for both. A key is held by exactly one transaction owner at a time, acquisition
//! blocks without a deadline, and the same owner may re-acquire a key it already holds.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockKey {
    /// Creation mutex for one identity key, by its `lock_id`.
    Identity(i64),
    /// Exclusive lock on one contact row.
    Row(i64),
}

#[derive(Debug, Default)]
pub struct LockTable {
    held: Mutex<HashMap<LockKey, u64>>,
    released: Condvar,
}

impl LockTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until `key` is free or already held by `owner`, then hold it for `owner`.
    pub fn acquire(&self, key: LockKey, owner: u64) {
        let mut held = self.held.lock();
        loop {
            match held.get(&key).copied() {
                None => {
                    held.insert(key, owner);
                    return;
                }
                Some(current) if current == owner => return,
                Some(_) => self.released.wait(&mut held),
            }
        }
    }

    /// Release every key in `keys` that `owner` still holds and wake all waiters.
    pub fn release_all(&self, owner: u64, keys: &[LockKey]) {
        let mut held = self.held.lock();
        for key in keys {
            if held.get(key) == Some(&owner) {
                held.remove(key);
            }
        }
        drop(held);
        self.released.notify_all();
    }

    #[must_use]
    pub fn holder(&self, key: LockKey) -> Option<u64> {
        self.held.lock().get(&key).copied()
    }
}

/// Locks taken by one transaction; dropping the guard releases all of them.
#[derive(Debug)]
pub struct TxLocks {
    table: Arc<LockTable>,
    owner: u64,
    keys: Vec<LockKey>,
}

impl TxLocks {
    #[must_use]
    pub fn new(table: Arc<LockTable>, owner: u64) -> Self {
        Self { table, owner, keys: Vec::new() }
    }

    pub fn acquire(&mut self, key: LockKey) {
        self.table.acquire(key, self.owner);
        if !self.keys.contains(&key) {
            self.keys.push(key);
        }
    }

    #[must_use]
    pub fn keys(&self) -> &[LockKey] {
        &self.keys
    }
}

impl Drop for TxLocks {
    fn drop(&mut self) {
        self.table.release_all(self.owner, &self.keys);
    }
}
