//! Per-key mutual exclusion.
//!
//! Holders of the same key run one at a time; different keys never wait on
//! each other. Each key gets its own async mutex, created on first use and
//! dropped from the table when its last holder (or waiter) goes away.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

type Table<K> = Arc<Mutex<HashMap<K, Slot>>>;

struct Slot {
    lock: Arc<AsyncMutex<()>>,
    /// Guards plus pending acquisitions for this key.
    holders: usize,
}

/// A table of locks addressed by key.
pub struct KeyedLock<K> {
    table: Table<K>,
}

impl<K: Eq + Hash + Clone> KeyedLock<K> {
    pub fn new() -> Self {
        Self {
            table: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Wait until `key` is free and hold it until the guard is dropped.
    pub async fn acquire(&self, key: K) -> KeyedGuard<K> {
        let lock = {
            let mut table = lock_table(&self.table);
            let slot = table.entry(key.clone()).or_insert_with(|| Slot {
                lock: Arc::new(AsyncMutex::new(())),
                holders: 0,
            });
            slot.holders += 1;
            Arc::clone(&slot.lock)
        };

        // Created before awaiting so a cancelled acquire still gives its count back.
        let ticket = Ticket {
            table: Arc::clone(&self.table),
            key,
        };
        let guard = lock.lock_owned().await;

        KeyedGuard {
            _guard: guard,
            ticket,
        }
    }

    /// Number of keys currently held or waited on.
    pub fn len(&self) -> usize {
        lock_table(&self.table).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K: Eq + Hash + Clone> Default for KeyedLock<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K> Clone for KeyedLock<K> {
    fn clone(&self) -> Self {
        Self {
            table: Arc::clone(&self.table),
        }
    }
}

impl<K> fmt::Debug for KeyedLock<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyedLock").finish_non_exhaustive()
    }
}

fn lock_table<K>(table: &Mutex<HashMap<K, Slot>>) -> MutexGuard<'_, HashMap<K, Slot>> {
    table.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Ticket<K: Eq + Hash> {
    table: Table<K>,
    key: K,
}

impl<K: Eq + Hash> Drop for Ticket<K> {
    fn drop(&mut self) {
        let mut table = lock_table(&self.table);
        if let Some(slot) = table.get_mut(&self.key) {
            slot.holders -= 1;
            if slot.holders == 0 {
                table.remove(&self.key);
            }
        }
    }
}

/// Exclusive hold on one key. Released on drop.
pub struct KeyedGuard<K: Eq + Hash> {
    // Field order matters: the key's mutex unlocks before the ticket can
    // remove the slot, so a newcomer never gets a second mutex for a key
    // that is still held.
    _guard: OwnedMutexGuard<()>,
    ticket: Ticket<K>,
}

impl<K: Eq + Hash> KeyedGuard<K> {
    pub fn key(&self) -> &K {
        &self.ticket.key
    }
}

impl<K: Eq + Hash + fmt::Debug> fmt::Debug for KeyedGuard<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyedGuard")
            .field("key", &self.ticket.key)
            .finish()
    }
}
