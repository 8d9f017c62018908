//! Key-Level Lock Manager
//!
//! Short-lived advisory locks keyed by record key bytes, serializing
//! read-modify-write on the same key across the per-record active/active
//! path and the parallel batch workers.
//!
//! ## Contract
//!
//! - Locks are held only across CPU-bound conflict resolution plus at most
//!   a single storage read for the prior value and replication metadata.
//! - `acquire_many` deduplicates keys and acquires them in byte order so
//!   overlapping batches can never deadlock.
//! - Entries are created on demand and removed when the refcount returns to
//!   zero, keeping the table bounded by in-flight keys.
//! - Correctness depends on every writer of the same partition going
//!   through this manager; nothing else enforces exclusion.

use bytes::Bytes;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

struct LockEntry {
    lock: Arc<AsyncMutex<()>>,
    refcount: usize,
}

/// Globally shared, refcounted table of per-key locks.
#[derive(Default)]
pub struct KeyLockManager {
    table: Mutex<HashMap<Bytes, LockEntry>>,
}

impl KeyLockManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Acquire locks for all given keys, deduplicated and in byte order.
    pub async fn acquire_many(
        self: &Arc<Self>,
        keys: impl IntoIterator<Item = Bytes>,
    ) -> KeyLockHandle {
        let ordered: BTreeSet<Bytes> = keys.into_iter().collect();
        let locks: Vec<(Bytes, Arc<AsyncMutex<()>>)> = ordered
            .into_iter()
            .map(|key| {
                let lock = self.checkout(&key);
                (key, lock)
            })
            .collect();

        let mut guards = Vec::with_capacity(locks.len());
        for (key, lock) in locks {
            let guard = lock.lock_owned().await;
            guards.push((key, guard));
        }

        KeyLockHandle {
            manager: Arc::clone(self),
            guards,
        }
    }

    /// Single-key variant used by the per-record active/active path.
    pub async fn acquire_one(self: &Arc<Self>, key: Bytes) -> KeyLockHandle {
        self.acquire_many([key]).await
    }

    fn checkout(&self, key: &Bytes) -> Arc<AsyncMutex<()>> {
        let mut table = self.table.lock().expect("key lock table poisoned");
        let entry = table.entry(key.clone()).or_insert_with(|| LockEntry {
            lock: Arc::new(AsyncMutex::new(())),
            refcount: 0,
        });
        entry.refcount += 1;
        Arc::clone(&entry.lock)
    }

    fn checkin(&self, key: &Bytes) {
        let mut table = self.table.lock().expect("key lock table poisoned");
        if let Some(entry) = table.get_mut(key) {
            entry.refcount -= 1;
            if entry.refcount == 0 {
                table.remove(key);
            }
        }
    }

    /// Number of keys with live lock entries.
    pub fn live_entries(&self) -> usize {
        self.table.lock().expect("key lock table poisoned").len()
    }
}

/// Owned handle over a set of acquired key locks.
///
/// Dropping the handle releases the locks in reverse acquisition order and
/// retires table entries whose refcount reached zero.
pub struct KeyLockHandle {
    manager: Arc<KeyLockManager>,
    guards: Vec<(Bytes, OwnedMutexGuard<()>)>,
}

impl KeyLockHandle {
    /// Keys held by this handle, in acquisition order.
    pub fn keys(&self) -> impl Iterator<Item = &Bytes> {
        self.guards.iter().map(|(key, _)| key)
    }

    /// Explicit release; equivalent to dropping the handle.
    pub fn release(self) {}
}

impl Drop for KeyLockHandle {
    fn drop(&mut self) {
        while let Some((key, guard)) = self.guards.pop() {
            drop(guard);
            self.manager.checkin(&key);
        }
    }
}
