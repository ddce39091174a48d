use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use arc_swap::ArcSwap;
use imbl::OrdMap;

use crate::error::StoreError;
use crate::store::{Durability, Store};

use super::transaction::MemoryTransaction;

pub(crate) type Data = OrdMap<Vec<u8>, Vec<u8>>;

/// In-memory store with snapshot reads.
///
/// Readers load the current map without locking. Writers serialize on
/// `write_lock` for the lifetime of their transaction and publish a new map
/// on commit.
pub struct MemoryStore {
    data: ArcSwap<Data>,
    write_lock: Mutex<()>,
    synced_commits: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            data: ArcSwap::new(Arc::new(OrdMap::new())),
            write_lock: Mutex::new(()),
            synced_commits: AtomicU64::new(0),
        }
    }

    /// Number of commits made with [`Durability::Sync`].
    pub fn synced_commits(&self) -> u64 {
        self.synced_commits.load(Ordering::Relaxed)
    }

    /// Snapshot the committed data. Cheap due to imbl structural sharing.
    pub(crate) fn snapshot(&self) -> Data {
        (**self.data.load()).clone()
    }

    pub(crate) fn publish(&self, data: Data, durability: Durability) {
        self.data.store(Arc::new(data));
        if durability == Durability::Sync {
            self.synced_commits.fetch_add(1, Ordering::Relaxed);
            tracing::trace!("memory store commit synced");
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Store for MemoryStore {
    type Txn<'a> = MemoryTransaction<'a>;

    fn begin(&self, read_only: bool) -> Result<Self::Txn<'_>, StoreError> {
        if read_only {
            return Ok(MemoryTransaction::new_read_only(self, self.snapshot()));
        }

        let guard = self
            .write_lock
            .lock()
            .map_err(|e| StoreError::Storage(format!("write lock poisoned: {e}")))?;
        // Snapshot after taking the lock so the previous writer's commit is visible.
        Ok(MemoryTransaction::new_writable(self, self.snapshot(), guard))
    }

    fn len(&self) -> usize {
        self.data.load().len()
    }

    fn clear(&self) -> Result<(), StoreError> {
        self.data.store(Arc::new(OrdMap::new()));
        Ok(())
    }
}
