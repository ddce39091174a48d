use std::cell::{Cell, RefCell};
use std::sync::MutexGuard;

use crate::error::StoreError;
use crate::store::{Durability, Transaction};

use super::store::{Data, MemoryStore};

pub struct MemoryTransaction<'a> {
    snapshot: RefCell<Option<Data>>,
    dirty: Cell<bool>,
    store: &'a MemoryStore,
    read_only: bool,
    /// Write lock held for the duration of a write transaction.
    _write_guard: Option<MutexGuard<'a, ()>>,
}

impl<'a> MemoryTransaction<'a> {
    pub(crate) fn new_read_only(store: &'a MemoryStore, snapshot: Data) -> Self {
        Self {
            snapshot: RefCell::new(Some(snapshot)),
            dirty: Cell::new(false),
            store,
            read_only: true,
            _write_guard: None,
        }
    }

    pub(crate) fn new_writable(
        store: &'a MemoryStore,
        snapshot: Data,
        guard: MutexGuard<'a, ()>,
    ) -> Self {
        Self {
            snapshot: RefCell::new(Some(snapshot)),
            dirty: Cell::new(false),
            store,
            read_only: false,
            _write_guard: Some(guard),
        }
    }

    fn check_writable(&self) -> Result<(), StoreError> {
        if self.read_only {
            return Err(StoreError::ReadOnly);
        }
        Ok(())
    }
}

impl<'a> Transaction for MemoryTransaction<'a> {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let snap = self.snapshot.borrow();
        let data = snap.as_ref().ok_or(StoreError::TransactionConsumed)?;
        Ok(data.get(key).cloned())
    }

    fn scan<'b>(
        &'b self,
    ) -> Result<Box<dyn Iterator<Item = Result<(Vec<u8>, Vec<u8>), StoreError>> + 'b>, StoreError>
    {
        // Iterate a clone of the snapshot so writes made while scanning
        // neither invalidate the iterator nor show up in it.
        let data = self
            .snapshot
            .borrow()
            .as_ref()
            .ok_or(StoreError::TransactionConsumed)?
            .clone();
        Ok(Box::new(data.into_iter().map(Ok)))
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.check_writable()?;
        let mut snap = self.snapshot.borrow_mut();
        let data = snap.as_mut().ok_or(StoreError::TransactionConsumed)?;
        data.insert(key.to_vec(), value.to_vec());
        self.dirty.set(true);
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<(), StoreError> {
        self.check_writable()?;
        let mut snap = self.snapshot.borrow_mut();
        let data = snap.as_mut().ok_or(StoreError::TransactionConsumed)?;
        if data.remove(key).is_some() {
            self.dirty.set(true);
        }
        Ok(())
    }

    fn commit(self, durability: Durability) -> Result<(), StoreError> {
        let data = self
            .snapshot
            .into_inner()
            .ok_or(StoreError::TransactionConsumed)?;

        if self.read_only {
            return Err(StoreError::ReadOnly);
        }

        if self.dirty.get() {
            self.store.publish(data, durability);
        }
        Ok(())
    }

    fn rollback(self) -> Result<(), StoreError> {
        if self.snapshot.into_inner().is_none() {
            return Err(StoreError::TransactionConsumed);
        }
        Ok(())
    }
}
