use crate::error::StoreError;

/// How a commit is made durable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Durability {
    /// Return as soon as the write is visible.
    #[default]
    Buffered,
    /// Wait until the backend reports the write as synced.
    Sync,
}

/// A single shard's key/value storage.
pub trait Store {
    type Txn<'a>: Transaction
    where
        Self: 'a;

    fn begin(&self, read_only: bool) -> Result<Self::Txn<'_>, StoreError>;

    /// Number of keys in the last committed state.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes every key outside of any transaction.
    ///
    /// Open transactions keep their snapshot; a writer committing afterwards
    /// replaces the cleared state with its own.
    fn clear(&self) -> Result<(), StoreError>;
}

pub trait Transaction {
    // Reads
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError>;
    fn scan<'a>(
        &'a self,
    ) -> Result<
        Box<dyn Iterator<Item = Result<(Vec<u8>, Vec<u8>), StoreError>> + 'a>,
        StoreError,
    >;

    // Writes
    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError>;
    fn delete(&self, key: &[u8]) -> Result<(), StoreError>;

    // Lifecycle
    fn commit(self, durability: Durability) -> Result<(), StoreError>;
    fn rollback(self) -> Result<(), StoreError>;
}
