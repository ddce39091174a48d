#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("transaction already consumed")]
    TransactionConsumed,
    #[error("cannot write in a read-only transaction")]
    ReadOnly,
    #[error("storage error: {0}")]
    Storage(String),
}
