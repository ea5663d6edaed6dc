use crate::Result;
use bytes::Bytes;

/// Ordered byte-keyed store underneath [`crate::KvResourceStore`]
///
/// Reads outside a transaction see the last committed state. All writes go
/// through [`KVStore::transaction`].
pub trait KVStore: Send + Sync {
    fn get(&self, key: &[u8]) -> Result<Option<Bytes>>;

    /// Every entry whose key starts with `prefix`, in key order
    fn scan(&self, prefix: &[u8]) -> Result<Vec<(Bytes, Bytes)>>;

    /// Begin a write transaction
    ///
    /// Write transactions are serialized, so a read-check-write inside one is atomic.
    fn transaction(&self) -> Result<Box<dyn Transaction>>;
}

/// A write transaction. Dropping it without `commit` discards every write.
pub trait Transaction: Send {
    fn get(&self, key: &[u8]) -> Result<Option<Bytes>>;

    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()>;

    fn delete(&mut self, key: &[u8]) -> Result<()>;

    /// Prefix scan that sees this transaction's own writes
    fn scan(&self, prefix: &[u8]) -> Result<Vec<(Bytes, Bytes)>>;

    fn commit(self: Box<Self>) -> Result<()>;
}
