use crate::{KVStore, Result, StorageError, Transaction as KVTransaction};
use bytes::Bytes;
use redb::{Database, ReadableTable, TableDefinition, WriteTransaction};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

const OBJECTS_TABLE: TableDefinition<&[u8], &[u8]> = TableDefinition::new("objects");

/// redb-based storage backend, one table keyed by storage key
pub struct RedbBackend {
    db: Arc<Database>,
}

impl RedbBackend {
    /// Open (or create) the database file at `path`
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!("Opening redb database at: {}", path.display());

        let db = Database::create(path).map_err(|e| {
            StorageError::database_error(
                format!("Failed to open database at {}: {}", path.display(), e),
                Some(Box::new(e)),
            )
        })?;

        // The table must exist before the first read transaction opens it
        let init = db.begin_write()?;
        init.open_table(OBJECTS_TABLE)?;
        init.commit()?;

        Ok(Self { db: Arc::new(db) })
    }
}

fn to_bytes(raw: &[u8]) -> Bytes {
    Bytes::copy_from_slice(raw)
}

fn scan_table<T>(table: &T, prefix: &[u8]) -> Result<Vec<(Bytes, Bytes)>>
where
    T: ReadableTable<&'static [u8], &'static [u8]>,
{
    let mut entries = Vec::new();
    for entry in table.range(prefix..)? {
        let (key, value) = entry?;
        if !key.value().starts_with(prefix) {
            break;
        }
        entries.push((to_bytes(key.value()), to_bytes(value.value())));
    }
    Ok(entries)
}

impl KVStore for RedbBackend {
    fn get(&self, key: &[u8]) -> Result<Option<Bytes>> {
        let read = self.db.begin_read()?;
        let table = read.open_table(OBJECTS_TABLE)?;
        Ok(table.get(key)?.map(|v| to_bytes(v.value())))
    }

    fn scan(&self, prefix: &[u8]) -> Result<Vec<(Bytes, Bytes)>> {
        let read = self.db.begin_read()?;
        let table = read.open_table(OBJECTS_TABLE)?;
        let entries = scan_table(&table, prefix)?;
        debug!(
            "Scan of {:?} found {} entries",
            String::from_utf8_lossy(prefix),
            entries.len()
        );
        Ok(entries)
    }

    fn transaction(&self) -> Result<Box<dyn KVTransaction>> {
        Ok(Box::new(RedbTransaction {
            txn: self.db.begin_write()?,
        }))
    }
}

/// redb aborts a write transaction that is dropped without commit
struct RedbTransaction {
    txn: WriteTransaction,
}

impl KVTransaction for RedbTransaction {
    fn get(&self, key: &[u8]) -> Result<Option<Bytes>> {
        let table = self.txn.open_table(OBJECTS_TABLE)?;
        let value = table.get(key)?.map(|v| to_bytes(v.value()));
        Ok(value)
    }

    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        let mut table = self.txn.open_table(OBJECTS_TABLE)?;
        table.insert(key, value)?;
        Ok(())
    }

    fn delete(&mut self, key: &[u8]) -> Result<()> {
        let mut table = self.txn.open_table(OBJECTS_TABLE)?;
        table.remove(key)?;
        Ok(())
    }

    fn scan(&self, prefix: &[u8]) -> Result<Vec<(Bytes, Bytes)>> {
        let table = self.txn.open_table(OBJECTS_TABLE)?;
        let entries = scan_table(&table, prefix)?;
        Ok(entries)
    }

    fn commit(self: Box<Self>) -> Result<()> {
        self.txn.commit()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open() -> (RedbBackend, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let backend = RedbBackend::new(dir.path().join("test.redb")).unwrap();
        (backend, dir)
    }

    fn put(backend: &RedbBackend, key: &[u8], value: &[u8]) {
        let mut txn = backend.transaction().unwrap();
        txn.put(key, value).unwrap();
        txn.commit().unwrap();
    }

    #[test]
    fn test_committed_write_is_visible() {
        let (backend, _dir) = open();
        put(&backend, b"v1/Secret/hobbyfarm/a", b"1");
        assert_eq!(backend.get(b"v1/Secret/hobbyfarm/a").unwrap(), Some(Bytes::from("1")));
        assert_eq!(backend.get(b"v1/Secret/hobbyfarm/b").unwrap(), None);
    }

    #[test]
    fn test_scan_stops_at_prefix_boundary() {
        let (backend, _dir) = open();
        put(&backend, b"hobbyfarm.io/v1/VirtualMachine/hobbyfarm/a", b"1");
        put(&backend, b"hobbyfarm.io/v1/VirtualMachine/hobbyfarm/b", b"2");
        put(&backend, b"hobbyfarm.io/v1/VirtualMachineTemplate/hobbyfarm/ubuntu", b"3");
        put(&backend, b"v1/Secret/hobbyfarm/a-ssh-keypair", b"4");

        let vms = backend.scan(b"hobbyfarm.io/v1/VirtualMachine/").unwrap();
        assert_eq!(vms.len(), 2);
        assert_eq!(vms[1].1, Bytes::from("2"));
        assert_eq!(backend.scan(b"").unwrap().len(), 4);
    }

    #[test]
    fn test_transaction_sees_own_writes_and_drop_discards() {
        let (backend, _dir) = open();

        {
            let mut txn = backend.transaction().unwrap();
            txn.put(b"key1", b"value1").unwrap();
            assert_eq!(txn.scan(b"key").unwrap().len(), 1);
            txn.delete(b"key1").unwrap();
            assert_eq!(txn.get(b"key1").unwrap(), None);
            txn.put(b"key2", b"value2").unwrap();
        }
        assert_eq!(backend.get(b"key2").unwrap(), None);

        put(&backend, b"key3", b"value3");
        assert_eq!(backend.get(b"key3").unwrap(), Some(Bytes::from("value3")));
    }
}
