//! In-memory storage backend.
//!
//! Satisfies the same [`Storage`] interface as the RocksDB backend, so the
//! chain state, validators and node can be tested without disk. Batches are
//! applied under one lock, giving the same all-or-nothing visibility as a
//! RocksDB write group; a fault-injection hook lets crash-consistency tests
//! drop a whole batch the way a crash mid-commit would.

use crate::batch::OperationKind;
use crate::{ColumnFamily, Storage, StorageError, StorageResult, WriteBatch};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};

type Family = BTreeMap<Vec<u8>, Vec<u8>>;

/// In-memory storage for tests.
#[derive(Default)]
pub struct MemoryStorage {
    families: RwLock<HashMap<ColumnFamily, Family>>,
    fail_next_batch: AtomicBool,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `write_batch` fail without applying anything,
    /// simulating a crash before the write group commits.
    pub fn fail_next_batch(&self) {
        self.fail_next_batch.store(true, Ordering::SeqCst);
    }

    /// Number of keys in a column family.
    pub fn len(&self, cf: ColumnFamily) -> usize {
        self.families
            .read()
            .get(&cf)
            .map(|f| f.len())
            .unwrap_or(0)
    }
}

impl Storage for MemoryStorage {
    fn get(&self, cf: ColumnFamily, key: &[u8]) -> StorageResult<Option<Vec<u8>>> {
        Ok(self
            .families
            .read()
            .get(&cf)
            .and_then(|f| f.get(key).cloned()))
    }

    fn put(&self, cf: ColumnFamily, key: &[u8], value: &[u8]) -> StorageResult<()> {
        self.families
            .write()
            .entry(cf)
            .or_default()
            .insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&self, cf: ColumnFamily, key: &[u8]) -> StorageResult<()> {
        if let Some(f) = self.families.write().get_mut(&cf) {
            f.remove(key);
        }
        Ok(())
    }

    fn write_batch(&self, batch: WriteBatch) -> StorageResult<()> {
        if self.fail_next_batch.swap(false, Ordering::SeqCst) {
            return Err(StorageError::Io(std::io::Error::other(
                "injected fault: batch dropped",
            )));
        }

        let mut families = self.families.write();
        for op in batch.operations {
            let family = families.entry(op.cf).or_default();
            match op.kind {
                OperationKind::Put { value } => {
                    family.insert(op.key, value);
                }
                OperationKind::Delete => {
                    family.remove(&op.key);
                }
            }
        }
        Ok(())
    }

    fn iter(
        &self,
        cf: ColumnFamily,
    ) -> StorageResult<Box<dyn Iterator<Item = (Vec<u8>, Vec<u8>)> + '_>> {
        let snapshot: Vec<_> = self
            .families
            .read()
            .get(&cf)
            .map(|f| f.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default();
        Ok(Box::new(snapshot.into_iter()))
    }
}
