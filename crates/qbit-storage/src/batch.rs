//! Write batch for atomic operations.

use crate::ColumnFamily;

/// Kind of batch operation.
#[derive(Debug, Clone)]
pub enum OperationKind {
    /// Put a key-value pair.
    Put { value: Vec<u8> },
    /// Delete a key.
    Delete,
}

/// A single batch operation.
#[derive(Debug, Clone)]
pub struct BatchOperation {
    /// Target column family.
    pub cf: ColumnFamily,
    /// Key to operate on.
    pub key: Vec<u8>,
    /// Kind of operation.
    pub kind: OperationKind,
}

/// A group of write operations executed atomically and in order.
#[derive(Debug, Default)]
pub struct WriteBatch {
    pub(crate) operations: Vec<BatchOperation>,
}

impl WriteBatch {
    /// Create a new empty batch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a batch with pre-allocated capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            operations: Vec::with_capacity(capacity),
        }
    }

    /// Add a put operation to the batch.
    pub fn put(&mut self, cf: ColumnFamily, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) {
        self.operations.push(BatchOperation {
            cf,
            key: key.into(),
            kind: OperationKind::Put {
                value: value.into(),
            },
        });
    }

    /// Add a delete operation to the batch.
    pub fn delete(&mut self, cf: ColumnFamily, key: impl Into<Vec<u8>>) {
        self.operations.push(BatchOperation {
            cf,
            key: key.into(),
            kind: OperationKind::Delete,
        });
    }

    /// Number of operations in the batch.
    pub fn len(&self) -> usize {
        self.operations.len()
    }

    /// True when the batch holds no operations.
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Append another batch's operations to this one.
    pub fn merge(&mut self, other: WriteBatch) {
        self.operations.extend(other.operations);
    }

    /// Iterate the collected operations in order.
    pub fn operations(&self) -> impl Iterator<Item = &BatchOperation> {
        self.operations.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_batch_collects_in_order() {
        let mut batch = WriteBatch::new();
        assert!(batch.is_empty());

        batch.put(ColumnFamily::Blocks, b"k1".to_vec(), b"v1".to_vec());
        batch.delete(ColumnFamily::Utxo, b"k2".to_vec());
        batch.put(ColumnFamily::Metadata, b"k3".to_vec(), b"v3".to_vec());

        assert_eq!(batch.len(), 3);
        let kinds: Vec<_> = batch
            .operations()
            .map(|op| matches!(op.kind, OperationKind::Put { .. }))
            .collect();
        assert_eq!(kinds, vec![true, false, true]);
    }

    #[test]
    fn test_merge() {
        let mut a = WriteBatch::new();
        a.put(ColumnFamily::Blocks, b"k1".to_vec(), b"v1".to_vec());
        let mut b = WriteBatch::new();
        b.delete(ColumnFamily::Blocks, b"k2".to_vec());

        a.merge(b);
        assert_eq!(a.len(), 2);
    }
}
