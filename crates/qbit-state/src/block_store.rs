//! Persistent block bodies, undo records and the main-chain height index.

use crate::{StateError, StateResult};
use qbit_core::{Block, Decodable, Encodable, Hash, UndoRecord};
use qbit_storage::{ColumnFamily, Storage, WriteBatch};
use std::sync::Arc;

/// Big-endian height key for the `main` column family.
fn height_key(height: u32) -> [u8; 8] {
    (height as u64).to_be_bytes()
}

/// Store for block bodies (keyed by hash), per-block undo records, and the
/// height-to-hash index covering main-chain blocks only.
pub struct BlockStore {
    storage: Arc<dyn Storage>,
}

impl BlockStore {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    /// Stage a block body write.
    pub fn stage_put_block(&self, batch: &mut WriteBatch, hash: &Hash, block: &Block) {
        batch.put(ColumnFamily::Blocks, hash.to_vec(), block.encode());
    }

    /// Store a block body immediately (outside a connect group; body storage
    /// is what moves an index entry to Body-Known).
    pub fn put_block(&self, hash: &Hash, block: &Block) -> StateResult<()> {
        self.storage
            .put(ColumnFamily::Blocks, hash.as_bytes(), &block.encode())?;
        Ok(())
    }

    pub fn get_block(&self, hash: &Hash) -> StateResult<Option<Block>> {
        match self.storage.get(ColumnFamily::Blocks, hash.as_bytes())? {
            Some(bytes) => Ok(Some(Block::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Fetch a block body, failing if absent.
    pub fn expect_block(&self, hash: &Hash) -> StateResult<Block> {
        self.get_block(hash)?.ok_or(StateError::BlockNotFound(*hash))
    }

    pub fn has_block(&self, hash: &Hash) -> StateResult<bool> {
        Ok(self.storage.contains(ColumnFamily::Blocks, hash.as_bytes())?)
    }

    /// Stage an undo record write.
    pub fn stage_put_undo(&self, batch: &mut WriteBatch, hash: &Hash, undo: &UndoRecord) {
        batch.put(ColumnFamily::Undo, hash.to_vec(), undo.encode());
    }

    pub fn get_undo(&self, hash: &Hash) -> StateResult<Option<UndoRecord>> {
        match self.storage.get(ColumnFamily::Undo, hash.as_bytes())? {
            Some(bytes) => Ok(Some(UndoRecord::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Fetch the undo record required to disconnect a main-chain block.
    pub fn expect_undo(&self, hash: &Hash) -> StateResult<UndoRecord> {
        self.get_undo(hash)?.ok_or_else(|| {
            StateError::Corruption(format!("missing undo record for block {hash}"))
        })
    }

    /// Stage the main-chain pointer for a height.
    pub fn stage_set_main(&self, batch: &mut WriteBatch, height: u32, hash: &Hash) {
        batch.put(ColumnFamily::MainChain, height_key(height).to_vec(), hash.to_vec());
    }

    /// Stage removal of the main-chain pointer for a height.
    pub fn stage_clear_main(&self, batch: &mut WriteBatch, height: u32) {
        batch.delete(ColumnFamily::MainChain, height_key(height).to_vec());
    }

    /// Hash of the main-chain block at a height, if any.
    pub fn main_hash_at(&self, height: u32) -> StateResult<Option<Hash>> {
        match self.storage.get(ColumnFamily::MainChain, &height_key(height))? {
            Some(bytes) => Hash::from_slice(&bytes)
                .map(Some)
                .ok_or_else(|| StateError::Corruption("bad hash in main index".into())),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qbit_core::{BlockHeader, OutPoint, Transaction, TxInput, TxOutput, UtxoEntry};
    use qbit_storage::MemoryStorage;

    fn sample_block() -> Block {
        Block {
            header: BlockHeader {
                version: 1,
                prev_block: Hash::ZERO,
                merkle_root: Hash::ZERO,
                time: 1,
                target: 0x207f_ffff,
                nonce: 2,
            },
            transactions: vec![Transaction {
                version: 1,
                inputs: vec![TxInput::new(OutPoint::COINBASE, vec![1, 0])],
                outputs: vec![TxOutput::new(10, vec![0x51])],
                lock_time: 0,
            }],
        }
    }

    fn store() -> BlockStore {
        BlockStore::new(Arc::new(MemoryStorage::new()))
    }

    #[test]
    fn test_block_round_trip() {
        let store = store();
        let block = sample_block();
        let hash = qbit_core::hash_tagged(qbit_core::tags::TX, b"blockhash");

        assert!(!store.has_block(&hash).unwrap());
        store.put_block(&hash, &block).unwrap();
        assert!(store.has_block(&hash).unwrap());
        assert_eq!(store.get_block(&hash).unwrap().unwrap(), block);
        assert_eq!(store.expect_block(&hash).unwrap(), block);
    }

    #[test]
    fn test_expect_block_missing() {
        let store = store();
        let hash = qbit_core::hash_tagged(qbit_core::tags::TX, b"nope");
        assert!(matches!(
            store.expect_block(&hash),
            Err(StateError::BlockNotFound(_))
        ));
    }

    #[test]
    fn test_undo_round_trip() {
        let store = store();
        let hash = qbit_core::hash_tagged(qbit_core::tags::TX, b"undo");
        let undo = UndoRecord {
            spent: vec![UtxoEntry::new(TxOutput::new(5, vec![9]), 3, true)],
        };

        let mut batch = WriteBatch::new();
        store.stage_put_undo(&mut batch, &hash, &undo);
        store.storage.write_batch(batch).unwrap();

        assert_eq!(store.get_undo(&hash).unwrap().unwrap(), undo);
    }

    #[test]
    fn test_main_chain_index() {
        let store = store();
        let h1 = qbit_core::hash_tagged(qbit_core::tags::TX, b"b1");
        let h2 = qbit_core::hash_tagged(qbit_core::tags::TX, b"b2");

        let mut batch = WriteBatch::new();
        store.stage_set_main(&mut batch, 1, &h1);
        store.stage_set_main(&mut batch, 2, &h2);
        store.storage.write_batch(batch).unwrap();

        assert_eq!(store.main_hash_at(1).unwrap(), Some(h1));
        assert_eq!(store.main_hash_at(2).unwrap(), Some(h2));
        assert_eq!(store.main_hash_at(3).unwrap(), None);

        let mut batch = WriteBatch::new();
        store.stage_clear_main(&mut batch, 2);
        store.storage.write_batch(batch).unwrap();
        assert_eq!(store.main_hash_at(2).unwrap(), None);
    }
}
