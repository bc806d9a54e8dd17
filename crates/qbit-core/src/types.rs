//! Core data model: outpoints, transactions, blocks, UTXO entries, undo data.

use crate::codec::{write_var_bytes, write_var_int, Decodable, Encodable, Reader};
use crate::hash::{hash_tagged, tags, Hash};
use crate::limits;
use crate::{CodecError, CodecResult};
use serde::{Deserialize, Serialize};

/// Reference to a specific output of a past transaction.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
pub struct OutPoint {
    /// Id of the transaction that created the output.
    pub txid: Hash,
    /// Index of the output within that transaction.
    pub index: u32,
}

impl OutPoint {
    /// The sentinel prevout carried by coinbase inputs.
    pub const COINBASE: OutPoint = OutPoint {
        txid: Hash::ZERO,
        index: u32::MAX,
    };

    pub fn new(txid: Hash, index: u32) -> Self {
        Self { txid, index }
    }

    /// True for the coinbase sentinel.
    pub fn is_coinbase_sentinel(&self) -> bool {
        self.txid.is_zero() && self.index == u32::MAX
    }

    /// 36-byte storage key: txid followed by the little-endian index.
    pub fn storage_key(&self) -> [u8; 36] {
        let mut key = [0u8; 36];
        key[..32].copy_from_slice(self.txid.as_bytes());
        key[32..].copy_from_slice(&self.index.to_le_bytes());
        key
    }
}

impl Encodable for OutPoint {
    fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self.txid.as_bytes());
        out.extend_from_slice(&self.index.to_le_bytes());
    }
}

impl Decodable for OutPoint {
    const NAME: &'static str = "outpoint";

    fn decode_from(r: &mut Reader<'_>) -> CodecResult<Self> {
        let txid = Hash::from_slice(r.read_bytes(32)?)
            .ok_or(CodecError::InvalidValue { what: "txid" })?;
        let index = r.read_u32()?;
        Ok(Self { txid, index })
    }
}

/// A spendable output: an amount in sub-units plus a locking script.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct TxOutput {
    pub amount: u64,
    pub script: Vec<u8>,
}

impl TxOutput {
    pub fn new(amount: u64, script: Vec<u8>) -> Self {
        Self { amount, script }
    }
}

impl Encodable for TxOutput {
    fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.amount.to_le_bytes());
        write_var_bytes(out, &self.script);
    }
}

impl Decodable for TxOutput {
    const NAME: &'static str = "output";

    fn decode_from(r: &mut Reader<'_>) -> CodecResult<Self> {
        let amount = r.read_u64()?;
        let script = r.read_var_bytes(limits::MAX_SCRIPT_BYTES, "script")?;
        Ok(Self { amount, script })
    }
}

/// A transaction input spending a previous output.
///
/// For coinbase inputs `prev` is the all-zero sentinel and the unlock script
/// carries the block-height commitment followed by arbitrary miner data.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct TxInput {
    pub prev: OutPoint,
    pub unlock_script: Vec<u8>,
    pub sequence: u32,
}

impl TxInput {
    pub fn new(prev: OutPoint, unlock_script: Vec<u8>) -> Self {
        Self {
            prev,
            unlock_script,
            sequence: u32::MAX,
        }
    }
}

impl Encodable for TxInput {
    fn encode_into(&self, out: &mut Vec<u8>) {
        self.prev.encode_into(out);
        write_var_bytes(out, &self.unlock_script);
        out.extend_from_slice(&self.sequence.to_le_bytes());
    }
}

impl Decodable for TxInput {
    const NAME: &'static str = "input";

    fn decode_from(r: &mut Reader<'_>) -> CodecResult<Self> {
        let prev = OutPoint::decode_from(r)?;
        let unlock_script = r.read_var_bytes(limits::MAX_SCRIPT_BYTES, "script")?;
        let sequence = r.read_u32()?;
        Ok(Self {
            prev,
            unlock_script,
            sequence,
        })
    }
}

/// A transaction. The id is the tagged hash of the canonical encoding.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct Transaction {
    pub version: u32,
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
    pub lock_time: u32,
}

impl Transaction {
    /// Transaction id: tagged hash of the canonical encoding.
    pub fn txid(&self) -> Hash {
        hash_tagged(tags::TX, &self.encode())
    }

    /// True when the sole input carries the coinbase sentinel.
    pub fn is_coinbase(&self) -> bool {
        self.inputs.len() == 1 && self.inputs[0].prev.is_coinbase_sentinel()
    }

    /// Sum of output amounts, `None` on overflow.
    pub fn output_total(&self) -> Option<u64> {
        self.outputs
            .iter()
            .try_fold(0u64, |acc, o| acc.checked_add(o.amount))
    }
}

impl Encodable for Transaction {
    fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.version.to_le_bytes());
        write_var_int(out, self.inputs.len() as u64);
        for input in &self.inputs {
            input.encode_into(out);
        }
        write_var_int(out, self.outputs.len() as u64);
        for output in &self.outputs {
            output.encode_into(out);
        }
        out.extend_from_slice(&self.lock_time.to_le_bytes());
    }
}

impl Decodable for Transaction {
    const NAME: &'static str = "transaction";

    fn decode_from(r: &mut Reader<'_>) -> CodecResult<Self> {
        let version = r.read_u32()?;
        let n_inputs = r.read_count(limits::MAX_TX_SLOTS, "inputs")?;
        let mut inputs = Vec::with_capacity(n_inputs.min(1024));
        for _ in 0..n_inputs {
            inputs.push(TxInput::decode_from(r)?);
        }
        let n_outputs = r.read_count(limits::MAX_TX_SLOTS, "outputs")?;
        let mut outputs = Vec::with_capacity(n_outputs.min(1024));
        for _ in 0..n_outputs {
            outputs.push(TxOutput::decode_from(r)?);
        }
        let lock_time = r.read_u32()?;
        Ok(Self {
            version,
            inputs,
            outputs,
            lock_time,
        })
    }
}

/// Block header. The block hash is the proof-of-work hash of the canonical
/// 84-byte encoding; `target` is the compact encoding of the PoW threshold.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct BlockHeader {
    pub version: u32,
    pub prev_block: Hash,
    pub merkle_root: Hash,
    /// Unix time in seconds.
    pub time: u32,
    /// Compact-encoded 256-bit PoW threshold.
    pub target: u32,
    pub nonce: u64,
}

impl Encodable for BlockHeader {
    fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.version.to_le_bytes());
        out.extend_from_slice(self.prev_block.as_bytes());
        out.extend_from_slice(self.merkle_root.as_bytes());
        out.extend_from_slice(&self.time.to_le_bytes());
        out.extend_from_slice(&self.target.to_le_bytes());
        out.extend_from_slice(&self.nonce.to_le_bytes());
    }
}

impl Decodable for BlockHeader {
    const NAME: &'static str = "header";

    fn decode_from(r: &mut Reader<'_>) -> CodecResult<Self> {
        let version = r.read_u32()?;
        let prev_block = Hash::from_slice(r.read_bytes(32)?)
            .ok_or(CodecError::InvalidValue { what: "prev_block" })?;
        let merkle_root = Hash::from_slice(r.read_bytes(32)?)
            .ok_or(CodecError::InvalidValue { what: "merkle_root" })?;
        let time = r.read_u32()?;
        let target = r.read_u32()?;
        let nonce = r.read_u64()?;
        Ok(Self {
            version,
            prev_block,
            merkle_root,
            time,
            target,
            nonce,
        })
    }
}

/// A block: header plus ordered transactions, the first of which must be the
/// coinbase.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
}

impl Block {
    /// The coinbase, when the block has at least one transaction.
    pub fn coinbase(&self) -> Option<&Transaction> {
        self.transactions.first()
    }

    /// Ids of all transactions, in block order.
    pub fn txids(&self) -> Vec<Hash> {
        self.transactions.iter().map(|tx| tx.txid()).collect()
    }
}

impl Encodable for Block {
    fn encode_into(&self, out: &mut Vec<u8>) {
        self.header.encode_into(out);
        write_var_int(out, self.transactions.len() as u64);
        for tx in &self.transactions {
            tx.encode_into(out);
        }
    }
}

impl Decodable for Block {
    const NAME: &'static str = "block";

    fn decode_from(r: &mut Reader<'_>) -> CodecResult<Self> {
        let header = BlockHeader::decode_from(r)?;
        let n_txs = r.read_count(limits::MAX_BLOCK_TX_SLOTS, "transactions")?;
        let mut transactions = Vec::with_capacity(n_txs.min(1024));
        for _ in 0..n_txs {
            transactions.push(Transaction::decode_from(r)?);
        }
        Ok(Self {
            header,
            transactions,
        })
    }

    fn decode(bytes: &[u8]) -> CodecResult<Self> {
        if bytes.len() > limits::MAX_BLOCK_BYTES {
            return Err(CodecError::CapExceeded {
                what: "block",
                len: bytes.len(),
                cap: limits::MAX_BLOCK_BYTES,
            });
        }
        let mut r = Reader::new(bytes);
        let v = Self::decode_from(&mut r)?;
        r.expect_empty(Self::NAME)?;
        Ok(v)
    }
}

/// An unspent output as tracked by the UTXO set.
///
/// Storage layout: amount (u64 le) | height (u32 le) | flags (u8) | script.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct UtxoEntry {
    pub output: TxOutput,
    /// Height of the block that created the output.
    pub height: u32,
    /// Whether the creating transaction was a coinbase (maturity applies).
    pub is_coinbase: bool,
}

impl UtxoEntry {
    pub fn new(output: TxOutput, height: u32, is_coinbase: bool) -> Self {
        Self {
            output,
            height,
            is_coinbase,
        }
    }
}

impl Encodable for UtxoEntry {
    fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.output.amount.to_le_bytes());
        out.extend_from_slice(&self.height.to_le_bytes());
        out.push(self.is_coinbase as u8);
        write_var_bytes(out, &self.output.script);
    }
}

impl Decodable for UtxoEntry {
    const NAME: &'static str = "utxo entry";

    fn decode_from(r: &mut Reader<'_>) -> CodecResult<Self> {
        let amount = r.read_u64()?;
        let height = r.read_u32()?;
        let flags = r.read_u8()?;
        if flags > 1 {
            return Err(CodecError::InvalidValue { what: "utxo flags" });
        }
        let script = r.read_var_bytes(limits::MAX_SCRIPT_BYTES, "script")?;
        Ok(Self {
            output: TxOutput { amount, script },
            height,
            is_coinbase: flags == 1,
        })
    }
}

/// Per-block undo data: the full entry behind every non-coinbase input the
/// block consumed, in block order. Re-inserting them (and deleting the
/// block's own outputs) reverts a disconnect exactly.
#[derive(Clone, PartialEq, Eq, Debug, Default)]
pub struct UndoRecord {
    pub spent: Vec<UtxoEntry>,
}

impl Encodable for UndoRecord {
    fn encode_into(&self, out: &mut Vec<u8>) {
        write_var_int(out, self.spent.len() as u64);
        for entry in &self.spent {
            entry.encode_into(out);
        }
    }
}

impl Decodable for UndoRecord {
    const NAME: &'static str = "undo record";

    fn decode_from(r: &mut Reader<'_>) -> CodecResult<Self> {
        let n = r.read_count(
            limits::MAX_BLOCK_TX_SLOTS * 4,
            "undo entries",
        )?;
        let mut spent = Vec::with_capacity(n.min(1024));
        for _ in 0..n {
            spent.push(UtxoEntry::decode_from(r)?);
        }
        Ok(Self { spent })
    }
}
