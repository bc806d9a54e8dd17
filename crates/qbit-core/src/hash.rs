//! Domain-separated hashing.
//!
//! Every hash in the system is a Blake2b-256 over `len(tag) || tag || data`.
//! Distinct tags for headers, transactions and Merkle nodes guarantee that
//! hashes of different kinds can never collide by construction.

use blake2::{Blake2b, Digest};
use serde::{Deserialize, Serialize};
use std::fmt;

type Blake2b256 = Blake2b<blake2::digest::consts::U32>;

/// Size of a hash in bytes.
pub const HASH_SIZE: usize = 32;

/// Domain-separation tags.
pub mod tags {
    /// Transaction id.
    pub const TX: &[u8] = b"qbit/tx";
    /// Merkle leaf.
    pub const MERKLE_LEAF: &[u8] = b"qbit/leaf";
    /// Merkle interior node.
    pub const MERKLE_NODE: &[u8] = b"qbit/node";
    /// Transaction signature hash.
    pub const SIGHASH: &[u8] = b"qbit/sighash";
    /// Public key hash used by scripts.
    pub const KEY: &[u8] = b"qbit/key";
    /// Proof-of-work kernel seed.
    pub const POW_SEED: &[u8] = b"qbit/pow/seed";
    /// Proof-of-work kernel finalization.
    pub const POW_FINAL: &[u8] = b"qbit/pow/final";
    /// UTXO set dump checksum.
    pub const UTXO_DUMP: &[u8] = b"qbit/utxo";
}

/// A 32-byte hash. Used as block id, transaction id and Merkle node.
///
/// Ordering is lexicographic over the bytes.
#[derive(
    Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Hash(pub [u8; HASH_SIZE]);

impl Hash {
    /// The all-zero hash. Used as the coinbase prevout sentinel and as the
    /// parent of genesis.
    pub const ZERO: Hash = Hash([0u8; HASH_SIZE]);

    /// Construct from a slice; fails unless it is exactly 32 bytes.
    pub fn from_slice(bytes: &[u8]) -> Option<Hash> {
        if bytes.len() != HASH_SIZE {
            return None;
        }
        let mut arr = [0u8; HASH_SIZE];
        arr.copy_from_slice(bytes);
        Some(Hash(arr))
    }

    pub fn as_bytes(&self) -> &[u8; HASH_SIZE] {
        &self.0
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.0.to_vec()
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; HASH_SIZE]
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({})", hex::encode(self.0))
    }
}

impl AsRef<[u8]> for Hash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Tagged hash: `Blake2b256(len(tag) || tag || data)`.
pub fn hash_tagged(tag: &[u8], data: &[u8]) -> Hash {
    debug_assert!(tag.len() <= u8::MAX as usize);
    let mut hasher = Blake2b256::new();
    Digest::update(&mut hasher, [tag.len() as u8]);
    Digest::update(&mut hasher, tag);
    Digest::update(&mut hasher, data);
    Hash(hasher.finalize().into())
}

/// Tagged hash over two concatenated parts, avoiding an intermediate copy.
pub fn hash_tagged2(tag: &[u8], a: &[u8], b: &[u8]) -> Hash {
    debug_assert!(tag.len() <= u8::MAX as usize);
    let mut hasher = Blake2b256::new();
    Digest::update(&mut hasher, [tag.len() as u8]);
    Digest::update(&mut hasher, tag);
    Digest::update(&mut hasher, a);
    Digest::update(&mut hasher, b);
    Hash(hasher.finalize().into())
}
