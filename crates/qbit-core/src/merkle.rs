//! Merkle tree over transaction ids.
//!
//! Leaves and interior nodes use distinct hash tags. Odd levels duplicate
//! their last element, Bitcoin-style.

use crate::hash::{hash_tagged, hash_tagged2, tags, Hash};

/// Merkle root of a list of transaction ids.
///
/// An empty list yields the zero hash; valid blocks always carry at least the
/// coinbase, so this case never reaches consensus.
pub fn merkle_root(txids: &[Hash]) -> Hash {
    if txids.is_empty() {
        return Hash::ZERO;
    }

    let mut level: Vec<Hash> = txids
        .iter()
        .map(|id| hash_tagged(tags::MERKLE_LEAF, id.as_bytes()))
        .collect();

    while level.len() > 1 {
        let mut next = Vec::with_capacity(level.len().div_ceil(2));
        for pair in level.chunks(2) {
            let left = &pair[0];
            let right = pair.get(1).unwrap_or(left);
            next.push(hash_tagged2(
                tags::MERKLE_NODE,
                left.as_bytes(),
                right.as_bytes(),
            ));
        }
        level = next;
    }

    level[0]
}
