//! Transaction ordering by fee rate.

use qbit_core::Hash;
use std::cmp::Ordering;

/// Ordering key for a pooled transaction: higher fee per byte first, earlier
/// arrival breaking ties.
#[derive(Debug, Clone)]
pub struct FeeOrdering {
    pub txid: Hash,
    /// Fee in sub-units.
    pub fee: u64,
    /// Encoded size in bytes.
    pub size: usize,
    /// Monotone arrival sequence.
    pub arrival: u64,
}

impl FeeOrdering {
    pub fn new(txid: Hash, fee: u64, size: usize, arrival: u64) -> Self {
        Self {
            txid,
            fee,
            size,
            arrival,
        }
    }

    /// Fee per byte, scaled by 1000 to stay in integers.
    pub fn fee_rate_millis(&self) -> u64 {
        if self.size == 0 {
            0
        } else {
            self.fee.saturating_mul(1000) / self.size as u64
        }
    }
}

impl PartialEq for FeeOrdering {
    fn eq(&self, other: &Self) -> bool {
        self.txid == other.txid
    }
}

impl Eq for FeeOrdering {}

impl PartialOrd for FeeOrdering {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for FeeOrdering {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed fee-rate comparison so the best transaction sorts first
        // in a BTreeSet.
        other
            .fee_rate_millis()
            .cmp(&self.fee_rate_millis())
            .then(self.arrival.cmp(&other.arrival))
            .then(self.txid.cmp(&other.txid))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qbit_core::{hash_tagged, tags};
    use std::collections::BTreeSet;

    fn id(n: u8) -> Hash {
        hash_tagged(tags::TX, &[n])
    }

    #[test]
    fn test_ordering_by_fee_rate_then_arrival() {
        let a = FeeOrdering::new(id(1), 1_000, 100, 5); // 10/byte
        let b = FeeOrdering::new(id(2), 2_000, 100, 6); // 20/byte
        let c = FeeOrdering::new(id(3), 1_000, 100, 4); // 10/byte, earlier

        let set: BTreeSet<_> = [a, b, c].into_iter().collect();
        let order: Vec<_> = set.into_iter().map(|o| o.arrival).collect();
        assert_eq!(order, vec![6, 4, 5]);
    }

    #[test]
    fn test_zero_size_sorts_last() {
        let real = FeeOrdering::new(id(1), 10, 10, 1);
        let degenerate = FeeOrdering::new(id(2), 10, 0, 0);
        assert!(real < degenerate);
    }
}
