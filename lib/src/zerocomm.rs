use alloy_primitives::B256;
use once_cell::sync::Lazy;

use crate::merkle::hash_pair;

/// Levels of zero-commitment to precompute. Level 0 is a 32-byte zero leaf;
/// level 64 covers far more data than a piece can hold.
const MAX_LEVEL: usize = 64;

static ZERO_COMMITMENTS: Lazy<Vec<B256>> = Lazy::new(|| {
    let mut table = Vec::with_capacity(MAX_LEVEL + 1);
    table.push(B256::ZERO);
    for level in 1..=MAX_LEVEL {
        let below = table[level - 1];
        table.push(hash_pair(&below, &below));
    }
    table
});

/// Root of a fully-zero subtree with `2^level` leaves.
pub fn zero_comm(level: u32) -> B256 {
    ZERO_COMMITMENTS[level as usize]
}
