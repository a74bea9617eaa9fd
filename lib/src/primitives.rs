use serde::{Deserialize, Serialize};

/// Height of a tipset in the chain. Signed to allow "unset" sentinels in
/// arithmetic without wrapping.
pub type ChainEpoch = i64;

/// Size of one Merkle leaf in bytes.
pub const LEAF_SIZE: u64 = 32;

/// Identifier of an on-chain proof set.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct ProofSetId(pub u64);

impl std::fmt::Display for ProofSetId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Round `n` up to the next power of two. `0` and `1` both map to `1`.
pub fn next_pow2(n: u64) -> u64 {
    n.max(1).next_power_of_two()
}

/// Number of leaves a byte span occupies once zero-padded out to a
/// power-of-two leaf count.
pub fn padded_leaf_count(raw_bytes: u64) -> u64 {
    next_pow2(raw_bytes.div_ceil(LEAF_SIZE))
}

/// Tree height (number of hashing levels) for a leaf count. A single leaf
/// has height 0.
pub fn tree_height(leaves: u64) -> u32 {
    debug_assert!(leaves.is_power_of_two());
    leaves.trailing_zeros()
}
