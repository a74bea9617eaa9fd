use alloy_primitives::{keccak256, U256};

/// Derive the `i`-th challenged leaf index for a proof set from the epoch's
/// beacon randomness: `keccak256(seed ‖ be256(set_id) ‖ be64(i)) mod
/// total_leaves`.
pub fn challenge_index(seed: &[u8; 32], proof_set_id: u64, i: u64, total_leaves: u64) -> u64 {
    debug_assert!(total_leaves > 0);
    let mut payload = [0u8; 32 + 32 + 8];
    payload[..32].copy_from_slice(seed);
    payload[32..64].copy_from_slice(&U256::from(proof_set_id).to_be_bytes::<32>());
    payload[64..].copy_from_slice(&i.to_be_bytes());
    let digest = keccak256(payload);
    let value = U256::from_be_bytes(digest.0);
    (value % U256::from(total_leaves)).to::<u64>()
}

/// Derive the full set of challenge indices for one proving epoch.
/// Indices may repeat for tiny data sets; callers prove each slot
/// independently.
pub fn challenge_indices(
    seed: &[u8; 32],
    proof_set_id: u64,
    count: u64,
    total_leaves: u64,
) -> Vec<u64> {
    (0..count)
        .map(|i| challenge_index(seed, proof_set_id, i, total_leaves))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic_and_in_range() {
        let seed = [7u8; 32];
        let a = challenge_indices(&seed, 42, 5, 1000);
        let b = challenge_indices(&seed, 42, 5, 1000);
        assert_eq!(a, b);
        assert!(a.iter().all(|&i| i < 1000));
    }

    #[test]
    fn differs_by_slot_and_set() {
        let seed = [7u8; 32];
        let by_slot = challenge_index(&seed, 42, 0, u64::MAX);
        assert_ne!(by_slot, challenge_index(&seed, 42, 1, u64::MAX));
        assert_ne!(by_slot, challenge_index(&seed, 43, 0, u64::MAX));
    }

    #[test]
    fn single_leaf_always_zero() {
        let seed = [9u8; 32];
        assert_eq!(challenge_index(&seed, 1, 0, 1), 0);
    }
}
