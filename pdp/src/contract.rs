//! ABI fragments of the PDP verifier the pipeline packs and decodes
//! itself. Everything else behind the contract lives in the
//! [`crate::verifier::Verifier`] / [`crate::service::Service`] seams.

use alloy_primitives::{Bytes, LogData, B256, U256};
use alloy_sol_types::{sol, SolCall, SolError, SolEvent};
use piri_lib::ChainEpoch;

use crate::eth::EthLog;

sol! {
    /// One challenged leaf with its sibling path to the piece root.
    struct PossessionProof {
        bytes32 leaf;
        bytes32[] proof;
    }

    function nextProvingPeriod(uint256 setId, uint256 challengeEpoch, bytes extraData);

    function provePossession(uint256 setId, PossessionProof[] proofs);

    error InvalidChallengeEpoch(uint256 minAllowed, uint256 maxAllowed);

    event ProofSetDeleted(uint256 indexed setId, uint256 deletedLeafCount);

    event ProviderRegistered(uint256 indexed providerId, address provider);

    event RootsAdded(uint256 indexed setId, uint256[] rootIds);
}

/// Call data for `nextProvingPeriod(setId, challengeEpoch, "")`.
pub fn pack_next_proving_period(set_id: u64, challenge_epoch: ChainEpoch) -> Bytes {
    let call = nextProvingPeriodCall {
        setId: U256::from(set_id),
        challengeEpoch: U256::from(challenge_epoch as u64),
        extraData: Bytes::new(),
    };
    call.abi_encode().into()
}

/// Call data for `provePossession(setId, proofs)`.
pub fn pack_prove_possession(set_id: u64, proofs: Vec<PossessionProof>) -> Bytes {
    let call = provePossessionCall {
        setId: U256::from(set_id),
        proofs,
    };
    call.abi_encode().into()
}

/// Decode an `InvalidChallengeEpoch(minAllowed, maxAllowed)` revert.
pub fn decode_invalid_challenge_epoch(revert_data: &[u8]) -> Option<(ChainEpoch, ChainEpoch)> {
    InvalidChallengeEpoch::abi_decode(revert_data, true)
        .ok()
        .map(|err| {
            (
                err.minAllowed.to::<u64>() as ChainEpoch,
                err.maxAllowed.to::<u64>() as ChainEpoch,
            )
        })
}

fn to_log_data(log: &EthLog) -> LogData {
    LogData::new_unchecked(log.topics.clone(), log.data.clone())
}

/// Find and decode a `ProofSetDeleted` event in a receipt's logs.
pub fn find_proof_set_deleted(logs: &[EthLog]) -> Option<(u64, u64)> {
    logs.iter()
        .filter(|log| log.topics.first() == Some(&ProofSetDeleted::SIGNATURE_HASH))
        .find_map(|log| {
            let event = ProofSetDeleted::decode_log_data(&to_log_data(log), true).ok()?;
            Some((
                event.setId.to::<u64>(),
                event.deletedLeafCount.to::<u64>(),
            ))
        })
}

/// Provider id from a `ProviderRegistered` event (topic 1).
pub fn find_provider_registered(logs: &[EthLog]) -> Option<u64> {
    logs.iter()
        .filter(|log| log.topics.first() == Some(&ProviderRegistered::SIGNATURE_HASH))
        .find_map(|log| {
            let raw: &B256 = log.topics.get(1)?;
            Some(U256::from_be_bytes(raw.0).to::<u64>())
        })
}

/// Root ids assigned by a confirmed root-add, in message order.
pub fn find_roots_added(logs: &[EthLog], set_id: u64) -> Option<Vec<u64>> {
    logs.iter()
        .filter(|log| log.topics.first() == Some(&RootsAdded::SIGNATURE_HASH))
        .find_map(|log| {
            let event = RootsAdded::decode_log_data(&to_log_data(log), true).ok()?;
            if event.setId != U256::from(set_id) {
                return None;
            }
            Some(event.rootIds.iter().map(|id| id.to::<u64>()).collect())
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::Address;
    use alloy_sol_types::SolValue;

    #[test]
    fn next_proving_period_roundtrip() {
        let data = pack_next_proving_period(7, 1234);
        let call = nextProvingPeriodCall::abi_decode(&data, true).unwrap();
        assert_eq!(call.setId, U256::from(7));
        assert_eq!(call.challengeEpoch, U256::from(1234));
        assert!(call.extraData.is_empty());
    }

    #[test]
    fn prove_possession_roundtrip() {
        let proofs = vec![PossessionProof {
            leaf: B256::repeat_byte(0x11),
            proof: vec![B256::repeat_byte(0x22), B256::repeat_byte(0x33)],
        }];
        let data = pack_prove_possession(3, proofs.clone());
        let call = provePossessionCall::abi_decode(&data, true).unwrap();
        assert_eq!(call.setId, U256::from(3));
        assert_eq!(call.proofs.len(), 1);
        assert_eq!(call.proofs[0].leaf, proofs[0].leaf);
        assert_eq!(call.proofs[0].proof, proofs[0].proof);
    }

    #[test]
    fn invalid_challenge_epoch_decodes() {
        let err = InvalidChallengeEpoch {
            minAllowed: U256::from(100),
            maxAllowed: U256::from(130),
        };
        let encoded = err.abi_encode();
        assert_eq!(decode_invalid_challenge_epoch(&encoded), Some((100, 130)));
        assert_eq!(decode_invalid_challenge_epoch(&[0u8; 4]), None);
    }

    #[test]
    fn proof_set_deleted_decodes_from_log() {
        let log = EthLog {
            address: Address::ZERO,
            topics: vec![
                ProofSetDeleted::SIGNATURE_HASH,
                B256::from(U256::from(9)),
            ],
            data: U256::from(4096).abi_encode().into(),
        };
        assert_eq!(find_proof_set_deleted(&[log]), Some((9, 4096)));
    }

    #[test]
    fn roots_added_decodes_from_log() {
        let ids = vec![U256::from(5), U256::from(6)];
        let log = EthLog {
            address: Address::ZERO,
            topics: vec![RootsAdded::SIGNATURE_HASH, B256::from(U256::from(2))],
            data: ids.abi_encode().into(),
        };
        let logs = [log];
        assert_eq!(find_roots_added(&logs, 2), Some(vec![5, 6]));
        assert_eq!(find_roots_added(&logs, 3), None);
    }
}
