//! The PDP verifier contract seam: challenge parameters, piece lookup,
//! fees, and scheduled removals.

use alloy_primitives::{Address, U256};
use piri_lib::ChainEpoch;

/// Where a challenged leaf lives: which piece (root) of the proof set,
/// and the leaf offset inside that piece.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PieceLocation {
    pub piece_id: u64,
    pub leaf_offset: u64,
}

/// One entry of the contract's active-piece enumeration, used when a
/// receipt is no longer reachable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivePiece {
    pub piece_id: u64,
    /// CommP cid bytes as the contract stores them.
    pub piece_cid: Vec<u8>,
    pub raw_size: u64,
}

#[async_trait::async_trait]
pub trait Verifier: Send + Sync + 'static {
    /// Contract address transactions are sent to.
    fn address(&self) -> Address;

    /// Minimum epochs between submission and the challenge epoch it
    /// targets.
    async fn challenge_finality(&self) -> anyhow::Result<ChainEpoch>;

    /// Total challengeable leaves of a proof set.
    async fn challenge_range(&self, set_id: u64) -> anyhow::Result<u64>;

    /// Resolve absolute challenge leaf indices to piece-relative
    /// locations, in input order.
    async fn find_piece_ids(
        &self,
        set_id: u64,
        leaves: &[u64],
    ) -> anyhow::Result<Vec<PieceLocation>>;

    async fn next_challenge_epoch(&self, set_id: u64) -> anyhow::Result<ChainEpoch>;

    async fn calculate_proof_fee(&self, set_id: u64) -> anyhow::Result<U256>;

    async fn data_set_storage_provider(&self, set_id: u64) -> anyhow::Result<Address>;

    async fn data_set_listener(&self, set_id: u64) -> anyhow::Result<Address>;

    /// Piece ids queued for removal at the next proving boundary.
    async fn scheduled_removals(&self, set_id: u64) -> anyhow::Result<Vec<u64>>;

    async fn active_piece_count(&self, set_id: u64) -> anyhow::Result<u64>;

    async fn active_pieces(
        &self,
        set_id: u64,
        offset: u64,
        limit: u64,
    ) -> anyhow::Result<Vec<ActivePiece>>;
}
