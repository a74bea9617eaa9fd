//! Shared primitives for the piri node: chain epochs, padded piece
//! arithmetic, the truncated SHA-256 Merkle tree used by PDP possession
//! proofs, and challenge-index derivation.

pub mod challenge;
pub mod merkle;
pub mod primitives;
pub mod zerocomm;

pub use primitives::{ChainEpoch, LEAF_SIZE};
