//! Piece-commitment CIDs: CIDv1 with the fil-commitment-unsealed codec
//! over a sha2-256-trunc254-padded digest. Root and subroot columns
//! store these as strings; proving needs the raw 32-byte commitment
//! back out.

use alloy_primitives::B256;
use cid::multihash::Multihash;
use cid::Cid;

/// fil-commitment-unsealed multicodec.
pub const FIL_COMMITMENT_UNSEALED: u64 = 0xf101;
/// sha2-256-trunc254-padded multihash code.
pub const SHA2_256_TRUNC254_PADDED: u64 = 0x1012;

#[derive(Debug, thiserror::Error)]
pub enum CommpError {
    #[error("invalid cid: {0}")]
    Cid(#[from] cid::Error),
    #[error("invalid multihash: {0}")]
    Multihash(#[from] cid::multihash::Error),
    #[error("not a piece commitment cid (codec {0:#x})")]
    WrongCodec(u64),
    #[error("commitment digest is {0} bytes, expected 32")]
    WrongDigestLength(usize),
}

/// Wrap a raw commitment in its CID form.
pub fn commitment_to_cid(commitment: B256) -> Result<Cid, CommpError> {
    let mh = Multihash::<64>::wrap(SHA2_256_TRUNC254_PADDED, commitment.as_slice())?;
    Ok(Cid::new_v1(FIL_COMMITMENT_UNSEALED, mh))
}

/// Extract the raw 32-byte commitment from a piece CID.
pub fn commitment_from_cid(cid: &Cid) -> Result<B256, CommpError> {
    if cid.codec() != FIL_COMMITMENT_UNSEALED {
        return Err(CommpError::WrongCodec(cid.codec()));
    }
    let digest = cid.hash().digest();
    if digest.len() != 32 {
        return Err(CommpError::WrongDigestLength(digest.len()));
    }
    Ok(B256::from_slice(digest))
}

/// Parse a stored column value back into a commitment.
pub fn commitment_from_str(value: &str) -> Result<B256, CommpError> {
    let cid: Cid = value.parse()?;
    commitment_from_cid(&cid)
}
