//! The signing oracle seam. Nonce and gas policy live behind it; the
//! pipeline only supplies destination, value, and call data.

use alloy_primitives::{Address, Bytes, B256, U256};

/// An unsigned call. Gas fields and nonce are deliberately absent; the
/// sender fills them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsignedTx {
    pub to: Address,
    pub value: U256,
    pub input: Bytes,
}

#[derive(Debug, thiserror::Error)]
pub enum SenderError {
    /// The node simulated or executed the call and it reverted; the raw
    /// revert data may decode to a typed contract error.
    #[error("transaction reverted ({} bytes of revert data)", .0.len())]
    Reverted(Bytes),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[async_trait::async_trait]
pub trait Sender: Send + Sync + 'static {
    /// Sign and submit, returning the signed transaction hash. `reason`
    /// is an audit tag recorded by the implementation.
    async fn send(
        &self,
        from: Address,
        tx: UnsignedTx,
        reason: &str,
    ) -> Result<B256, SenderError>;
}
