//! Typed views of Ethereum receipts and transactions as the watcher
//! stores them. Rows in `message_waits_eth` hold these serialized as
//! JSON so operators can inspect them and downstream watchers can decode
//! events without another node round trip.

use alloy_primitives::{Address, Bytes, B256, U256};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EthLog {
    pub address: Address,
    pub topics: Vec<B256>,
    pub data: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EthReceipt {
    pub transaction_hash: B256,
    pub block_number: u64,
    /// Execution status: true = success.
    pub status: bool,
    pub logs: Vec<EthLog>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EthTx {
    pub hash: B256,
    pub to: Option<Address>,
    pub value: U256,
    pub input: Bytes,
    pub nonce: u64,
}

/// Receipt-side API of the chain node. `Ok(None)` means the node does
/// not know the hash (yet); it is never retried within a pass.
#[async_trait::async_trait]
pub trait EthClient: Send + Sync + 'static {
    async fn transaction_receipt(&self, hash: B256) -> anyhow::Result<Option<EthReceipt>>;

    async fn transaction_by_hash(&self, hash: B256) -> anyhow::Result<Option<EthTx>>;
}
