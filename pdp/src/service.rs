//! The PDP service contract seam: proving-period geometry.

use piri_lib::ChainEpoch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PdpConfig {
    /// Length of one proving period in epochs.
    pub max_proving_period: u64,
    /// Epochs at the start of a period during which proving is accepted.
    pub challenge_window: u64,
}

#[async_trait::async_trait]
pub trait Service: Send + Sync + 'static {
    async fn pdp_config(&self) -> anyhow::Result<PdpConfig>;

    /// Start epoch of the next challenge window for a proof set.
    async fn next_challenge_window_start(&self, set_id: u64) -> anyhow::Result<ChainEpoch>;
}
