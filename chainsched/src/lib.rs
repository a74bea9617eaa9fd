//! Chain head tracking: tipset types, the client seam to the chain node,
//! and the single-subscription scheduler that fans head changes out to
//! registered handlers.

mod scheduler;

pub use scheduler::{ChainScheduler, SchedulerError, RESUBSCRIBE_WAIT};

use piri_lib::ChainEpoch;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Opaque identifier of a tipset, as handed back to the node for
/// randomness lookups.
#[derive(Clone, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TipSetKey(pub Vec<u8>);

impl std::fmt::Display for TipSetKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(&self.0))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TipSet {
    pub height: ChainEpoch,
    pub key: TipSetKey,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum HeadChangeKind {
    /// Initial snapshot delivered once per subscription.
    Current,
    /// New best tipset.
    Apply,
    /// Rolled-back tipset.
    Revert,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeadChange {
    pub kind: HeadChangeKind,
    pub tipset: TipSet,
}

/// The node-facing chain API the core consumes.
#[async_trait::async_trait]
pub trait ChainClient: Send + Sync + 'static {
    async fn chain_head(&self) -> anyhow::Result<TipSet>;

    /// Open a head-change subscription. The first delivered batch is a
    /// single [`HeadChangeKind::Current`] snapshot.
    async fn chain_notify(&self) -> anyhow::Result<mpsc::Receiver<Vec<HeadChange>>>;

    /// Beacon randomness for an epoch, evaluated against `key`.
    async fn beacon_randomness(
        &self,
        epoch: ChainEpoch,
        key: &TipSetKey,
    ) -> anyhow::Result<[u8; 32]>;
}

/// A consumer of head changes registered on the scheduler. Invocations
/// for successive notifications may overlap; implementations stay
/// idempotent by guarding their database transitions.
#[async_trait::async_trait]
pub trait ChainHandler: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    async fn on_head_change(
        &self,
        revert: Option<&TipSet>,
        apply: Option<&TipSet>,
    ) -> anyhow::Result<()>;
}
