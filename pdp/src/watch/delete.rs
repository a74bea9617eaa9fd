//! Tears down proof sets whose on-chain deletion confirmed.

use piri_chainsched::{ChainHandler, TipSet};
use piri_db::Db;
use tracing::{info, warn};

use crate::contract::find_proof_set_deleted;
use crate::store;
use crate::watch::stored_receipt;

pub struct DeleteWatcher {
    db: Db,
}

impl DeleteWatcher {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    async fn process(&self, set_id: u64, msg_hash: &str) -> anyhow::Result<()> {
        let Some(receipt) = stored_receipt(&self.db, msg_hash).await? else {
            anyhow::bail!("no stored receipt for delete message {msg_hash}");
        };
        let Some((event_set, deleted_leaves)) = find_proof_set_deleted(&receipt.logs) else {
            anyhow::bail!("delete receipt {msg_hash} carries no ProofSetDeleted event");
        };
        if event_set != set_id {
            anyhow::bail!("delete event names set {event_set}, intent names {set_id}");
        }
        store::finish_delete(&self.db, set_id).await?;
        info!(set = set_id, deleted_leaves, "proof set deleted");
        Ok(())
    }
}

#[async_trait::async_trait]
impl ChainHandler for DeleteWatcher {
    fn name(&self) -> &'static str {
        "pdp-delete"
    }

    async fn on_head_change(
        &self,
        _revert: Option<&TipSet>,
        apply: Option<&TipSet>,
    ) -> anyhow::Result<()> {
        if apply.is_none() {
            return Ok(());
        }
        for (set_id, msg_hash) in store::pending_deletes(&self.db).await? {
            if let Err(err) = self.process(set_id, &msg_hash).await {
                warn!(set = set_id, msg = %msg_hash, %err, "delete unresolved");
            }
        }
        Ok(())
    }
}
