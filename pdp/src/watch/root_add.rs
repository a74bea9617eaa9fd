//! Materializes confirmed root-add intents into `pdp_proofset_roots`
//! rows carrying the chain-assigned piece ids.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Context};
use cid::Cid;
use piri_chainsched::{ChainHandler, TipSet};
use piri_db::Db;
use tracing::{info, warn};

use crate::contract::find_roots_added;
use crate::store::{self, RootAddRow};
use crate::verifier::Verifier;
use crate::watch::stored_receipt;
use crate::ACTIVE_PIECES_PAGE;

pub struct RootAddWatcher {
    db: Db,
    verifier: Arc<dyn Verifier>,
}

impl RootAddWatcher {
    pub fn new(db: Db, verifier: Arc<dyn Verifier>) -> Self {
        Self { db, verifier }
    }

    async fn process_message(&self, set_id: u64, msg_hash: &str) -> anyhow::Result<()> {
        let rows = store::root_add_rows(&self.db, set_id, msg_hash).await?;
        if rows.is_empty() {
            return Ok(());
        }

        let assignments = match self.receipt_root_ids(set_id, msg_hash).await? {
            Some(ids) => rows
                .iter()
                .map(|row| row.add_message_index)
                .collect::<std::collections::BTreeSet<_>>()
                .into_iter()
                .map(|index| {
                    ids.get(index as usize)
                        .map(|id| (index, *id))
                        .ok_or_else(|| {
                            anyhow!("receipt assigned {} roots, need index {index}", ids.len())
                        })
                })
                .collect::<anyhow::Result<Vec<_>>>()?,
            // The node may have pruned the receipt; reconstruct from the
            // contract's active-piece enumeration instead.
            None => self.enumerate_root_ids(set_id, &rows).await?,
        };

        let roots = assignments.len();
        store::resolve_root_add(&self.db, set_id, msg_hash, rows, assignments).await?;
        info!(set = set_id, msg = msg_hash, roots, "root add resolved");
        Ok(())
    }

    async fn receipt_root_ids(
        &self,
        set_id: u64,
        msg_hash: &str,
    ) -> anyhow::Result<Option<Vec<u64>>> {
        let Some(receipt) = stored_receipt(&self.db, msg_hash).await? else {
            return Ok(None);
        };
        Ok(find_roots_added(&receipt.logs, set_id))
    }

    /// Page `getActivePieces` and match intent rows by piece CID bytes.
    /// Any unmatched root is an error; the message is retried on a later
    /// apply.
    async fn enumerate_root_ids(
        &self,
        set_id: u64,
        rows: &[RootAddRow],
    ) -> anyhow::Result<Vec<(u64, u64)>> {
        let total = self
            .verifier
            .active_piece_count(set_id)
            .await
            .context("loading active piece count")?;
        let mut by_cid: HashMap<Vec<u8>, u64> = HashMap::new();
        let mut offset = 0;
        while offset < total {
            let page = self
                .verifier
                .active_pieces(set_id, offset, ACTIVE_PIECES_PAGE)
                .await
                .context("paging active pieces")?;
            if page.is_empty() {
                break;
            }
            offset += page.len() as u64;
            for piece in page {
                by_cid.entry(piece.piece_cid).or_insert(piece.piece_id);
            }
        }

        let mut assignments = Vec::new();
        for row in rows {
            if assignments
                .iter()
                .any(|(index, _)| *index == row.add_message_index)
            {
                continue;
            }
            let cid: Cid = row
                .root_cid
                .parse()
                .with_context(|| format!("root cid {}", row.root_cid))?;
            let piece_id = by_cid.get(&cid.to_bytes()).ok_or_else(|| {
                anyhow!(
                    "active pieces of set {set_id} do not include root {}",
                    row.root_cid
                )
            })?;
            assignments.push((row.add_message_index, *piece_id));
        }
        Ok(assignments)
    }
}

#[async_trait::async_trait]
impl ChainHandler for RootAddWatcher {
    fn name(&self) -> &'static str {
        "pdp-root-add"
    }

    async fn on_head_change(
        &self,
        _revert: Option<&TipSet>,
        apply: Option<&TipSet>,
    ) -> anyhow::Result<()> {
        if apply.is_none() {
            return Ok(());
        }
        store::mark_root_adds(&self.db).await?;
        for (set_id, msg_hash) in store::ready_root_add_messages(&self.db).await? {
            if let Err(err) = self.process_message(set_id, &msg_hash).await {
                warn!(set = set_id, msg = %msg_hash, %err, "root add unresolved");
            }
        }
        Ok(())
    }
}
