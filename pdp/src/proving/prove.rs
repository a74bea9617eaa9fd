//! Possession proof generation and submission: challenge derivation from
//! beacon randomness, per-subroot Merkle proofs, partial top-tree
//! reconstruction, local verification, fee headroom, and post-send
//! cleanup of deleted roots.

use std::sync::{Arc, OnceLock, RwLock};

use alloy_primitives::{Address, U256};
use anyhow::{anyhow, bail, Context};
use piri_chainsched::{ChainClient, ChainHandler, TipSet};
use piri_db::Db;
use piri_lib::challenge::challenge_indices;
use piri_lib::merkle::{MerkleProof, MerkleTree, Subroot, TopTree};
use piri_lib::LEAF_SIZE;
use piri_tasks::{TaskAdder, TaskHandler, TaskId, TaskResult, TaskTypeDetails};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::commp::commitment_from_str;
use crate::contract::{pack_prove_possession, PossessionProof};
use crate::pieces::PieceReader;
use crate::sender::{Sender, UnsignedTx};
use crate::store::{self, ProofSetRootRow};
use crate::verifier::Verifier;
use crate::{NUM_CHALLENGES, PROOF_FEE_HEADROOM, PROVE_CANDIDATES_PER_TICK};

pub struct ProveTask {
    db: Db,
    chain: Arc<dyn ChainClient>,
    verifier: Arc<dyn Verifier>,
    sender: Arc<dyn Sender>,
    pieces: Arc<dyn PieceReader>,
    owner: Address,
    adder: OnceLock<TaskAdder>,
    /// Latest applied tipset, single writer (the chain handler), read by
    /// in-flight provers for randomness lookups.
    head: RwLock<Option<TipSet>>,
}

impl ProveTask {
    pub const NAME: &'static str = "PDPProve";

    pub fn new(
        db: Db,
        chain: Arc<dyn ChainClient>,
        verifier: Arc<dyn Verifier>,
        sender: Arc<dyn Sender>,
        pieces: Arc<dyn PieceReader>,
        owner: Address,
    ) -> Arc<Self> {
        Arc::new(Self {
            db,
            chain,
            verifier,
            sender,
            pieces,
            owner,
            adder: OnceLock::new(),
            head: RwLock::new(None),
        })
    }

    async fn current_head(&self) -> anyhow::Result<TipSet> {
        if let Some(head) = self.head.read().unwrap().clone() {
            return Ok(head);
        }
        self.chain.chain_head().await
    }
}

#[async_trait::async_trait]
impl TaskHandler for ProveTask {
    fn details(&self) -> TaskTypeDetails {
        TaskTypeDetails {
            name: Self::NAME,
            max_failures: 0,
            retry_wait: Some(|_| std::time::Duration::from_secs(10)),
            periodic: None,
        }
    }

    fn register_adder(&self, adder: TaskAdder) {
        let _ = self.adder.set(adder);
    }

    async fn do_work(&self, id: TaskId, _cancel: CancellationToken) -> TaskResult {
        match self.prove(id).await {
            Ok(outcome) => outcome,
            Err(err) => TaskResult::Retry(err),
        }
    }
}

impl ProveTask {
    async fn prove(&self, id: TaskId) -> anyhow::Result<TaskResult> {
        let Some(set_id) = store::prove_task_set(&self.db, id).await? else {
            return Ok(TaskResult::Done(Some(anyhow!(
                "no proof set claims this task"
            ))));
        };

        let challenge_epoch = self
            .verifier
            .next_challenge_epoch(set_id)
            .await
            .context("loading challenge epoch")?;
        let head = self.current_head().await?;
        let seed = self
            .chain
            .beacon_randomness(challenge_epoch, &head.key)
            .await
            .context("loading beacon randomness")?;

        let total_leaves = self
            .verifier
            .challenge_range(set_id)
            .await
            .context("loading challenge range")?;
        if total_leaves == 0 {
            return Ok(TaskResult::Retry(anyhow!("challenge range is empty")));
        }

        let indices = challenge_indices(&seed, set_id, NUM_CHALLENGES, total_leaves);
        let locations = self
            .verifier
            .find_piece_ids(set_id, &indices)
            .await
            .context("resolving challenged pieces")?;
        if locations.len() != indices.len() {
            bail!(
                "verifier resolved {} of {} challenges",
                locations.len(),
                indices.len()
            );
        }

        let mut proofs = Vec::with_capacity(locations.len());
        for location in &locations {
            let proof = self
                .prove_leaf(set_id, location.piece_id, location.leaf_offset)
                .await
                .with_context(|| {
                    format!(
                        "proving piece {} leaf {}",
                        location.piece_id, location.leaf_offset
                    )
                })?;
            proofs.push(PossessionProof {
                leaf: proof.leaf,
                proof: proof.path,
            });
        }

        let fee = self
            .verifier
            .calculate_proof_fee(set_id)
            .await
            .context("estimating proof fee")?
            * U256::from(PROOF_FEE_HEADROOM);

        let input = pack_prove_possession(set_id, proofs);
        let msg_hash = self
            .sender
            .send(
                self.owner,
                UnsignedTx {
                    to: self.verifier.address(),
                    value: fee,
                    input,
                },
                "pdp-prove-possession",
            )
            .await
            .map_err(|err| anyhow!(err))?;

        self.db
            .retry_tx(move |tx| {
                store::insert_message_wait(tx, msg_hash)?;
                store::finish_prove_task(tx, set_id, id)
            })
            .await?;
        info!(set = set_id, epoch = challenge_epoch, msg = %msg_hash, "possession proof submitted");

        // The send is the point of no return; local state of roots the
        // contract already scheduled for removal is dropped afterwards,
        // and ids that are already gone are skipped so a crashed and
        // re-run cleanup converges.
        match self.verifier.scheduled_removals(set_id).await {
            Ok(removals) if !removals.is_empty() => {
                let removed =
                    store::cleanup_deleted_roots(&self.db, set_id, removals.clone()).await?;
                info!(set = set_id, scheduled = removals.len(), removed, "cleaned deleted roots");
            }
            Ok(_) => {}
            Err(err) => warn!(set = set_id, %err, "scheduled removals unavailable"),
        }

        Ok(TaskResult::Done(None))
    }

    /// Build and locally verify the proof for one challenged leaf of one
    /// piece: full tree over the containing subroot's bytes, then the
    /// partial top tree over the piece's subroot commitments.
    async fn prove_leaf(
        &self,
        set_id: u64,
        piece_id: u64,
        leaf_offset: u64,
    ) -> anyhow::Result<MerkleProof> {
        let rows = store::subroots_for_piece(&self.db, set_id, piece_id).await?;
        if rows.is_empty() {
            bail!("no local subroots for piece {piece_id}");
        }

        let subroots = rows
            .iter()
            .map(|row| {
                Ok(Subroot {
                    root: commitment_from_str(&row.subroot_cid)?,
                    offset: row.subroot_offset / LEAF_SIZE,
                    leaves: row.subroot_size / LEAF_SIZE,
                })
            })
            .collect::<anyhow::Result<Vec<_>>>()?;

        let position = subroots
            .iter()
            .position(|subroot| subroot.contains(leaf_offset))
            .ok_or_else(|| anyhow!("leaf {leaf_offset} outside piece {piece_id}"))?;
        let challenged = &subroots[position];
        let row: &ProofSetRootRow = &rows[position];

        let bytes = self
            .pieces
            .read_piece(row.pdp_pieceref)
            .await
            .with_context(|| format!("reading subroot bytes for ref {}", row.pdp_pieceref))?;
        let tree = MerkleTree::from_padded_bytes(&bytes, challenged.leaves);
        if tree.root() != challenged.root {
            bail!(
                "subroot bytes do not hash to {} for piece {piece_id}",
                row.subroot_cid
            );
        }

        let top = TopTree::new(&subroots)?;
        let piece_root = top.root()?;

        let mut proof = tree.proof(leaf_offset - challenged.offset)?;
        proof.index = leaf_offset;
        proof.path.extend(top.path_from(challenged)?);

        if !proof.verify(&piece_root) {
            bail!("assembled proof failed local verification for piece {piece_id}");
        }
        debug!(set = set_id, piece = piece_id, leaf = leaf_offset, "proof verified locally");
        Ok(proof)
    }
}

#[async_trait::async_trait]
impl ChainHandler for ProveTask {
    fn name(&self) -> &'static str {
        "pdp-prove"
    }

    async fn on_head_change(
        &self,
        _revert: Option<&TipSet>,
        apply: Option<&TipSet>,
    ) -> anyhow::Result<()> {
        let Some(apply) = apply else {
            return Ok(());
        };
        *self.head.write().unwrap() = Some(apply.clone());

        let Some(adder) = self.adder.get() else {
            return Ok(());
        };
        let candidates =
            store::proof_sets_needing_prove(&self.db, apply.height, PROVE_CANDIDATES_PER_TICK)
                .await?;
        for set_id in candidates {
            let enqueued = adder
                .add(move |task_id, tx| store::claim_prove_task(tx, set_id, task_id))
                .await?;
            if let Some(task) = enqueued {
                info!(set = set_id, task, "queued possession proof");
            } else {
                debug!(set = set_id, "prove already claimed, skipping");
            }
        }
        Ok(())
    }
}
