//! Scheduling of each subsequent proving period, including repair of
//! windows that slipped while the node was down or congested.

use std::sync::{Arc, OnceLock};

use alloy_primitives::{Address, U256};
use anyhow::{anyhow, Context};
use piri_chainsched::{ChainClient, ChainHandler, TipSet};
use piri_db::Db;
use piri_tasks::{TaskAdder, TaskHandler, TaskId, TaskResult, TaskTypeDetails};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::contract::{decode_invalid_challenge_epoch, pack_next_proving_period};
use crate::proving::adjust_next_prove_at;
use crate::sender::{Sender, SenderError, UnsignedTx};
use crate::service::Service;
use crate::store::{self, ProofSetRow};
use crate::verifier::Verifier;

pub struct NextProvingPeriodTask {
    db: Db,
    chain: Arc<dyn ChainClient>,
    verifier: Arc<dyn Verifier>,
    service: Arc<dyn Service>,
    sender: Arc<dyn Sender>,
    owner: Address,
    adder: OnceLock<TaskAdder>,
}

impl NextProvingPeriodTask {
    pub const NAME: &'static str = "PDPProvingPeriod";

    pub fn new(
        db: Db,
        chain: Arc<dyn ChainClient>,
        verifier: Arc<dyn Verifier>,
        service: Arc<dyn Service>,
        sender: Arc<dyn Sender>,
        owner: Address,
    ) -> Arc<Self> {
        Arc::new(Self {
            db,
            chain,
            verifier,
            service,
            sender,
            owner,
            adder: OnceLock::new(),
        })
    }
}

#[async_trait::async_trait]
impl TaskHandler for NextProvingPeriodTask {
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
        match self.next_proving_period(id).await {
            Ok(outcome) => outcome,
            Err(err) => TaskResult::Retry(err),
        }
    }
}

impl NextProvingPeriodTask {
    async fn next_proving_period(&self, id: TaskId) -> anyhow::Result<TaskResult> {
        let Some(set) = store::proof_set_for_challenge_task(&self.db, id).await? else {
            return Ok(TaskResult::Done(Some(anyhow!(
                "no proof set claims this task"
            ))));
        };

        let head = self.chain.chain_head().await.context("loading chain head")?;
        let finality = self
            .verifier
            .challenge_finality()
            .await
            .context("loading challenge finality")?;
        let min_allowed = head.height + finality;

        let window_start = self
            .service
            .next_challenge_window_start(set.id)
            .await
            .context("loading next challenge window")?;
        let window_end = window_start + set.challenge_window as i64;

        if min_allowed > window_end {
            // The window already slipped; reschedule without sending and
            // let the chain watcher pick the set up again at the new
            // window.
            let current = set.prove_at_epoch.unwrap_or(window_start);
            let next_at = adjust_next_prove_at(
                current,
                min_allowed,
                set.proving_period,
                set.challenge_window,
            );
            store::defer_prove_at(&self.db, set.id, next_at).await?;
            info!(
                set = set.id,
                prove_at = next_at,
                "challenge window slipped, deferred"
            );
            return Ok(TaskResult::Done(None));
        }

        let challenge_epoch = if window_start < min_allowed {
            min_allowed
        } else {
            window_start
        };

        let input = pack_next_proving_period(set.id, challenge_epoch);
        let sent = self
            .sender
            .send(
                self.owner,
                UnsignedTx {
                    to: self.verifier.address(),
                    value: U256::ZERO,
                    input,
                },
                "pdp-next-proving-period",
            )
            .await;

        let msg_hash = match sent {
            Ok(hash) => hash,
            Err(SenderError::Reverted(data)) => {
                if let Some((err_min, err_max)) = decode_invalid_challenge_epoch(&data) {
                    return self
                        .defer_into_band(&set, challenge_epoch, err_min, err_max)
                        .await;
                }
                return Ok(TaskResult::Retry(anyhow!(
                    "nextProvingPeriod reverted with undecodable data"
                )));
            }
            Err(SenderError::Other(err)) => return Ok(TaskResult::Retry(err)),
        };

        let set_id = set.id;
        let height = head.height;
        self.db
            .retry_tx(move |tx| {
                store::record_challenge_request(tx, set_id, msg_hash, height, challenge_epoch)
            })
            .await?;

        info!(set = set.id, prove_at = challenge_epoch, msg = %msg_hash, "next proving period requested");
        Ok(TaskResult::Done(None))
    }

    /// The contract told us the band it will accept; clamp into it with
    /// the window-advancement rule and defer.
    async fn defer_into_band(
        &self,
        set: &ProofSetRow,
        attempted: i64,
        err_min: i64,
        err_max: i64,
    ) -> anyhow::Result<TaskResult> {
        let adjusted = adjust_next_prove_at(
            attempted,
            err_min,
            set.proving_period,
            set.challenge_window,
        )
        .min(err_max);
        store::defer_prove_at(&self.db, set.id, adjusted).await?;
        warn!(
            set = set.id,
            attempted,
            err_min,
            err_max,
            deferred_to = adjusted,
            "contract rejected challenge epoch, deferred"
        );
        Ok(TaskResult::Done(Some(anyhow!(
            "InvalidChallengeEpoch({err_min}, {err_max}); deferred to {adjusted}"
        ))))
    }
}

#[async_trait::async_trait]
impl ChainHandler for NextProvingPeriodTask {
    fn name(&self) -> &'static str {
        "pdp-next-proving-period"
    }

    async fn on_head_change(
        &self,
        _revert: Option<&TipSet>,
        apply: Option<&TipSet>,
    ) -> anyhow::Result<()> {
        let Some(apply) = apply else {
            return Ok(());
        };
        let Some(adder) = self.adder.get() else {
            return Ok(());
        };
        for set_id in store::proof_sets_needing_next(&self.db, apply.height).await? {
            let enqueued = adder
                .add(move |task_id, tx| store::claim_challenge_task(tx, set_id, task_id))
                .await?;
            if let Some(task) = enqueued {
                info!(set = set_id, task, "queued next proving period");
            } else {
                debug!(set = set_id, "next period already scheduled, skipping");
            }
        }
        Ok(())
    }
}
