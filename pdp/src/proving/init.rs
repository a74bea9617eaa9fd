//! First proving-period schedule for a freshly created proof set.

use std::sync::{Arc, OnceLock};

use alloy_primitives::{Address, U256};
use anyhow::{anyhow, Context};
use piri_chainsched::{ChainClient, ChainHandler, TipSet};
use piri_db::Db;
use piri_tasks::{TaskAdder, TaskHandler, TaskId, TaskResult, TaskTypeDetails};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::contract::pack_next_proving_period;
use crate::sender::{Sender, UnsignedTx};
use crate::service::Service;
use crate::store;
use crate::verifier::Verifier;

pub struct InitProvingPeriodTask {
    db: Db,
    chain: Arc<dyn ChainClient>,
    verifier: Arc<dyn Verifier>,
    service: Arc<dyn Service>,
    sender: Arc<dyn Sender>,
    owner: Address,
    adder: OnceLock<TaskAdder>,
}

impl InitProvingPeriodTask {
    pub const NAME: &'static str = "PDPInitPP";

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
impl TaskHandler for InitProvingPeriodTask {
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
        match self.init_proving_period(id).await {
            Ok(outcome) => outcome,
            Err(err) => TaskResult::Retry(err),
        }
    }
}

impl InitProvingPeriodTask {
    async fn init_proving_period(&self, id: TaskId) -> anyhow::Result<TaskResult> {
        let Some(set) = store::proof_set_for_challenge_task(&self.db, id).await? else {
            return Ok(TaskResult::Done(Some(anyhow!(
                "no proof set claims this task"
            ))));
        };

        let leaves = store::total_leaves(&self.db, set.id).await?;
        if leaves == 0 {
            debug!(set = set.id, "proof set has no data yet");
            return Ok(TaskResult::Retry(anyhow!("data set has no leaves yet")));
        }

        // Sanity-check the set is wired to a listener before committing
        // to a schedule.
        let listener = self
            .verifier
            .data_set_listener(set.id)
            .await
            .context("loading data set listener")?;
        if listener == Address::ZERO {
            return Ok(TaskResult::Retry(anyhow!("proof set has no listener")));
        }

        let window_start = self
            .service
            .next_challenge_window_start(set.id)
            .await
            .context("loading initial challenge window")?;
        let init_prove_at = window_start + (set.challenge_window / 2) as i64;

        let head = self.chain.chain_head().await.context("loading chain head")?;
        let input = pack_next_proving_period(set.id, init_prove_at);
        let msg_hash = self
            .sender
            .send(
                self.owner,
                UnsignedTx {
                    to: self.verifier.address(),
                    value: U256::ZERO,
                    input,
                },
                "pdp-init-proving-period",
            )
            .await
            .map_err(|err| anyhow!(err))?;

        let set_id = set.id;
        let height = head.height;
        self.db
            .retry_tx(move |tx| {
                store::record_challenge_request(tx, set_id, msg_hash, height, init_prove_at)
            })
            .await?;

        info!(set = set.id, prove_at = init_prove_at, msg = %msg_hash, "initial proving period requested");
        Ok(TaskResult::Done(None))
    }
}

#[async_trait::async_trait]
impl ChainHandler for InitProvingPeriodTask {
    fn name(&self) -> &'static str {
        "pdp-init-proving-period"
    }

    async fn on_head_change(
        &self,
        _revert: Option<&TipSet>,
        apply: Option<&TipSet>,
    ) -> anyhow::Result<()> {
        if apply.is_none() {
            return Ok(());
        }
        let Some(adder) = self.adder.get() else {
            return Ok(());
        };
        for set_id in store::proof_sets_needing_init(&self.db).await? {
            let enqueued = adder
                .add(move |task_id, tx| store::claim_challenge_task(tx, set_id, task_id))
                .await?;
            if let Some(task) = enqueued {
                info!(set = set_id, task, "queued initial proving period");
            } else {
                debug!(set = set_id, "init already scheduled, skipping");
            }
        }
        Ok(())
    }
}
