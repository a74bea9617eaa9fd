//! Reconciles pending `message_waits_eth` rows with on-chain receipts.
//! Driven by chain applies; receipt checks fan out under a bounded
//! semaphore and results funnel through one updater so row writes are
//! serialized.

use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use alloy_primitives::B256;
use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use piri_chainsched::{ChainHandler, TipSet};
use piri_db::{Db, DbResult};
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::eth::EthClient;
use crate::store::{self, Confirmation};
use crate::{
    DEFAULT_MAX_API_RETRIES, DEFAULT_MAX_CONCURRENT_CHECKS, MIN_CONFIDENCE, WATCHER_BATCH_LIMIT,
};

/// Cheap to clone; all clones share the best-block slot, the check
/// semaphore, the updater channel, and the in-flight tracker.
#[derive(Clone)]
pub struct MessageWatcher {
    db: Db,
    client: Arc<dyn EthClient>,
    machine_id: String,
    best_block: Arc<AtomicU64>,
    semaphore: Arc<Semaphore>,
    max_api_retries: u32,
    update_tx: mpsc::Sender<Confirmation>,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl MessageWatcher {
    pub fn new(db: Db, client: Arc<dyn EthClient>, machine_id: String) -> Self {
        let (update_tx, update_rx) = mpsc::channel(256);
        let watcher = Self {
            db: db.clone(),
            client,
            machine_id,
            best_block: Arc::new(AtomicU64::new(0)),
            semaphore: Arc::new(Semaphore::new(DEFAULT_MAX_CONCURRENT_CHECKS)),
            max_api_retries: DEFAULT_MAX_API_RETRIES,
            update_tx,
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
        };
        watcher
            .tracker
            .spawn(updater(db, update_rx, watcher.cancel.clone()));
        watcher
    }

    /// Adopt waits left claimed by previous watcher instances.
    pub async fn start(&self) -> DbResult<()> {
        let released = store::release_stale_waiters(&self.db, &self.machine_id).await?;
        if released > 0 {
            info!(released, "released stale message waiters");
        }
        Ok(())
    }

    pub fn best_block(&self) -> u64 {
        self.best_block.load(Ordering::Acquire)
    }

    /// Signal shutdown and wait for in-flight checks and the updater.
    pub async fn stop(&self, timeout: Duration) -> anyhow::Result<()> {
        self.cancel.cancel();
        self.tracker.close();
        tokio::time::timeout(timeout, self.tracker.wait())
            .await
            .map_err(|_| anyhow::anyhow!("message watcher stop timed out"))?;
        Ok(())
    }

    /// One reconciliation pass over every claimed pending row.
    async fn check_pending(&self) -> DbResult<()> {
        let claimed = store::claim_pending_waits(&self.db, &self.machine_id).await?;
        if claimed > 0 {
            debug!(claimed, "claimed pending message waits");
        }
        let hashes =
            store::pending_claimed(&self.db, &self.machine_id, WATCHER_BATCH_LIMIT).await?;
        for hash in hashes {
            let permit = match self.semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            let watcher = self.clone();
            self.tracker.spawn(async move {
                let _permit = permit;
                match watcher.check_one(&hash).await {
                    Ok(Some(confirmation)) => {
                        let _ = watcher.update_tx.send(confirmation).await;
                    }
                    Ok(None) => {}
                    Err(err) => warn!(%hash, %err, "receipt check failed"),
                }
            });
        }
        Ok(())
    }

    /// Check one hash. `Ok(None)` = still pending (not found, or not
    /// deep enough); errors already exhausted their API retries.
    async fn check_one(&self, hash_hex: &str) -> anyhow::Result<Option<Confirmation>> {
        let hash = B256::from_str(hash_hex)?;

        let receipt = self
            .retry_api(|| self.client.transaction_receipt(hash))
            .await?;
        let Some(receipt) = receipt else {
            // Not known to the node; never retried within a pass.
            return Ok(None);
        };

        let best = self.best_block();
        if best < receipt.block_number + MIN_CONFIDENCE {
            debug!(%hash, block = receipt.block_number, best, "below confidence, skipping");
            return Ok(None);
        }

        let tx = self
            .retry_api(|| self.client.transaction_by_hash(hash))
            .await?
            .ok_or_else(|| anyhow::anyhow!("transaction {hash} has a receipt but no body"))?;

        Ok(Some(Confirmation {
            signed_tx_hash: hash_hex.to_string(),
            confirmed_tx_hash: store::hash_hex(receipt.transaction_hash),
            block_number: receipt.block_number,
            success: receipt.status,
            receipt_json: serde_json::to_vec(&receipt)?,
            tx_json: serde_json::to_vec(&tx)?,
        }))
    }

    async fn retry_api<T, F, Fut>(&self, mut call: F) -> anyhow::Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = anyhow::Result<T>>,
    {
        let mut backoff = api_backoff();
        let mut attempt = 0;
        loop {
            attempt += 1;
            match call().await {
                Ok(value) => return Ok(value),
                Err(err) if attempt < self.max_api_retries => {
                    let wait = backoff.next_backoff().unwrap_or(backoff.max_interval);
                    debug!(attempt, %err, ?wait, "chain API call failed, retrying");
                    tokio::time::sleep(wait).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

fn api_backoff() -> ExponentialBackoff {
    ExponentialBackoff {
        current_interval: Duration::from_millis(100),
        initial_interval: Duration::from_millis(100),
        multiplier: 2.0,
        max_interval: Duration::from_secs(5),
        max_elapsed_time: None,
        ..Default::default()
    }
}

/// The single writer for confirmed rows.
async fn updater(db: Db, mut rx: mpsc::Receiver<Confirmation>, cancel: CancellationToken) {
    loop {
        let confirmation = tokio::select! {
            _ = cancel.cancelled() => break,
            received = rx.recv() => match received {
                Some(confirmation) => confirmation,
                None => break,
            },
        };
        let hash = confirmation.signed_tx_hash.clone();
        let success = confirmation.success;
        match store::confirm_wait(&db, confirmation).await {
            Ok(()) => info!(%hash, success, "transaction confirmed"),
            Err(err) => error!(%hash, %err, "failed to record confirmation"),
        }
    }
}

#[async_trait::async_trait]
impl ChainHandler for MessageWatcher {
    fn name(&self) -> &'static str {
        "message-watcher"
    }

    async fn on_head_change(
        &self,
        _revert: Option<&TipSet>,
        apply: Option<&TipSet>,
    ) -> anyhow::Result<()> {
        let Some(apply) = apply else {
            return Ok(());
        };
        if apply.height >= 0 {
            self.best_block
                .store(apply.height as u64, Ordering::Release);
        }
        if self.cancel.is_cancelled() {
            return Ok(());
        }
        self.check_pending().await?;
        Ok(())
    }
}
