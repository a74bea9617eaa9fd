//! Consolidation cleanup: periodically offer every local batch to the
//! remote for consolidation and delete the local copy only when the
//! remote's receipt carries no errors.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::journal::EgressJournal;
use crate::tracker::EgressTracker;

pub struct ConsolidationCleaner {
    journal: Arc<EgressJournal>,
    tracker: Arc<dyn EgressTracker>,
    interval: Duration,
}

impl ConsolidationCleaner {
    pub fn new(
        journal: Arc<EgressJournal>,
        tracker: Arc<dyn EgressTracker>,
        interval: Duration,
    ) -> Self {
        Self {
            journal,
            tracker,
            interval,
        }
    }

    pub async fn run(&self, cancel: CancellationToken) {
        let start = tokio::time::Instant::now() + self.interval;
        let mut ticker = tokio::time::interval_at(start, self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if let Err(err) = self.sweep().await {
                warn!(%err, "consolidation sweep failed");
            }
        }
    }

    async fn sweep(&self) -> anyhow::Result<()> {
        for batch in self.journal.list().await? {
            match self.tracker.consolidate(&batch).await {
                Ok(receipt) if receipt.ok() => {
                    self.journal.remove(&batch).await?;
                    info!(batch = %batch, "batch consolidated remotely, removed locally");
                }
                Ok(receipt) => {
                    debug!(batch = %batch, errors = receipt.errors.len(),
                           "consolidation incomplete, keeping batch");
                }
                Err(err) => {
                    warn!(batch = %batch, %err, "consolidation request failed");
                }
            }
        }
        Ok(())
    }
}
