//! Time-based batch rotation: a small loop that forces a rotation on an
//! interval and hands each new batch cid to the wiring-supplied
//! callback (normally the tracking queue).

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use cid::Cid;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::journal::EgressJournal;

/// Invoked once per rotated batch; set once at wiring.
pub type RotateFunc =
    Arc<dyn Fn(Cid) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>> + Send + Sync>;

pub struct PeriodicRotator {
    journal: Arc<EgressJournal>,
    interval: Duration,
    on_rotate: RotateFunc,
}

impl PeriodicRotator {
    pub fn new(journal: Arc<EgressJournal>, interval: Duration, on_rotate: RotateFunc) -> Self {
        Self {
            journal,
            interval,
            on_rotate,
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
            match self.journal.force_rotate().await {
                Ok(Some(batch)) => {
                    if let Ok(stat) = self.journal.stat().await {
                        info!(batch = %batch, batches = stat.batches, "periodic rotation");
                    }
                    if let Err(err) = (self.on_rotate)(batch).await {
                        warn!(batch = %batch, %err, "rotation callback failed");
                    }
                }
                Ok(None) => {}
                Err(err) => warn!(%err, "periodic rotation failed"),
            }
        }
    }
}
