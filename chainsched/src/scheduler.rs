use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{ChainClient, ChainHandler, HeadChange, HeadChangeKind, TipSet};

/// Wait between subscription attempts after a failure or a dropped
/// stream.
pub const RESUBSCRIBE_WAIT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("handlers cannot be added after run() has started")]
    AlreadyRunning,
}

/// Single long-running subscriber over the chain's head-change feed.
/// Every registered handler sees every notification, folded to the
/// latest revert and latest apply in the delivered batch.
pub struct ChainScheduler {
    client: Arc<dyn ChainClient>,
    epoch_duration: Duration,
    handlers: Mutex<Vec<Arc<dyn ChainHandler>>>,
    running: AtomicBool,
}

impl ChainScheduler {
    pub fn new(client: Arc<dyn ChainClient>, epoch_duration: Duration) -> Self {
        Self {
            client,
            epoch_duration,
            handlers: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
        }
    }

    /// Register a handler. Rejected once [`ChainScheduler::run`] has
    /// started.
    pub fn add_handler(&self, handler: Arc<dyn ChainHandler>) -> Result<(), SchedulerError> {
        if self.running.load(Ordering::SeqCst) {
            return Err(SchedulerError::AlreadyRunning);
        }
        self.handlers.lock().unwrap().push(handler);
        Ok(())
    }

    /// No notification for this long drops and reopens the subscription.
    fn silence_timeout(&self) -> Duration {
        self.epoch_duration * 3
    }

    /// Block until `cancel` fires, maintaining the subscription across
    /// failures and silent streams.
    pub async fn run(&self, cancel: CancellationToken) {
        self.running.store(true, Ordering::SeqCst);
        let handlers: Vec<Arc<dyn ChainHandler>> = self.handlers.lock().unwrap().clone();

        'subscribe: while !cancel.is_cancelled() {
            let mut rx = match self.client.chain_notify().await {
                Ok(rx) => rx,
                Err(err) => {
                    warn!(%err, "chain subscription failed");
                    if sleep_or_cancel(&cancel, RESUBSCRIBE_WAIT).await {
                        break;
                    }
                    continue;
                }
            };

            // The opening message must be the HCCurrent snapshot.
            let first = tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.silence_timeout()) => {
                    warn!("no initial head change, resubscribing");
                    continue;
                }
                batch = rx.recv() => batch,
            };
            match first.as_deref() {
                Some([change]) if change.kind == HeadChangeKind::Current => {
                    debug!(height = change.tipset.height, "chain subscription current");
                    self.fan_out(&handlers, None, Some(change.tipset.clone()));
                }
                other => {
                    warn!(?other, "unexpected first head change, resubscribing");
                    if sleep_or_cancel(&cancel, RESUBSCRIBE_WAIT).await {
                        break;
                    }
                    continue;
                }
            }

            loop {
                let batch = tokio::select! {
                    _ = cancel.cancelled() => break 'subscribe,
                    _ = tokio::time::sleep(self.silence_timeout()) => {
                        warn!("head change stream silent, resubscribing");
                        continue 'subscribe;
                    }
                    batch = rx.recv() => batch,
                };
                let Some(changes) = batch else {
                    warn!("head change stream closed, resubscribing");
                    if sleep_or_cancel(&cancel, RESUBSCRIBE_WAIT).await {
                        break 'subscribe;
                    }
                    continue 'subscribe;
                };

                let mut revert = None;
                let mut apply = None;
                for change in changes {
                    match change.kind {
                        HeadChangeKind::Revert => revert = Some(change.tipset),
                        HeadChangeKind::Apply => apply = Some(change.tipset),
                        HeadChangeKind::Current => {
                            warn!(height = change.tipset.height, "stray HCCurrent mid-stream");
                        }
                    }
                }
                if revert.is_some() || apply.is_some() {
                    self.fan_out(&handlers, revert, apply);
                }
            }
        }
        debug!("chain scheduler stopped");
    }

    /// Deliver one notification to every handler. Each handler runs on
    /// its own task so a slow handler neither blocks the stream nor the
    /// other handlers; failures are logged and execution continues.
    fn fan_out(
        &self,
        handlers: &[Arc<dyn ChainHandler>],
        revert: Option<TipSet>,
        apply: Option<TipSet>,
    ) {
        for handler in handlers {
            let handler = handler.clone();
            let revert = revert.clone();
            let apply = apply.clone();
            tokio::spawn(async move {
                if let Err(err) = handler
                    .on_head_change(revert.as_ref(), apply.as_ref())
                    .await
                {
                    warn!(handler = handler.name(), %err, "head change handler failed");
                }
            });
        }
    }
}

/// Sleep for `wait`, returning true if cancelled first.
async fn sleep_or_cancel(cancel: &CancellationToken, wait: Duration) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => true,
        _ = tokio::time::sleep(wait) => false,
    }
}
