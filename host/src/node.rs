//! Node assembly: one place where the engine, scheduler, watchers, and
//! egress loops are constructed, started, and stopped in order.

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use piri_chainsched::{ChainClient, ChainScheduler};
use piri_db::Db;
use piri_egress::{
    ConsolidationCleaner, EgressJournal, EgressTracker, JobQueue, PeriodicRotator,
};
use piri_pdp::eth::EthClient;
use piri_pdp::pieces::PieceReader;
use piri_pdp::proving::{InitProvingPeriodTask, NextProvingPeriodTask, ProveTask};
use piri_pdp::sender::Sender;
use piri_pdp::service::Service;
use piri_pdp::verifier::Verifier;
use piri_pdp::watch::{DeleteWatcher, ProviderRegisterWatcher, RootAddWatcher};
use piri_pdp::watcher::MessageWatcher;
use piri_tasks::{TaskEngine, TaskHandler};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::info;

use crate::{metrics, Cli};

/// The deployment-specific seams: chain node, contracts, signer, blob
/// storage, and the remote egress tracker.
#[derive(Clone)]
pub struct ExternalServices {
    pub chain: Arc<dyn ChainClient>,
    pub eth: Arc<dyn EthClient>,
    pub verifier: Arc<dyn Verifier>,
    pub service: Arc<dyn Service>,
    pub sender: Arc<dyn Sender>,
    pub pieces: Arc<dyn PieceReader>,
    pub tracker: Arc<dyn EgressTracker>,
}

pub struct Node {
    db: Db,
    engine: TaskEngine,
    watcher: MessageWatcher,
    journal: Arc<EgressJournal>,
    queue: JobQueue,
    cancel: CancellationToken,
    background: TaskTracker,
}

impl Node {
    /// Open the store, install every schema, wire all components, and
    /// launch the background loops.
    pub async fn start(cfg: &Cli, services: ExternalServices) -> anyhow::Result<Self> {
        let db = Db::open(&cfg.db_path)?;
        piri_pdp::store::migrate(&db).await?;

        let owner = cfg.owner_address()?;
        let cancel = CancellationToken::new();
        let background = TaskTracker::new();

        // Proving tasks double as their own chain-fed producers.
        let init = InitProvingPeriodTask::new(
            db.clone(),
            services.chain.clone(),
            services.verifier.clone(),
            services.service.clone(),
            services.sender.clone(),
            owner,
        );
        let next = NextProvingPeriodTask::new(
            db.clone(),
            services.chain.clone(),
            services.verifier.clone(),
            services.service.clone(),
            services.sender.clone(),
            owner,
        );
        let prove = ProveTask::new(
            db.clone(),
            services.chain.clone(),
            services.verifier.clone(),
            services.sender.clone(),
            services.pieces.clone(),
            owner,
        );

        let handlers: Vec<Arc<dyn TaskHandler>> =
            vec![init.clone(), next.clone(), prove.clone()];
        let engine = TaskEngine::new(db.clone(), handlers);
        engine.start().await?;

        let watcher = MessageWatcher::new(
            db.clone(),
            services.eth.clone(),
            engine.session_id().to_string(),
        );
        watcher.start().await?;

        let scheduler = Arc::new(ChainScheduler::new(
            services.chain.clone(),
            Duration::from_secs(cfg.epoch_duration_secs),
        ));
        scheduler.add_handler(Arc::new(watcher.clone()))?;
        scheduler.add_handler(init)?;
        scheduler.add_handler(next)?;
        scheduler.add_handler(prove)?;
        scheduler.add_handler(Arc::new(RootAddWatcher::new(
            db.clone(),
            services.verifier.clone(),
        )))?;
        scheduler.add_handler(Arc::new(DeleteWatcher::new(db.clone())))?;
        scheduler.add_handler(Arc::new(ProviderRegisterWatcher::new(db.clone())))?;
        {
            let scheduler = scheduler.clone();
            let cancel = cancel.child_token();
            background.spawn(async move { scheduler.run(cancel).await });
        }

        let journal = Arc::new(EgressJournal::open(&cfg.egress_dir, cfg.egress_batch_size)?);
        let queue = JobQueue::new(db.clone());
        queue.migrate().await?;
        queue.run(services.tracker.clone());

        let rotator = PeriodicRotator::new(
            journal.clone(),
            Duration::from_secs(cfg.rotate_interval_secs),
            rotate_into_queue(queue.clone()),
        );
        {
            let cancel = cancel.child_token();
            background.spawn(async move { rotator.run(cancel).await });
        }

        let cleaner = ConsolidationCleaner::new(
            journal.clone(),
            services.tracker.clone(),
            Duration::from_secs(cfg.consolidate_interval_secs),
        );
        {
            let cancel = cancel.child_token();
            background.spawn(async move { cleaner.run(cancel).await });
        }

        metrics::NODE_UP.set(1);
        info!(session = %engine.session_id(), "piri node started");
        Ok(Self {
            db,
            engine,
            watcher,
            journal,
            queue,
            cancel,
            background,
        })
    }

    pub fn db(&self) -> &Db {
        &self.db
    }

    /// The retrieval path appends receipt archives here.
    pub fn journal(&self) -> &Arc<EgressJournal> {
        &self.journal
    }

    pub fn engine(&self) -> &TaskEngine {
        &self.engine
    }

    /// Orderly shutdown: stop feeding work (scheduler and loops), then
    /// drain the watcher, engine, and queue, then seal the journal.
    pub async fn stop(&self, timeout: Duration) -> anyhow::Result<()> {
        self.cancel.cancel();
        self.background.close();
        let _ = tokio::time::timeout(timeout, self.background.wait()).await;

        self.watcher.stop(timeout).await?;
        self.engine.stop(timeout).await?;
        self.queue.stop(timeout).await?;
        self.journal.close().await?;
        metrics::NODE_UP.set(0);
        info!("piri node stopped");
        Ok(())
    }
}

/// The rotation callback: every rotated batch becomes a tracking job.
fn rotate_into_queue(queue: JobQueue) -> piri_egress::RotateFunc {
    Arc::new(move |batch| {
        let queue = queue.clone();
        Box::pin(async move {
            queue.enqueue(&batch).await?;
            metrics::observe_rotation();
            Ok(())
        }) as Pin<Box<dyn std::future::Future<Output = anyhow::Result<()>> + Send>>
    })
}
