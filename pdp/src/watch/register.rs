//! Completes provider-registration intents from confirmed receipts.

use piri_chainsched::{ChainHandler, TipSet};
use piri_db::Db;
use tracing::{info, warn};

use crate::contract::find_provider_registered;
use crate::store;
use crate::watch::stored_receipt;

pub struct ProviderRegisterWatcher {
    db: Db,
}

impl ProviderRegisterWatcher {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    async fn process(&self, msg_hash: &str) -> anyhow::Result<()> {
        let Some(receipt) = stored_receipt(&self.db, msg_hash).await? else {
            anyhow::bail!("no stored receipt for registration message {msg_hash}");
        };
        let Some(provider_id) = find_provider_registered(&receipt.logs) else {
            anyhow::bail!("registration receipt {msg_hash} carries no ProviderRegistered event");
        };
        store::finish_registration(&self.db, msg_hash, provider_id).await?;
        info!(provider = provider_id, msg = msg_hash, "provider registered");
        Ok(())
    }
}

#[async_trait::async_trait]
impl ChainHandler for ProviderRegisterWatcher {
    fn name(&self) -> &'static str {
        "pdp-provider-register"
    }

    async fn on_head_change(
        &self,
        _revert: Option<&TipSet>,
        apply: Option<&TipSet>,
    ) -> anyhow::Result<()> {
        if apply.is_none() {
            return Ok(());
        }
        for msg_hash in store::pending_registrations(&self.db).await? {
            if let Err(err) = self.process(&msg_hash).await {
                warn!(msg = %msg_hash, %err, "registration unresolved");
            }
        }
        Ok(())
    }
}
