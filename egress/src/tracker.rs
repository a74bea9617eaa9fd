//! The remote tracker seam. Outbound `egress/track` and
//! `egress/consolidate` invocations live behind it; the core only
//! inspects the returned receipt for embedded failures.

use cid::Cid;
use serde::{Deserialize, Serialize};

/// Result of a remote invocation. A receipt may arrive without the call
/// failing outright while still carrying per-item errors.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceReceipt {
    pub errors: Vec<String>,
}

impl ServiceReceipt {
    pub fn ok(&self) -> bool {
        self.errors.is_empty()
    }
}

#[async_trait::async_trait]
pub trait EgressTracker: Send + Sync + 'static {
    /// Announce a rotated batch to the remote tracker.
    async fn track(&self, batch: &Cid) -> anyhow::Result<ServiceReceipt>;

    /// Ask the remote to consolidate a batch. A clean receipt means the
    /// local copy may be removed.
    async fn consolidate(&self, batch: &Cid) -> anyhow::Result<ServiceReceipt>;
}
