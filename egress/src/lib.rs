//! Retrieval-egress journaling: successful retrieval receipts are
//! appended to a rotating CAR file whose rotated batches are content
//! addressed, tracked against a remote service, and removed locally once
//! the remote has consolidated them.

mod consolidate;
mod journal;
mod queue;
mod rotate;
mod tracker;

pub use consolidate::ConsolidationCleaner;
pub use journal::{EgressJournal, JournalError, JournalStat, CAR_CODEC, WIP_FILE_NAME};
pub use queue::{JobQueue, TrackJob};
pub use rotate::{PeriodicRotator, RotateFunc};
pub use tracker::{EgressTracker, ServiceReceipt};

/// Rotation threshold for the work-in-progress batch.
pub const DEFAULT_BATCH_SIZE: u64 = 100 * 1024 * 1024;

/// Retries for one tracking job before it is dropped.
pub const JOB_MAX_RETRIES: u32 = 10;

/// Wall-clock limit for one tracking attempt.
pub const JOB_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);
