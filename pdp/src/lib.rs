//! Provable Data Possession: the on-chain proving pipeline, the
//! transaction watcher that reconciles submitted messages with receipts,
//! and the chain-fed watchers that advance root-add / delete / provider
//! registration intents.

pub mod commp;
pub mod contract;
pub mod eth;
pub mod pieces;
pub mod proving;
pub mod sender;
pub mod service;
pub mod store;
pub mod verifier;
pub mod watch;
pub mod watcher;

/// Blocks beyond the head required before a transaction counts as final.
pub const MIN_CONFIDENCE: u64 = 2;

/// Challenges proven per proving period.
pub const NUM_CHALLENGES: u64 = 5;

/// Bounded retries for one receipt/transaction API call.
pub const DEFAULT_MAX_API_RETRIES: u32 = 10;

/// Concurrent receipt checks in the transaction watcher.
pub const DEFAULT_MAX_CONCURRENT_CHECKS: usize = 10;

/// Pending rows one watcher pass will look at.
pub const WATCHER_BATCH_LIMIT: u32 = 10_000;

/// Proof sets considered for proving per chain apply.
pub const PROVE_CANDIDATES_PER_TICK: u32 = 2;

/// Page size for the `getActivePieces` receipt fallback.
pub const ACTIVE_PIECES_PAGE: u64 = 500;

/// Proof-fee headroom multiplier over the verifier's estimate.
pub const PROOF_FEE_HEADROOM: u64 = 3;
