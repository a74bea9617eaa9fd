//! The three cooperating proving tasks. Producers watch chain applies
//! and translate database predicates into task insertions; the tasks
//! pack and send the on-chain requests.

mod init;
mod next;
mod prove;

pub use init::InitProvingPeriodTask;
pub use next::NextProvingPeriodTask;
pub use prove::ProveTask;

use piri_lib::ChainEpoch;

/// Reschedule a proving epoch whose challenge window has slipped behind
/// `min_required`.
///
/// Windows sit on the proving-period grid with the challenge window at
/// the front of each period. The result is `min_required` clamped into
/// the earliest window whose end satisfies it, so it always lands on a
/// window the chain will accept (window end >= min_required). A value
/// already past `min_required` is left untouched, which makes the
/// adjustment idempotent. Degenerate geometry falls back to
/// `max(next, min_required)`.
pub fn adjust_next_prove_at(
    next: ChainEpoch,
    min_required: ChainEpoch,
    proving_period: u64,
    challenge_window: u64,
) -> ChainEpoch {
    if proving_period == 0 || challenge_window == 0 {
        return next.max(min_required);
    }
    if next >= min_required {
        return next;
    }
    let period = proving_period as ChainEpoch;
    let window = challenge_window as ChainEpoch;
    // Smallest window index k with k*period + window >= min_required.
    let k = (min_required - window + period - 1).div_euclid(period).max(0);
    let window_start = k * period;
    let window_end = window_start + window;
    min_required.clamp(window_start, window_end)
}
