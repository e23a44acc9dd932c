//! Build-progress estimator.
//!
//! Turns raw mutation counters from the local stats surface into a
//! remaining-build-time estimate that gates the `InProgress -> Ready`
//! transition.

use std::time::Duration;

/// Raw counters read from the local `/stats` surface for one instance:
/// pending and queued mutations, and mutations processed so far.
#[derive(Debug, Clone, Copy, Default)]
pub struct MutationCounters {
    pub docs_pending: u64,
    pub docs_queued: u64,
    pub docs_processed: u64,
}

impl MutationCounters {
    fn outstanding(self) -> u64 {
        self.docs_pending + self.docs_queued
    }
}

/// Estimates remaining build time from a window of two counter samples:
/// `processing_rate = (processed_now - processed_before) / elapsed`, then
/// `remaining = outstanding / processing_rate`.
///
/// Returns `None` when there isn't enough signal yet (no elapsed time, or
/// zero observed throughput with outstanding work still pending — an
/// indexer that hasn't started processing should not be reported as
/// "instant").
pub fn estimate_remaining_build_time(
    before: MutationCounters,
    now: MutationCounters,
    elapsed: Duration,
) -> Option<Duration> {
    let outstanding = now.outstanding();
    if outstanding == 0 {
        return Some(Duration::ZERO);
    }
    if elapsed.is_zero() {
        return None;
    }
    let processed_delta = now.docs_processed.saturating_sub(before.docs_processed);
    if processed_delta == 0 {
        return None;
    }
    let rate = processed_delta as f64 / elapsed.as_secs_f64();
    if rate <= 0.0 {
        return None;
    }
    let remaining_secs = outstanding as f64 / rate;
    Some(Duration::from_secs_f64(remaining_secs))
}

/// Whether a token is ready to hand off to the destination: the index
/// must be `Active` and its remaining build time must be under the
/// configured ceiling.
pub fn is_ready_for_handoff(
    indexer_state_active: bool,
    remaining: Option<Duration>,
    max_remaining: Duration,
) -> bool {
    indexer_state_active && remaining.is_some_and(|r| r < max_remaining)
}
