//! Progress reporting.

use std::collections::HashMap;
use std::time::Duration;

use crate::context::CancelToken;
use crate::token::{InstanceId, TokenState, TransferToken};

/// How often the master samples progress.
pub const SAMPLE_INTERVAL: Duration = Duration::from_secs(5);

/// Per-instance build progress, as read from `GET /getIndexStatus`'s
/// `Progress` field, keyed by instance id.
pub type BuildProgressByInstance = HashMap<InstanceId, f64>;

/// Converts one token's state into a 0..=100 percentage.
///
/// `InProgress` looks the percentage up from the cluster-wide status
/// response by instance id, falling back to `realInstId` for partitioned
/// indexes whose merge has already happened server-side.
fn token_percentage(token: &TransferToken, build_progress: &BuildProgressByInstance) -> f64 {
    match token.state {
        TokenState::Ready | TokenState::Merge | TokenState::Commit | TokenState::Deleted => 100.0,
        TokenState::InProgress => build_progress
            .get(&token.index_inst.inst_id)
            .or_else(|| build_progress.get(&token.index_inst.real_inst_id))
            .copied()
            .unwrap_or(0.0),
        _ => 0.0,
    }
}

/// Computes overall rebalance progress in `0.0..=1.0` from the full token
/// set and the latest cluster-wide build-progress snapshot.
///
/// An empty token set reports 0.1 (there's no way to distinguish
/// "not started" from "average of zero tokens" otherwise, and the clamp
/// below already treats "no visible progress" as 0.1).
pub fn compute_progress(tokens: &[TransferToken], build_progress: &BuildProgressByInstance) -> f64 {
    if tokens.is_empty() {
        return 0.1;
    }
    let sum: f64 = tokens.iter().map(|t| token_percentage(t, build_progress)).sum();
    let average = sum / tokens.len() as f64;
    clamp_progress(average / 100.0)
}

/// Applies the clamp rules: NaN -> 0.1, below 0.1 -> 0.1, exactly
/// 1.0 -> 0.99 (the true 1.0 is only ever emitted by the master on actual
/// completion, not by this sampler).
pub fn clamp_progress(value: f64) -> f64 {
    if value.is_nan() {
        return 0.1;
    }
    if value < 0.1 {
        return 0.1;
    }
    if value >= 1.0 {
        return 0.99;
    }
    value
}

/// Caller-supplied sink for progress updates.
pub type ProgressCallback = Box<dyn Fn(f64) + Send + Sync>;

/// Runs the periodic sampler until cancelled.
///
/// `sample` is expected to fetch the current token set and cluster-wide
/// build-progress snapshot and compute the value via
/// [`compute_progress`]; it is injected so tests can substitute a fixed
/// sequence of samples instead of driving a real indexer.
pub async fn run_progress_loop<F, Fut>(cancel: CancelToken, on_progress: ProgressCallback, mut sample: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = f64>,
{
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(SAMPLE_INTERVAL) => {
                let value = sample().await;
                on_progress(value);
            }
        }
    }
}
