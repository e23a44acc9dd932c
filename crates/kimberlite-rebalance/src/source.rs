//! Source role handler: on a node losing an index instance, wait for
//! quiescence, drop the instance, advance the token.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::config::RebalanceConfig;
use crate::context::RebalanceContext;
use crate::rest::{classify_error, ErrorClass, IndexerRestClient, StatsMap};
use crate::retry::retry_write;
use crate::token::{InstanceId, TokenState, TransferToken};

/// Poll interval for the quiesce/drop loop.
const DROP_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Consecutive polls with no stats for this instance before falling back to
/// probing local metadata for whether the instance is simply already gone.
const MISSING_STATS_TOLERANCE: u32 = 10;

fn partition_stat_key(inst_id: InstanceId, partition: u32, suffix: &str) -> String {
    format!("{inst_id}:{partition}:{suffix}")
}

fn read_u64_stat(stats: &StatsMap, key: &str) -> Option<u64> {
    stats.get(key).and_then(|v| v.as_u64())
}

/// Sums `num_requests - num_completed_requests` across every partition of
/// this instance. Returns `None` when none of the partitions have any stat
/// present at all (the "stats missing" case the poll loop tolerates up to
/// [`MISSING_STATS_TOLERANCE`] times); `Some(0)` means every partition that
/// did report is already idle.
fn read_pending_requests(stats: &StatsMap, inst_id: InstanceId, partitions: &[u32]) -> Option<u64> {
    let mut any_present = false;
    let mut total = 0u64;
    for &partition in partitions {
        let requests = read_u64_stat(stats, &partition_stat_key(inst_id, partition, "num_requests"));
        let completed = read_u64_stat(stats, &partition_stat_key(inst_id, partition, "num_completed_requests"));
        if requests.is_some() || completed.is_some() {
            any_present = true;
        }
        total = total.saturating_add(requests.unwrap_or(0).saturating_sub(completed.unwrap_or(0)));
    }
    if any_present {
        Some(total)
    } else {
        None
    }
}

/// Best-effort check of whether an instance still shows up in local index
/// metadata. Used once the stats surface has stopped reporting on an
/// instance for too long to tell whether it was already dropped out from
/// under us.
fn instance_appears_in_metadata(metadata_json: &serde_json::Value, inst_id: InstanceId) -> bool {
    metadata_json.to_string().contains(&inst_id.to_string())
}

enum DropOutcome {
    Commit,
    Error(String),
    Cancelled,
}

/// Drops index instances for tokens that have reached `Ready`, one at a
/// time via an internal queue so storage-engine drop pressure is
/// serialised per node.
pub struct SourceHandler {
    store: Arc<dyn crate::store::CoordinationStore>,
    rest: Arc<dyn IndexerRestClient>,
    rebal_dir: String,
    context: Arc<RebalanceContext>,
    config: RebalanceConfig,
    drop_tx: mpsc::Sender<TransferToken>,
    first_drop_done: Arc<AtomicBool>,
}

impl SourceHandler {
    pub fn new(
        store: Arc<dyn crate::store::CoordinationStore>,
        rest: Arc<dyn IndexerRestClient>,
        rebal_dir: impl Into<String>,
        context: Arc<RebalanceContext>,
        config: RebalanceConfig,
    ) -> (Arc<Self>, mpsc::Receiver<TransferToken>) {
        let capacity = config.transfer_batch_size.max(1);
        let (drop_tx, drop_rx) = mpsc::channel(capacity);
        let handler = Arc::new(Self {
            store,
            rest,
            rebal_dir: rebal_dir.into(),
            context,
            config,
            drop_tx,
            first_drop_done: Arc::new(AtomicBool::new(false)),
        });
        (handler, drop_rx)
    }

    /// Called when a token transitions to `Ready`. Enqueues it for the
    /// drop worker; silently drops the enqueue if the worker side has
    /// already shut down (the rebalance is tearing down).
    pub async fn enqueue_ready(&self, token: TransferToken) {
        if self.drop_tx.send(token).await.is_err() {
            warn!("drop queue is closed, ignoring enqueue during shutdown");
        }
    }

    /// Spawns the single drop-worker task that drains the queue.
    pub fn spawn_worker(self: &Arc<Self>, mut drop_rx: mpsc::Receiver<TransferToken>) -> JoinHandle<()> {
        let handler = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = handler.context.cancel.cancelled() => return,
                    maybe_token = drop_rx.recv() => {
                        match maybe_token {
                            None => return,
                            Some(token) => handler.process_one(token).await,
                        }
                    }
                }
            }
        })
    }

    async fn process_one(&self, mut token: TransferToken) {
        if !self.wait_for_pending_build_gate().await {
            return;
        }

        let is_first_drop = !self.first_drop_done.swap(true, Ordering::SeqCst);
        if is_first_drop {
            tokio::select! {
                biased;
                _ = self.context.cancel.cancelled() => return,
                _ = tokio::time::sleep(self.config.drop_index_wait_time()) => {}
            }
        }

        match self.drop_index_when_idle(&token).await {
            DropOutcome::Cancelled => {}
            DropOutcome::Commit => self.advance(&mut token, TokenState::Commit).await,
            DropOutcome::Error(message) => self.advance_to_error(&mut token, message).await,
        }
    }

    /// Blocks (respecting cancellation) until every destination build in
    /// the current batch has completed. Returns `false` if cancelled
    /// first.
    async fn wait_for_pending_build_gate(&self) -> bool {
        loop {
            if self.context.cancel.is_cancelled() || self.context.done.is_cancelled() {
                return false;
            }
            if self.context.pending_build_count() <= 0 {
                return true;
            }
            tokio::select! {
                biased;
                _ = self.context.cancel.cancelled() => return false,
                _ = tokio::time::sleep(DROP_POLL_INTERVAL) => {}
            }
        }
    }

    async fn drop_index_when_idle(&self, token: &TransferToken) -> DropOutcome {
        let mut missing_stats_polls = 0u32;
        loop {
            if self.context.cancel.is_cancelled() || self.context.done.is_cancelled() {
                return DropOutcome::Cancelled;
            }

            let stats = match self.rest.stats(true).await {
                Ok(stats) => Some(stats),
                Err(e) => {
                    warn!(token_id = %token.token_id, error = %e, "stats poll failed during drop quiesce wait");
                    None
                }
            };

            let pending = stats
                .as_ref()
                .and_then(|s| read_pending_requests(s, token.index_inst.inst_id, &token.index_inst.partitions));

            match pending {
                Some(0) => break,
                Some(_) => missing_stats_polls = 0,
                None => {
                    missing_stats_polls += 1;
                    if missing_stats_polls > MISSING_STATS_TOLERANCE {
                        if self.probe_instance_already_gone(token).await {
                            return DropOutcome::Commit;
                        }
                        missing_stats_polls = 0;
                    }
                }
            }

            tokio::select! {
                biased;
                _ = self.context.cancel.cancelled() => return DropOutcome::Cancelled,
                _ = tokio::time::sleep(DROP_POLL_INTERVAL) => {}
            }
        }

        match self.rest.drop_index(&token.index_inst).await {
            Ok(resp) if resp.is_success() => DropOutcome::Commit,
            Ok(resp) => match classify_error(&resp.error) {
                ErrorClass::MissingKeyspace | ErrorClass::IndexNotFound => DropOutcome::Commit,
                ErrorClass::Other => DropOutcome::Error(resp.error),
            },
            Err(e) => DropOutcome::Error(e.to_string()),
        }
    }

    async fn probe_instance_already_gone(&self, token: &TransferToken) -> bool {
        match self.rest.local_index_metadata().await {
            Ok(metadata) => !instance_appears_in_metadata(&metadata.index_definitions, token.index_inst.inst_id),
            Err(e) => {
                warn!(token_id = %token.token_id, error = %e, "local metadata probe failed, continuing to poll stats");
                false
            }
        }
    }

    async fn advance(&self, token: &mut TransferToken, state: TokenState) {
        token.state = state;
        self.persist(token).await;
    }

    async fn advance_to_error(&self, token: &mut TransferToken, message: String) {
        token.mark_error(message);
        self.persist(token).await;
    }

    async fn persist(&self, token: &TransferToken) {
        let key = format!("{}/{}", self.rebal_dir, token.store_key());
        let value = match serde_json::to_string(token) {
            Ok(v) => v,
            Err(e) => {
                warn!(token_id = %token.token_id, error = %e, "failed to encode token for drop-path write");
                return;
            }
        };
        let store = self.store.as_ref();
        let result = retry_write("source drop state transition", || {
            let key = key.clone();
            let value = value.clone();
            async move { store.put(&key, &value).await }
        })
        .await;
        if let Err(e) = result {
            warn!(token_id = %token.token_id, error = %e, "exhausted retries writing source-driven state, node should restart");
        }
    }
}
