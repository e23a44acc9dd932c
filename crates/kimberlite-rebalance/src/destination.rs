//! Destination role handler: on a node gaining an index instance, create
//! the shell index, issue a build, optionally merge proxy partitions into
//! a pre-existing real instance, and advance the token.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{error, warn};
use uuid::Uuid;

use crate::build_estimator::{estimate_remaining_build_time, is_ready_for_handoff, MutationCounters};
use crate::config::RebalanceConfig;
use crate::context::RebalanceContext;
use crate::rest::{classify_error, BuildErrorPayload, ErrorClass, IndexDefnClone, IndexerRestClient, StatsMap};
use crate::retry::retry_write;
use crate::store::CoordinationStore;
use crate::token::{InstanceId, TokenState, TransferToken};

const BUILD_POLL_INTERVAL: Duration = Duration::from_secs(3);

fn read_u64_stat(stats: &StatsMap, key: &str) -> Option<u64> {
    stats.get(key).and_then(|v| v.as_u64())
}

fn read_mutation_counters(stats: &StatsMap, inst_id: InstanceId) -> MutationCounters {
    MutationCounters {
        docs_pending: read_u64_stat(stats, &format!("{inst_id}:num_docs_pending")).unwrap_or(0),
        docs_queued: read_u64_stat(stats, &format!("{inst_id}:num_docs_queued")).unwrap_or(0),
        docs_processed: read_u64_stat(stats, &format!("{inst_id}:num_docs_processed")).unwrap_or(0),
    }
}

/// Seam for the two calls the destination makes into the local index
/// storage engine directly (not over the loopback REST surface): flipping
/// an instance's rebalance-state flag, and merging a proxy partition into
/// its pre-existing real instance. Both are explicitly out of scope as an
/// external collaborator; this trait is the boundary.
#[async_trait]
pub trait LocalIndexStateSync: Send + Sync {
    async fn mark_rebalance_active(&self, inst_id: InstanceId) -> Result<(), String>;

    async fn merge_proxy_into_real(&self, proxy_inst: InstanceId, real_inst: InstanceId) -> Result<(), String>;
}

/// Always succeeds. Used in tests and wherever the storage engine
/// collaborator isn't wired up yet.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullIndexStateSync;

#[async_trait]
impl LocalIndexStateSync for NullIndexStateSync {
    async fn mark_rebalance_active(&self, _inst_id: InstanceId) -> Result<(), String> {
        Ok(())
    }

    async fn merge_proxy_into_real(&self, _proxy_inst: InstanceId, _real_inst: InstanceId) -> Result<(), String> {
        Ok(())
    }
}

pub struct DestinationHandler {
    store: Arc<dyn CoordinationStore>,
    rest: Arc<dyn IndexerRestClient>,
    index_state: Arc<dyn LocalIndexStateSync>,
    rebal_dir: String,
    context: Arc<RebalanceContext>,
    config: RebalanceConfig,
    build_progress: AsyncMutex<HashMap<Uuid, (MutationCounters, Instant)>>,
}

impl DestinationHandler {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        rest: Arc<dyn IndexerRestClient>,
        index_state: Arc<dyn LocalIndexStateSync>,
        rebal_dir: impl Into<String>,
        context: Arc<RebalanceContext>,
        config: RebalanceConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            rest,
            index_state,
            rebal_dir: rebal_dir.into(),
            context,
            config,
            build_progress: AsyncMutex::new(HashMap::new()),
        })
    }

    /// `Created` transition: materialise the shell index on this node.
    pub async fn handle_created(&self, mut token: TransferToken) {
        let clone = IndexDefnClone {
            defn_id: token.index_inst.defn_id,
            inst_id: token.index_inst.inst_id,
            real_inst_id: token.index_inst.real_inst_id,
            deferred: true,
            unrestricted: true,
        };

        match self.rest.create_index_rebalance(&clone).await {
            Ok(resp) if resp.is_success() => {
                token.state = TokenState::Accepted;
                self.insert_accepted(token.clone()).await;
                self.persist(&token).await;
            }
            Ok(resp) => match classify_error(&resp.error) {
                ErrorClass::MissingKeyspace | ErrorClass::IndexNotFound => {
                    token.state = TokenState::Commit;
                    self.persist(&token).await;
                }
                ErrorClass::Other => {
                    token.mark_error(resp.error);
                    self.persist(&token).await;
                }
            },
            Err(e) => {
                token.mark_error(e.to_string());
                self.persist(&token).await;
            }
        }
    }

    /// `Initiate` transition.
    pub async fn handle_initiate(&self, mut token: TransferToken) {
        if self.instance_ready_with_no_data(&token).await {
            self.context.increment_pending_build();
            self.token_merge_or_ready(&mut token).await;
            return;
        }

        token.state = TokenState::InProgress;
        self.context.increment_pending_build();
        self.insert_accepted(token.clone()).await;
        self.persist(&token).await;

        if self.every_accepted_token_at_least_in_progress().await {
            self.build_accepted_indexes().await;
        }
    }

    async fn instance_ready_with_no_data(&self, token: &TransferToken) -> bool {
        match self.rest.index_status().await {
            Ok(entries) => entries
                .iter()
                .any(|e| e.inst_id == token.index_inst.inst_id && e.status.eq_ignore_ascii_case("ready")),
            Err(e) => {
                warn!(token_id = %token.token_id, error = %e, "index status check failed, assuming a build is needed");
                false
            }
        }
    }

    async fn every_accepted_token_at_least_in_progress(&self) -> bool {
        let maps = self.context.maps.read().await;
        maps.accepted_tokens.values().all(|t| t.state.state_code() >= TokenState::InProgress.state_code())
    }

    async fn build_accepted_indexes(&self) {
        let still_building: Vec<TransferToken> = {
            let maps = self.context.maps.read().await;
            maps.accepted_tokens
                .values()
                .filter(|t| t.state.state_code() < TokenState::Ready.state_code())
                .cloned()
                .collect()
        };
        if still_building.is_empty() {
            return;
        }

        let defn_ids: Vec<_> = still_building.iter().map(|t| t.index_inst.defn_id).collect();

        match self.rest.build_index_rebalance(&defn_ids).await {
            Ok(resp) if resp.is_success() => {
                self.wait_for_index_build(still_building).await;
            }
            Ok(resp) => {
                let remaining = self.apply_build_error(&resp.error, still_building).await;
                if !remaining.is_empty() {
                    self.wait_for_index_build(remaining).await;
                }
            }
            Err(e) => {
                for mut token in still_building {
                    token.mark_error(e.to_string());
                    self.persist(&token).await;
                    self.insert_accepted(token).await;
                }
            }
        }
    }

    /// Applies a batched build error to the still-building set. Returns
    /// the subset that survives (wasn't skipped forward or failed) and
    /// should keep being polled.
    async fn apply_build_error(&self, error_body: &str, still_building: Vec<TransferToken>) -> Vec<TransferToken> {
        match crate::rest::parse_build_error(error_body) {
            BuildErrorPayload::Fatal(message) => {
                for mut token in still_building {
                    token.mark_error(message.clone());
                    self.persist(&token).await;
                    self.insert_accepted(token).await;
                }
                Vec::new()
            }
            BuildErrorPayload::PerToken(per_token) => {
                let mut survivors = Vec::new();
                for mut token in still_building {
                    let key_by_inst = token.index_inst.inst_id.to_string();
                    let key_by_defn = token.index_inst.defn_id.to_string();
                    let sub_error = per_token.get(&key_by_inst).or_else(|| per_token.get(&key_by_defn));
                    match sub_error {
                        None => survivors.push(token),
                        Some(message) => match classify_error(message) {
                            ErrorClass::MissingKeyspace | ErrorClass::IndexNotFound => {
                                token.state = TokenState::Commit;
                                self.context.decrement_pending_build();
                                self.persist(&token).await;
                                self.insert_accepted(token).await;
                            }
                            ErrorClass::Other => {
                                token.mark_error(message.clone());
                                self.persist(&token).await;
                                self.insert_accepted(token).await;
                            }
                        },
                    }
                }
                survivors
            }
        }
    }

    async fn wait_for_index_build(&self, mut still_building: Vec<TransferToken>) {
        loop {
            if self.context.cancel.is_cancelled() || self.context.done.is_cancelled() {
                return;
            }
            if still_building.is_empty() {
                return;
            }

            let stats = match self.rest.stats(false).await {
                Ok(stats) => stats,
                Err(e) => {
                    warn!(error = %e, "stats poll failed during build wait, retrying next tick");
                    self.sleep_or_cancel().await;
                    continue;
                }
            };

            if stats.get("indexer_state").and_then(|v| v.as_str()) == Some("Paused") {
                for mut token in std::mem::take(&mut still_building) {
                    token.mark_error("indexer paused during build wait".to_string());
                    self.persist(&token).await;
                    self.insert_accepted(token).await;
                }
                return;
            }

            let mut next_round = Vec::new();
            for mut token in still_building {
                if self.instance_gone(&token).await {
                    token.state = TokenState::Commit;
                    self.persist(&token).await;
                    self.insert_accepted(token).await;
                    continue;
                }

                let counters = read_mutation_counters(&stats, token.index_inst.inst_id);
                let remaining = self.remaining_build_time(token.token_id, counters).await;
                let active = self.instance_is_active(&token).await;

                if is_ready_for_handoff(active, remaining, self.config.max_remaining_build_time()) {
                    self.token_merge_or_ready(&mut token).await;
                    if !token.state.is_terminal() && token.state != TokenState::Ready {
                        next_round.push(token);
                    }
                } else {
                    next_round.push(token);
                }
            }
            still_building = next_round;

            if !still_building.is_empty() {
                self.sleep_or_cancel().await;
            }
        }
    }

    async fn sleep_or_cancel(&self) {
        tokio::select! {
            biased;
            _ = self.context.cancel.cancelled() => {}
            _ = tokio::time::sleep(BUILD_POLL_INTERVAL) => {}
        }
    }

    async fn instance_gone(&self, token: &TransferToken) -> bool {
        match self.rest.index_status().await {
            Ok(entries) => !entries.iter().any(|e| e.inst_id == token.index_inst.inst_id),
            Err(_) => false,
        }
    }

    async fn instance_is_active(&self, token: &TransferToken) -> bool {
        match self.rest.index_status().await {
            Ok(entries) => entries
                .iter()
                .any(|e| e.inst_id == token.index_inst.inst_id && e.status.eq_ignore_ascii_case("active")),
            Err(_) => false,
        }
    }

    async fn remaining_build_time(&self, token_id: Uuid, now: MutationCounters) -> Option<Duration> {
        let mut progress = self.build_progress.lock().await;
        let now_instant = Instant::now();
        let result = match progress.get(&token_id) {
            Some((before, before_instant)) => {
                estimate_remaining_build_time(*before, now, now_instant.duration_since(*before_instant))
            }
            None => None,
        };
        progress.insert(token_id, (now, now_instant));
        result
    }

    /// Completes a move once the destination is caught up: either
    /// directly (no proxy) or via a proxy-to-real merge.
    async fn token_merge_or_ready(&self, token: &mut TransferToken) {
        if !token.index_inst.is_proxy() {
            if let Err(e) = self.index_state.mark_rebalance_active(token.index_inst.inst_id).await {
                token.mark_error(e);
                self.persist(token).await;
                self.insert_accepted(token.clone()).await;
                return;
            }
            token.state = if token.is_replica_repair() { TokenState::Commit } else { TokenState::Ready };
            self.context.decrement_pending_build();
            self.persist(token).await;
            self.insert_accepted(token.clone()).await;
            return;
        }

        token.state = TokenState::Merge;
        self.persist(token).await;
        self.insert_accepted(token.clone()).await;

        if self.context.cancel.is_cancelled() || self.context.done.is_cancelled() {
            return;
        }

        match self.index_state.merge_proxy_into_real(token.index_inst.inst_id, token.index_inst.real_inst_id).await {
            Ok(()) => {
                token.state = if token.is_replica_repair() { TokenState::Commit } else { TokenState::Ready };
                self.context.decrement_pending_build();
                self.persist(token).await;
                self.insert_accepted(token.clone()).await;
            }
            Err(message) => {
                error!(token_id = %token.token_id, %message, "proxy merge failed, indexer state may be inconsistent");
                token.state = TokenState::InProgress;
                self.persist(token).await;
                self.insert_accepted(token.clone()).await;
                self.context.mark_merge_inconsistent();
            }
        }
    }

    async fn insert_accepted(&self, token: TransferToken) {
        let mut maps = self.context.maps.write().await;
        maps.accepted_tokens.insert(token.token_id, token);
    }

    async fn persist(&self, token: &TransferToken) {
        let key = format!("{}/{}", self.rebal_dir, token.store_key());
        let value = match serde_json::to_string(token) {
            Ok(v) => v,
            Err(e) => {
                warn!(token_id = %token.token_id, error = %e, "failed to encode token for destination-path write");
                return;
            }
        };
        let store = self.store.as_ref();
        let result = retry_write("destination state transition", || {
            let key = key.clone();
            let value = value.clone();
            async move { store.put(&key, &value).await }
        })
        .await;
        if let Err(e) = result {
            warn!(token_id = %token.token_id, error = %e, "exhausted retries writing destination-driven state, node should restart");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rest::{IndexStatusEntry, LocalIndexMetadata, RestError, SimpleResponse};
    use crate::store::InMemoryCoordinationStore;
    use crate::token::{IndexDefnId, IndexInstance, NodeId, RebalanceId, TransferMode};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn created_token(defn: u64, inst: u64, real: u64) -> TransferToken {
        TransferToken {
            token_id: Uuid::new_v4(),
            rebal_id: RebalanceId::new(Uuid::nil()),
            master_id: NodeId::new(1),
            source_id: Some(NodeId::new(2)),
            dest_id: NodeId::new(3),
            index_inst: IndexInstance {
                defn_id: IndexDefnId::new(defn),
                inst_id: InstanceId::new(inst),
                replica_id: 0,
                partitions: vec![0],
                real_inst_id: InstanceId::new(real),
                transfer_mode: TransferMode::Move,
            },
            state: TokenState::Created,
            error: String::new(),
            build_ts: vec![],
        }
    }

    struct StubRest {
        create_response: SimpleResponse,
        build_response: Option<SimpleResponse>,
        index_status: Vec<IndexStatusEntry>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl IndexerRestClient for StubRest {
        async fn create_index_rebalance(&self, _defn: &IndexDefnClone) -> Result<SimpleResponse, RestError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.create_response.clone())
        }
        async fn build_index_rebalance(&self, _defn_ids: &[IndexDefnId]) -> Result<SimpleResponse, RestError> {
            Ok(self.build_response.clone().unwrap_or(SimpleResponse { code: "success".into(), error: String::new() }))
        }
        async fn drop_index(&self, _inst: &IndexInstance) -> Result<SimpleResponse, RestError> {
            unimplemented!()
        }
        async fn stats(&self, _partition: bool) -> Result<StatsMap, RestError> {
            Ok(StatsMap::new())
        }
        async fn local_index_metadata(&self) -> Result<LocalIndexMetadata, RestError> {
            Ok(LocalIndexMetadata::default())
        }
        async fn index_status(&self) -> Result<Vec<IndexStatusEntry>, RestError> {
            Ok(self.index_status.clone())
        }
    }

    fn test_context() -> Arc<RebalanceContext> {
        Arc::new(RebalanceContext::new(RebalanceId::new(Uuid::nil()), NodeId::new(1)))
    }

    #[tokio::test]
    async fn created_success_moves_to_accepted() {
        let store = InMemoryCoordinationStore::new();
        let rest = Arc::new(StubRest {
            create_response: SimpleResponse { code: "success".into(), error: String::new() },
            build_response: None,
            index_status: vec![],
            calls: AtomicUsize::new(0),
        });
        let handler = DestinationHandler::new(
            store.clone(),
            rest,
            Arc::new(NullIndexStateSync),
            "/rebal",
            test_context(),
            RebalanceConfig::default(),
        );
        let token = created_token(1, 10, 0);
        let key = format!("/rebal/{}", token.store_key());
        handler.handle_created(token).await;

        let stored = store.get(&key).await.unwrap().unwrap();
        let decoded: TransferToken = serde_json::from_str(&stored).unwrap();
        assert_eq!(decoded.state, TokenState::Accepted);
    }

    #[tokio::test]
    async fn created_missing_keyspace_skips_to_commit() {
        let store = InMemoryCoordinationStore::new();
        let rest = Arc::new(StubRest {
            create_response: SimpleResponse { code: "error".into(), error: "bucket not found".into() },
            build_response: None,
            index_status: vec![],
            calls: AtomicUsize::new(0),
        });
        let handler = DestinationHandler::new(
            store.clone(),
            rest,
            Arc::new(NullIndexStateSync),
            "/rebal",
            test_context(),
            RebalanceConfig::default(),
        );
        let token = created_token(1, 10, 0);
        let key = format!("/rebal/{}", token.store_key());
        handler.handle_created(token).await;

        let stored = store.get(&key).await.unwrap().unwrap();
        let decoded: TransferToken = serde_json::from_str(&stored).unwrap();
        assert_eq!(decoded.state, TokenState::Commit);
    }

    #[tokio::test]
    async fn created_other_error_marks_failed() {
        let store = InMemoryCoordinationStore::new();
        let rest = Arc::new(StubRest {
            create_response: SimpleResponse { code: "error".into(), error: "disk full".into() },
            build_response: None,
            index_status: vec![],
            calls: AtomicUsize::new(0),
        });
        let handler = DestinationHandler::new(
            store.clone(),
            rest,
            Arc::new(NullIndexStateSync),
            "/rebal",
            test_context(),
            RebalanceConfig::default(),
        );
        let token = created_token(1, 10, 0);
        let key = format!("/rebal/{}", token.store_key());
        handler.handle_created(token).await;

        let stored = store.get(&key).await.unwrap().unwrap();
        let decoded: TransferToken = serde_json::from_str(&stored).unwrap();
        assert_eq!(decoded.state, TokenState::Error);
    }

    #[tokio::test]
    async fn token_merge_or_ready_no_proxy_moves_to_ready() {
        let store = InMemoryCoordinationStore::new();
        let rest = Arc::new(StubRest {
            create_response: SimpleResponse { code: "success".into(), error: String::new() },
            build_response: None,
            index_status: vec![],
            calls: AtomicUsize::new(0),
        });
        let handler = DestinationHandler::new(
            store.clone(),
            rest,
            Arc::new(NullIndexStateSync),
            "/rebal",
            test_context(),
            RebalanceConfig::default(),
        );
        let mut token = created_token(1, 10, 0);
        token.state = TokenState::InProgress;
        handler.context.increment_pending_build();

        handler.token_merge_or_ready(&mut token).await;

        assert_eq!(token.state, TokenState::Ready);
        assert_eq!(handler.context.pending_build_count(), 0);
    }

    #[tokio::test]
    async fn token_merge_or_ready_replica_repair_moves_to_commit() {
        let store = InMemoryCoordinationStore::new();
        let rest = Arc::new(StubRest {
            create_response: SimpleResponse { code: "success".into(), error: String::new() },
            build_response: None,
            index_status: vec![],
            calls: AtomicUsize::new(0),
        });
        let handler = DestinationHandler::new(
            store.clone(),
            rest,
            Arc::new(NullIndexStateSync),
            "/rebal",
            test_context(),
            RebalanceConfig::default(),
        );
        let mut token = created_token(1, 10, 0);
        token.index_inst.transfer_mode = TransferMode::ReplicaRepair;
        token.source_id = None;
        token.state = TokenState::InProgress;
        handler.context.increment_pending_build();

        handler.token_merge_or_ready(&mut token).await;

        assert_eq!(token.state, TokenState::Commit);
    }

    struct FailingMerge;

    #[async_trait]
    impl LocalIndexStateSync for FailingMerge {
        async fn mark_rebalance_active(&self, _inst_id: InstanceId) -> Result<(), String> {
            Ok(())
        }
        async fn merge_proxy_into_real(&self, _proxy_inst: InstanceId, _real_inst: InstanceId) -> Result<(), String> {
            Err("half-merge detected".to_string())
        }
    }

    #[tokio::test]
    async fn proxy_merge_failure_reverts_to_in_progress_and_flags_inconsistent() {
        let store = InMemoryCoordinationStore::new();
        let rest = Arc::new(StubRest {
            create_response: SimpleResponse { code: "success".into(), error: String::new() },
            build_response: None,
            index_status: vec![],
            calls: AtomicUsize::new(0),
        });
        let handler = DestinationHandler::new(
            store.clone(),
            rest,
            Arc::new(FailingMerge),
            "/rebal",
            test_context(),
            RebalanceConfig::default(),
        );
        let mut token = created_token(1, 10, 7); // real_inst_id = 7 => proxy
        token.state = TokenState::InProgress;

        handler.token_merge_or_ready(&mut token).await;

        assert_eq!(token.state, TokenState::InProgress);
        assert!(handler.context.is_merge_inconsistent());
    }

    #[tokio::test]
    async fn build_error_per_token_skips_missing_keyspace_forward() {
        let store = InMemoryCoordinationStore::new();
        let rest = Arc::new(StubRest {
            create_response: SimpleResponse { code: "success".into(), error: String::new() },
            build_response: Some(SimpleResponse {
                code: "error".into(),
                error: json!({"10": "bucket not found"}).to_string(),
            }),
            index_status: vec![],
            calls: AtomicUsize::new(0),
        });
        let handler = DestinationHandler::new(
            store.clone(),
            rest,
            Arc::new(NullIndexStateSync),
            "/rebal",
            test_context(),
            RebalanceConfig::default(),
        );
        let mut token = created_token(1, 10, 0);
        token.state = TokenState::InProgress;
        handler.context.increment_pending_build();
        let key = format!("/rebal/{}", token.store_key());

        let survivors = handler.apply_build_error(&json!({"10": "bucket not found"}).to_string(), vec![token]).await;

        assert!(survivors.is_empty());
        let stored = store.get(&key).await.unwrap().unwrap();
        let decoded: TransferToken = serde_json::from_str(&stored).unwrap();
        assert_eq!(decoded.state, TokenState::Commit);
        assert_eq!(handler.context.pending_build_count(), 0);
    }

    #[tokio::test]
    async fn build_error_fatal_marks_every_token_failed() {
        let store = InMemoryCoordinationStore::new();
        let rest = Arc::new(StubRest {
            create_response: SimpleResponse { code: "success".into(), error: String::new() },
            build_response: None,
            index_status: vec![],
            calls: AtomicUsize::new(0),
        });
        let handler = DestinationHandler::new(
            store.clone(),
            rest,
            Arc::new(NullIndexStateSync),
            "/rebal",
            test_context(),
            RebalanceConfig::default(),
        );
        let token = created_token(1, 10, 0);
        let key = format!("/rebal/{}", token.store_key());

        let survivors = handler.apply_build_error("json: cannot marshal", vec![token]).await;

        assert!(survivors.is_empty());
        let stored = store.get(&key).await.unwrap().unwrap();
        let decoded: TransferToken = serde_json::from_str(&stored).unwrap();
        assert_eq!(decoded.state, TokenState::Error);
    }
}
