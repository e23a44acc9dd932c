//! End-to-end scenario tests exercising the master controller together
//! with the real destination and source handlers against an in-memory
//! coordination store. Every scenario runs on a single simulated node
//! (master, destination, and source ids all equal) so one process can
//! play every role, the way a single-node cluster would.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use uuid::Uuid;

use crate::config::RebalanceConfig;
use crate::context::RebalanceContext;
use crate::destination::{DestinationHandler, NullIndexStateSync};
use crate::error::RebalanceError;
use crate::master::{MasterController, TopologyChange};
use crate::planner::{PlannerOutput, RebalancePlanner};
use crate::rest::{
    IndexDefnClone, IndexStatusEntry, IndexerRestClient, LocalIndexMetadata, RestError, SimpleResponse, StatsMap,
};
use crate::source::SourceHandler;
use crate::store::InMemoryCoordinationStore;
use crate::token::{
    IndexDefnId, IndexInstance, InstanceId, NodeId, RebalanceId, TokenState, TransferMode, TransferToken,
};

const NODE: u64 = 1;

fn idle_stats(inst_id: u64) -> StatsMap {
    let mut stats = StatsMap::new();
    stats.insert(format!("{inst_id}:0:num_requests"), json!(3));
    stats.insert(format!("{inst_id}:0:num_completed_requests"), json!(3));
    stats
}

fn move_token(defn: u64, inst: u64) -> TransferToken {
    TransferToken {
        token_id: Uuid::new_v4(),
        rebal_id: RebalanceId::new(Uuid::nil()),
        master_id: NodeId::new(NODE),
        source_id: Some(NodeId::new(NODE)),
        dest_id: NodeId::new(NODE),
        index_inst: IndexInstance {
            defn_id: IndexDefnId::new(defn),
            inst_id: InstanceId::new(inst),
            replica_id: 0,
            partitions: vec![0],
            real_inst_id: InstanceId::NONE,
            transfer_mode: TransferMode::Move,
        },
        state: TokenState::Created,
        error: String::new(),
        build_ts: vec![],
    }
}

fn replica_repair_token(defn: u64, inst: u64) -> TransferToken {
    let mut token = move_token(defn, inst);
    token.source_id = None;
    token.index_inst.transfer_mode = TransferMode::ReplicaRepair;
    token
}

/// A configurable REST double: every instance in `ready_instances` reports
/// `Ready` on `index_status` (the "nothing to build" fast path every
/// scenario below relies on to stay deterministic without simulated time).
/// Instances in `building_instances` report a non-terminal `Building`
/// status instead, so the destination takes the slow `InProgress` build
/// path and parks there until its next poll.
struct ScenarioRest {
    ready_instances: Vec<u64>,
    building_instances: Vec<u64>,
    create_error: Option<String>,
    stats_by_instance: HashMap<u64, StatsMap>,
    create_calls: AtomicUsize,
    drop_calls: AtomicUsize,
}

impl ScenarioRest {
    fn new(ready_instances: Vec<u64>) -> Self {
        let stats_by_instance = ready_instances.iter().map(|&id| (id, idle_stats(id))).collect();
        Self {
            ready_instances,
            building_instances: Vec::new(),
            create_error: None,
            stats_by_instance,
            create_calls: AtomicUsize::new(0),
            drop_calls: AtomicUsize::new(0),
        }
    }

    fn with_create_error(mut self, message: impl Into<String>) -> Self {
        self.create_error = Some(message.into());
        self
    }

    fn with_building_instance(mut self, inst_id: u64) -> Self {
        self.building_instances.push(inst_id);
        self
    }
}

#[async_trait]
impl IndexerRestClient for ScenarioRest {
    async fn create_index_rebalance(&self, _defn: &IndexDefnClone) -> Result<SimpleResponse, RestError> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        match &self.create_error {
            Some(message) => Ok(SimpleResponse { code: "error".into(), error: message.clone() }),
            None => Ok(SimpleResponse { code: "success".into(), error: String::new() }),
        }
    }

    async fn build_index_rebalance(&self, _defn_ids: &[IndexDefnId]) -> Result<SimpleResponse, RestError> {
        Ok(SimpleResponse { code: "success".into(), error: String::new() })
    }

    async fn drop_index(&self, _inst: &IndexInstance) -> Result<SimpleResponse, RestError> {
        self.drop_calls.fetch_add(1, Ordering::SeqCst);
        Ok(SimpleResponse { code: "success".into(), error: String::new() })
    }

    async fn stats(&self, _partition: bool) -> Result<StatsMap, RestError> {
        let mut merged = StatsMap::new();
        for stats in self.stats_by_instance.values() {
            merged.extend(stats.clone());
        }
        Ok(merged)
    }

    async fn local_index_metadata(&self) -> Result<LocalIndexMetadata, RestError> {
        Ok(LocalIndexMetadata::default())
    }

    async fn index_status(&self) -> Result<Vec<IndexStatusEntry>, RestError> {
        let ready = self.ready_instances.iter().map(|&id| IndexStatusEntry {
            inst_id: InstanceId::new(id),
            status: "Ready".into(),
            progress: 100.0,
            node_uuid: "node-1".into(),
        });
        let building = self.building_instances.iter().map(|&id| IndexStatusEntry {
            inst_id: InstanceId::new(id),
            status: "Building".into(),
            progress: 10.0,
            node_uuid: "node-1".into(),
        });
        Ok(ready.chain(building).collect())
    }
}

struct FixedPlanner(PlannerOutput);

impl RebalancePlanner for FixedPlanner {
    fn plan(&self, _input: &crate::planner::PlannerInput) -> Result<PlannerOutput, String> {
        Ok(self.0.clone())
    }
}

fn harness(
    tokens: Vec<TransferToken>,
    redundant_indexes: Vec<IndexDefnId>,
    rest: Arc<dyn IndexerRestClient>,
    batch_size: usize,
) -> Arc<MasterController> {
    let store = InMemoryCoordinationStore::new();
    let context = Arc::new(RebalanceContext::new(RebalanceId::new(Uuid::nil()), NodeId::new(NODE)));
    let config = RebalanceConfig { transfer_batch_size: batch_size, drop_index_wait_time_secs: 0, ..RebalanceConfig::default() };

    let destination = DestinationHandler::new(
        store.clone(),
        rest.clone(),
        Arc::new(NullIndexStateSync),
        "/rebal",
        context.clone(),
        config.clone(),
    );
    let (source, source_rx) = SourceHandler::new(store.clone(), rest.clone(), "/rebal", context.clone(), config.clone());
    source.spawn_worker(source_rx);

    MasterController::new(
        store,
        rest,
        Arc::new(FixedPlanner(PlannerOutput { tokens, redundant_indexes })),
        destination,
        source,
        context,
        config,
        "/rebal",
        "/command",
        "/schedule",
        "/ddl/lock",
        NodeId::new(NODE),
    )
}

async fn run_to_completion(controller: &Arc<MasterController>) -> Result<(), RebalanceError> {
    tokio::time::timeout(
        Duration::from_secs(5),
        controller.start(crate::planner::PlannerInput::default(), TopologyChange::default()),
    )
    .await
    .expect("rebalance should finish well within the test timeout")
}

#[tokio::test]
async fn single_move_happy_path_drains_to_empty_store() {
    let token = move_token(1, 10);
    let rest = Arc::new(ScenarioRest::new(vec![10]));
    let controller = harness(vec![token], vec![], rest.clone(), 20);

    let result = run_to_completion(&controller).await;

    assert!(result.is_ok());
    assert_eq!(rest.create_calls.load(Ordering::SeqCst), 1);
    assert_eq!(rest.drop_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn replica_repair_token_skips_source_and_commits_directly() {
    let token = replica_repair_token(2, 20);
    let rest = Arc::new(ScenarioRest::new(vec![20]));
    let controller = harness(vec![token], vec![], rest.clone(), 20);

    let result = run_to_completion(&controller).await;

    assert!(result.is_ok());
    // A replica-repair token has nothing to move from: the source drop
    // path is never invoked.
    assert_eq!(rest.drop_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn missing_keyspace_on_create_skips_straight_to_commit() {
    let token = move_token(3, 30);
    let rest = Arc::new(ScenarioRest::new(vec![30]).with_create_error("bucket not found"));
    let controller = harness(vec![token], vec![], rest.clone(), 20);

    let result = run_to_completion(&controller).await;

    assert!(result.is_ok());
    // Skipped straight from Created to Commit: no build, no drop.
    assert_eq!(rest.drop_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn multiple_batches_all_drain() {
    let tokens = vec![move_token(1, 10), move_token(1, 11), move_token(1, 12), move_token(1, 13)];
    let rest = Arc::new(ScenarioRest::new(vec![10, 11, 12, 13]));
    let controller = harness(tokens, vec![], rest.clone(), 2);

    let result = run_to_completion(&controller).await;

    assert!(result.is_ok());
    assert_eq!(rest.create_calls.load(Ordering::SeqCst), 4);
    assert_eq!(rest.drop_calls.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn cancel_while_token_in_progress_leaves_it_in_the_store() {
    let token = move_token(1, 10);
    let token_id = token.token_id;
    let rest = Arc::new(ScenarioRest::new(vec![]).with_building_instance(10));
    let store = InMemoryCoordinationStore::new();
    let context = Arc::new(RebalanceContext::new(RebalanceId::new(Uuid::nil()), NodeId::new(NODE)));
    let config = RebalanceConfig { drop_index_wait_time_secs: 0, ..RebalanceConfig::default() };

    let destination = DestinationHandler::new(
        store.clone(),
        rest.clone() as Arc<dyn IndexerRestClient>,
        Arc::new(NullIndexStateSync),
        "/rebal",
        context.clone(),
        config.clone(),
    );
    let (source, source_rx) =
        SourceHandler::new(store.clone(), rest.clone() as Arc<dyn IndexerRestClient>, "/rebal", context.clone(), config.clone());
    source.spawn_worker(source_rx);

    let controller = MasterController::new(
        store.clone(),
        rest.clone() as Arc<dyn IndexerRestClient>,
        Arc::new(FixedPlanner(PlannerOutput { tokens: vec![token], redundant_indexes: vec![] })),
        destination,
        source,
        context.clone(),
        config,
        "/rebal",
        "/command",
        "/schedule",
        "/ddl/lock",
        NodeId::new(NODE),
    );

    let driver = controller.clone();
    let handle =
        tokio::spawn(async move { driver.start(crate::planner::PlannerInput::default(), TopologyChange::default()).await });

    let key = format!("/rebal/TransferToken{token_id}");
    let reached_in_progress = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Some(raw) = store.get(&key).await.unwrap() {
                let token: TransferToken = serde_json::from_str(&raw).unwrap();
                if token.state == TokenState::InProgress {
                    return;
                }
            }
            tokio::task::yield_now().await;
        }
    })
    .await;
    assert!(reached_in_progress.is_ok(), "token never reached InProgress before the build poll");

    context.cancel.cancel();
    let result = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("rebalance should unwind well within the test timeout")
        .unwrap();
    assert!(matches!(result, Err(RebalanceError::Cancelled)));

    // The token was never dropped forward and stays exactly where the
    // cancelled build left it: no further writes happened after cancel.
    let stored = store.get(&key).await.unwrap().expect("token must remain in the store after a cancel");
    let decoded: TransferToken = serde_json::from_str(&stored).unwrap();
    assert_eq!(decoded.state, TokenState::InProgress);
    assert_eq!(rest.drop_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn duplicate_index_prepass_runs_before_batches_publish() {
    let token = move_token(5, 50);
    let rest = Arc::new(ScenarioRest::new(vec![50]));
    let controller = harness(vec![token], vec![IndexDefnId::new(99)], rest.clone(), 20);

    let result = run_to_completion(&controller).await;

    assert!(result.is_ok());
    // One drop for the duplicate-index pre-pass, one for the actual move.
    assert_eq!(rest.drop_calls.load(Ordering::SeqCst), 2);
}
