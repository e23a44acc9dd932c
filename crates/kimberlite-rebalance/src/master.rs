//! Master controller: the single entry point that runs one rebalance from
//! planning through to a fully drained token set.
//!
//! The master plans, runs the duplicate-index pre-pass, publishes tokens in
//! barriered batches, and then only reacts: every state transition after
//! publication is driven by the destination and source role handlers
//! observing the same coordination-store watch this controller sets up.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::{Mutex, Notify};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::RebalanceConfig;
use crate::context::RebalanceContext;
use crate::destination::DestinationHandler;
use crate::duplicate::run_duplicate_prepass_cancellable;
use crate::error::{RebalanceError, Result};
use crate::planner::{PlannerInput, RebalancePlanner};
use crate::rest::IndexerRestClient;
use crate::retry::retry_write;
use crate::schedule_token::{rehome_ejected_schedule_tokens, ScheduleToken};
use crate::source::SourceHandler;
use crate::store::{CoordinationStore, WatchEvent};
use crate::token::{should_apply, NodeId, TokenState, TransferToken};

/// Extra topology-change inputs a rebalance triggered by nodes leaving the
/// cluster needs, on top of what the planner itself takes.
#[derive(Debug, Clone, Default)]
pub struct TopologyChange {
    pub ejected_nodes: HashSet<NodeId>,
    pub keep_nodes: Vec<NodeId>,
    pub schedule_tokens: Vec<ScheduleToken>,
}

struct BatchState {
    batches: Vec<Vec<Uuid>>,
    current: usize,
    outstanding_in_current: usize,
}

pub struct MasterController {
    store: Arc<dyn CoordinationStore>,
    rest: Arc<dyn IndexerRestClient>,
    planner: Arc<dyn RebalancePlanner>,
    destination: Arc<DestinationHandler>,
    source: Arc<SourceHandler>,
    context: Arc<RebalanceContext>,
    config: RebalanceConfig,
    rebal_dir: String,
    command_dir: String,
    schedule_dir: String,
    ddl_lock_key: String,
    this_node: NodeId,
    batch_state: Mutex<BatchState>,
    finished: Notify,
    outcome: Mutex<Option<RebalanceError>>,
    topology: Mutex<TopologyChange>,
}

impl MasterController {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        rest: Arc<dyn IndexerRestClient>,
        planner: Arc<dyn RebalancePlanner>,
        destination: Arc<DestinationHandler>,
        source: Arc<SourceHandler>,
        context: Arc<RebalanceContext>,
        config: RebalanceConfig,
        rebal_dir: impl Into<String>,
        command_dir: impl Into<String>,
        schedule_dir: impl Into<String>,
        ddl_lock_key: impl Into<String>,
        this_node: NodeId,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            rest,
            planner,
            destination,
            source,
            context,
            config,
            rebal_dir: rebal_dir.into(),
            command_dir: command_dir.into(),
            schedule_dir: schedule_dir.into(),
            ddl_lock_key: ddl_lock_key.into(),
            this_node,
            batch_state: Mutex::new(BatchState { batches: Vec::new(), current: 0, outstanding_in_current: 0 }),
            finished: Notify::new(),
            outcome: Mutex::new(None),
            topology: Mutex::new(TopologyChange::default()),
        })
    }

    /// Runs one full rebalance to completion, or until cancelled or a
    /// token fails fatally. Must be called on an `Arc<Self>` because the
    /// watch dispatch closure and every spawned handler task hold a clone.
    pub async fn start(self: &Arc<Self>, input: PlannerInput, topology: TopologyChange) -> Result<()> {
        self.check_ddl_interlock().await?;
        *self.topology.lock().await = topology;

        let plan = self.planner.plan(&input).map_err(RebalanceError::Planner)?;

        let prepass_completed = run_duplicate_prepass_cancellable(
            self.store.as_ref(),
            self.rest.as_ref(),
            &self.command_dir,
            &plan.redundant_indexes,
            &self.context.cancel,
        )
        .await;
        if !prepass_completed {
            return Err(RebalanceError::Cancelled);
        }

        if plan.tokens.is_empty() {
            info!("plan produced no tokens, nothing to rebalance");
            self.finish().await;
            return Ok(());
        }

        {
            let mut maps = self.context.maps.write().await;
            for token in &plan.tokens {
                if maps.transfer_tokens.insert(token.token_id, token.clone()).is_some() {
                    return Err(RebalanceError::Invariant(format!(
                        "planner produced duplicate token id {}",
                        token.token_id
                    )));
                }
            }
        }

        let batch_size = self.config.transfer_batch_size.max(1);
        let batches: Vec<Vec<Uuid>> =
            plan.tokens.chunks(batch_size).map(|chunk| chunk.iter().map(|t| t.token_id).collect()).collect();
        {
            let mut state = self.batch_state.lock().await;
            state.batches = batches;
            state.current = 0;
            state.outstanding_in_current = 0;
        }

        let dispatcher = self.clone();
        let mut watch_handle = self
            .store
            .watch_children(
                &self.rebal_dir,
                Box::new(move |event| {
                    let dispatcher = dispatcher.clone();
                    tokio::spawn(async move { dispatcher.dispatch(event).await });
                }),
            )
            .await
            .map_err(|e| RebalanceError::StoreUnavailable { attempts: 1, source: e })?;

        self.publish_current_batch().await;

        tokio::select! {
            _ = self.finished.notified() => {}
            _ = self.context.cancel.cancelled() => {
                let mut outcome = self.outcome.lock().await;
                if outcome.is_none() {
                    *outcome = Some(RebalanceError::Cancelled);
                }
            }
        }

        watch_handle.stop().await;
        self.context.done.cancel();

        if self.context.is_merge_inconsistent() {
            return Err(RebalanceError::MergeInconsistent);
        }

        match self.outcome.lock().await.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Signals the running rebalance to unwind. Idempotent.
    pub fn cancel(&self) {
        self.context.cancel.cancel();
    }

    async fn check_ddl_interlock(&self) -> Result<()> {
        match self.store.get(&self.ddl_lock_key).await {
            Ok(Some(_)) => Err(RebalanceError::DdlInProgress),
            Ok(None) => Ok(()),
            Err(e) => Err(RebalanceError::StoreUnavailable { attempts: 1, source: e }),
        }
    }

    async fn publish_current_batch(self: &Arc<Self>) {
        let (token_ids, batch_len) = {
            let mut state = self.batch_state.lock().await;
            let Some(ids) = state.batches.get(state.current).cloned() else {
                drop(state);
                self.finish().await;
                return;
            };
            let len = ids.len();
            state.outstanding_in_current = len;
            (ids, len)
        };

        if batch_len == 0 {
            self.advance_batch().await;
            return;
        }

        let tokens: Vec<TransferToken> = {
            let maps = self.context.maps.read().await;
            token_ids.iter().filter_map(|id| maps.transfer_tokens.get(id).cloned()).collect()
        };

        for token in tokens {
            let key = format!("{}/{}", self.rebal_dir, token.store_key());
            let value = match serde_json::to_string(&token) {
                Ok(v) => v,
                Err(e) => {
                    warn!(token_id = %token.token_id, error = %e, "failed to encode token for publication");
                    continue;
                }
            };
            let store = self.store.as_ref();
            let result = retry_write("publish batch token", || {
                let key = key.clone();
                let value = value.clone();
                async move { store.put(&key, &value).await }
            })
            .await;
            if let Err(e) = result {
                self.fail(RebalanceError::StoreUnavailable { attempts: crate::retry::MAX_ATTEMPTS, source: e }).await;
                return;
            }
        }
    }

    async fn advance_batch(self: &Arc<Self>) {
        {
            let mut state = self.batch_state.lock().await;
            state.current += 1;
        }
        self.publish_current_batch().await;
    }

    async fn dispatch(self: Arc<Self>, event: WatchEvent) {
        let Some(value) = event.value else {
            self.handle_deletion(&event.path).await;
            return;
        };
        let Ok(token) = serde_json::from_str::<TransferToken>(&value) else {
            warn!(path = %event.path, "ignoring unparseable coordination-store entry");
            return;
        };

        let already_applied = {
            let mut maps = self.context.maps.write().await;
            let cached = maps.last_seen_state.get(&token.token_id).copied();
            if !should_apply(cached, token.state) {
                true
            } else {
                maps.last_seen_state.insert(token.token_id, token.state);
                false
            }
        };
        if already_applied {
            return;
        }

        if token.has_error() {
            error!(token_id = %token.token_id, error = %token.error, "token failed, aborting rebalance");
            self.fail(RebalanceError::TokenFailed { token: token.token_id, message: token.error.clone() }).await;
            return;
        }

        match token.state {
            TokenState::Created if token.dest_id == self.this_node => {
                let destination = self.destination.clone();
                destination.handle_created(token).await;
            }
            TokenState::Accepted if token.master_id == self.this_node => {
                self.advance_to_initiate(token).await;
            }
            TokenState::Initiate if token.dest_id == self.this_node => {
                let destination = self.destination.clone();
                destination.handle_initiate(token).await;
            }
            TokenState::Ready if token.source_id == Some(self.this_node) => {
                self.source.enqueue_ready(token).await;
            }
            TokenState::Commit if token.master_id == self.this_node => {
                self.delete_token(&token).await;
            }
            TokenState::Refused if token.master_id == self.this_node => {
                error!(token_id = %token.token_id, "destination refused token, replan is not implemented");
                self.fail(RebalanceError::RefusedNotImplemented).await;
            }
            _ => {}
        }
    }

    async fn advance_to_initiate(&self, mut token: TransferToken) {
        token.state = TokenState::Initiate;
        let key = format!("{}/{}", self.rebal_dir, token.store_key());
        let value = match serde_json::to_string(&token) {
            Ok(v) => v,
            Err(e) => {
                warn!(token_id = %token.token_id, error = %e, "failed to encode token for initiate");
                return;
            }
        };
        let store = self.store.as_ref();
        let result = retry_write("advance token to initiate", || {
            let key = key.clone();
            let value = value.clone();
            async move { store.put(&key, &value).await }
        })
        .await;
        if let Err(e) = result {
            warn!(token_id = %token.token_id, error = %e, "failed to publish initiate, node should restart");
        }
    }

    async fn delete_token(self: &Arc<Self>, token: &TransferToken) {
        let key = format!("{}/{}", self.rebal_dir, token.store_key());
        if let Err(e) = self.store.delete(&key).await {
            warn!(token_id = %token.token_id, error = %e, "failed to delete committed token");
            return;
        }
        let mut maps = self.context.maps.write().await;
        maps.transfer_tokens.remove(&token.token_id);
    }

    async fn handle_deletion(self: &Arc<Self>, path: &str) {
        let Some(id_str) = path.strip_prefix(&format!("{}/TransferToken", self.rebal_dir)) else {
            return;
        };
        let Ok(token_id) = id_str.parse::<Uuid>() else {
            return;
        };

        // The coordination store delivers at-least-once and possibly
        // reordered; fold the deletion into the same monotonic cache the
        // value-bearing transitions use so a re-delivered deletion can
        // never decrement the batch counter twice.
        let already_applied = {
            let mut maps = self.context.maps.write().await;
            let cached = maps.last_seen_state.get(&token_id).copied();
            if !should_apply(cached, TokenState::Deleted) {
                true
            } else {
                maps.last_seen_state.insert(token_id, TokenState::Deleted);
                false
            }
        };
        if already_applied {
            return;
        }

        let batch_done = {
            let mut state = self.batch_state.lock().await;
            let Some(current_batch) = state.batches.get(state.current) else {
                return;
            };
            if !current_batch.contains(&token_id) {
                return;
            }
            state.outstanding_in_current = state.outstanding_in_current.saturating_sub(1);
            state.outstanding_in_current == 0
        };

        if batch_done {
            self.advance_batch().await;
        }
    }

    async fn fail(&self, error: RebalanceError) {
        *self.outcome.lock().await = Some(error);
        self.context.cancel.cancel();
        self.finished.notify_waiters();
    }

    async fn finish(self: &Arc<Self>) {
        let topology = self.topology.lock().await;
        if !topology.ejected_nodes.is_empty() {
            rehome_ejected_schedule_tokens(
                self.store.as_ref(),
                &self.schedule_dir,
                &topology.schedule_tokens,
                &topology.ejected_nodes,
                &topology.keep_nodes,
            )
            .await;
        }
        drop(topology);
        self.finished.notify_waiters();
    }
}
