//! Per-rebalance node-local state.
//!
//! A rebalance's context is an owned object, not a process-wide global:
//! several rebalances can be issued serially, so each run gets its own
//! context that is discarded at finish to avoid state leaking between runs.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use tokio::sync::{Notify, RwLock};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::token::{NodeId, RebalanceId, TokenState, TransferToken};

/// A single structured cancellation signal. One `CancelToken` can be
/// cloned and handed to every handler; every suspension point in the
/// crate selects on [`CancelToken::cancelled`] alongside its real work.
#[derive(Clone)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            notify: Arc::new(Notify::new()),
        }
    }

    /// Fires the signal. Idempotent.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Resolves immediately if already cancelled; otherwise waits for
    /// [`CancelToken::cancel`].
    pub async fn cancelled(&self) {
        loop {
            if self.is_cancelled() {
                return;
            }
            let notified = self.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

/// The three maps this module groups under one read/write mutex: every
/// token this node has ever seen, the destination's accepted-tokens view,
/// and the source's view.
#[derive(Debug, Default)]
pub struct RebalanceTokenMaps {
    pub transfer_tokens: HashMap<Uuid, TransferToken>,
    pub accepted_tokens: HashMap<Uuid, TransferToken>,
    pub source_tokens: HashMap<Uuid, TransferToken>,
    /// Last state this node has locally cached per token, used by
    /// [`crate::token::should_apply`] to drop duplicate/reordered
    /// notifications.
    pub last_seen_state: HashMap<Uuid, TokenState>,
}

/// Per-rebalance node-local state.
pub struct RebalanceContext {
    pub rebal_id: RebalanceId,
    pub master_id: NodeId,
    pub maps: Arc<RwLock<RebalanceTokenMaps>>,
    /// Number of destination instances in the current batch that have not
    /// yet reached `Ready`/`Commit`. Source drops are gated on this
    /// reaching zero.
    pub pending_build: Arc<AtomicI64>,
    pub cancel: CancelToken,
    pub done: CancelToken,
    pub progress_cache: Arc<RwLock<f64>>,
    /// Nodes the post-rebalance ownership transfer should prefer, if this
    /// is a topology-change rebalance with nodes being removed.
    pub keep_nodes: Arc<RwLock<Option<HashSet<NodeId>>>>,
    /// Set once a proxy-to-real merge fails and leaves this node's indexer
    /// state inconsistent. The embedder must observe this and crash; the
    /// handler itself only stops touching the affected token.
    merge_inconsistent: Arc<AtomicBool>,
    closed: Arc<AtomicBool>,
    tasks: Arc<tokio::sync::Mutex<Vec<JoinHandle<()>>>>,
}

impl RebalanceContext {
    pub fn new(rebal_id: RebalanceId, master_id: NodeId) -> Self {
        Self {
            rebal_id,
            master_id,
            maps: Arc::new(RwLock::new(RebalanceTokenMaps::default())),
            pending_build: Arc::new(AtomicI64::new(0)),
            cancel: CancelToken::new(),
            done: CancelToken::new(),
            progress_cache: Arc::new(RwLock::new(0.0)),
            keep_nodes: Arc::new(RwLock::new(None)),
            merge_inconsistent: Arc::new(AtomicBool::new(false)),
            closed: Arc::new(AtomicBool::new(false)),
            tasks: Arc::new(tokio::sync::Mutex::new(Vec::new())),
        }
    }

    /// Spawns `fut` as a tracked background task, unless the context has
    /// already been closed for shutdown. Checking `closed` both before and
    /// after acquiring the task-list lock closes the race where a task is
    /// spawned just as `shutdown` starts draining the list. Returns
    /// whether the task was actually spawned.
    pub async fn spawn_tracked<F>(&self, fut: F) -> bool
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        if self.closed.load(Ordering::SeqCst) {
            return false;
        }
        let mut tasks = self.tasks.lock().await;
        if self.closed.load(Ordering::SeqCst) {
            return false;
        }
        tasks.push(tokio::spawn(fut));
        true
    }

    /// Signals cancellation and waits for every tracked task to exit
    /// (`cancel()` semantics (a)/(c)).
    pub async fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.cancel.cancel();
        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            let _ = task.await;
        }
    }

    pub fn pending_build_count(&self) -> i64 {
        self.pending_build.load(Ordering::SeqCst)
    }

    pub fn increment_pending_build(&self) {
        self.pending_build.fetch_add(1, Ordering::SeqCst);
    }

    pub fn decrement_pending_build(&self) {
        self.pending_build.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn mark_merge_inconsistent(&self) {
        self.merge_inconsistent.store(true, Ordering::SeqCst);
    }

    pub fn is_merge_inconsistent(&self) -> bool {
        self.merge_inconsistent.load(Ordering::SeqCst)
    }
}
