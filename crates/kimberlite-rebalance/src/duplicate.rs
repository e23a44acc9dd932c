//! Duplicate-index pre-pass: before the rebalance proper begins, drop the
//! indexes the planner flagged as redundant replicas. Best-effort
//! end-to-end — a failure here never aborts the rebalance, it is only
//! logged.

use tracing::warn;

use crate::context::CancelToken;
use crate::rest::IndexerRestClient;
use crate::store::CoordinationStore;
use crate::token::{IndexDefnId, IndexInstance, InstanceId, TransferMode};

/// Attempts for the best-effort delete-command record post.
const DELETE_COMMAND_ATTEMPTS: u32 = 3;

fn delete_command_key(command_dir: &str, defn_id: IndexDefnId) -> String {
    format!("{command_dir}/delete/{}", defn_id.value())
}

/// A minimal instance descriptor identifying "the whole definition" for a
/// drop the planner flagged as a redundant replica, not a specific
/// in-flight transfer.
fn redundant_instance(defn_id: IndexDefnId) -> IndexInstance {
    IndexInstance {
        defn_id,
        inst_id: InstanceId::NONE,
        replica_id: 0,
        partitions: Vec::new(),
        real_inst_id: InstanceId::NONE,
        transfer_mode: TransferMode::Move,
    }
}

/// Best-effort post of a delete-command record: up to three tries, no
/// backoff beyond the caller's own poll cadence, failures logged and
/// swallowed.
async fn post_delete_command_best_effort(store: &dyn CoordinationStore, command_dir: &str, defn_id: IndexDefnId) {
    let key = delete_command_key(command_dir, defn_id);
    for attempt in 1..=DELETE_COMMAND_ATTEMPTS {
        match store.put(&key, "{}").await {
            Ok(()) => return,
            Err(e) => {
                warn!(defn_id = defn_id.value(), attempt, error = %e, "delete-command post failed");
            }
        }
    }
    warn!(defn_id = defn_id.value(), "delete-command post exhausted best-effort attempts, continuing anyway");
}

/// Runs the pre-pass but aborts early if `cancel` fires between indexes,
/// returning whether the pre-pass ran to completion.
pub async fn run_duplicate_prepass_cancellable(
    store: &dyn CoordinationStore,
    rest: &dyn IndexerRestClient,
    command_dir: &str,
    redundant: &[IndexDefnId],
    cancel: &CancelToken,
) -> bool {
    for &defn_id in redundant {
        if cancel.is_cancelled() {
            return false;
        }
        post_delete_command_best_effort(store, command_dir, defn_id).await;

        let instance = redundant_instance(defn_id);
        match rest.drop_index(&instance).await {
            Ok(resp) if resp.is_success() => {}
            Ok(resp) => {
                warn!(defn_id = defn_id.value(), error = %resp.error, "duplicate-index drop returned an error response");
            }
            Err(e) => {
                warn!(defn_id = defn_id.value(), error = %e, "duplicate-index drop REST call failed");
            }
        }
    }
    !cancel.is_cancelled()
}
