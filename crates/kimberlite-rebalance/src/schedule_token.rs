//! Schedule tokens: an orthogonal durable record that parks deferred-build
//! intents outside the transfer-token lifecycle. The only thing the core
//! does with them is re-home ownership when their owning node leaves the
//! cluster as part of a rebalance.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::retry::retry_write;
use crate::store::CoordinationStore;
use crate::token::{IndexDefnId, InstanceId, NodeId};

/// A deferred-build intent, owned by exactly one node at a time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleToken {
    pub token_id: Uuid,
    pub defn_id: IndexDefnId,
    pub inst_id: InstanceId,
    pub node_id: NodeId,
}

impl ScheduleToken {
    pub fn store_key(&self, schedule_dir: &str) -> String {
        format!("{schedule_dir}/ScheduleToken{}", self.token_id)
    }
}

/// Picks the new owner for a schedule token whose current owner is being
/// ejected. Any surviving node is an equally valid choice, so this just
/// round-robins across `keep_nodes` to spread ownership rather than piling
/// every orphaned token onto the first keep node.
fn choose_new_owner(keep_nodes: &[NodeId], index: usize) -> Option<NodeId> {
    if keep_nodes.is_empty() {
        return None;
    }
    Some(keep_nodes[index % keep_nodes.len()])
}

/// Re-homes every schedule token currently owned by an ejected node onto a
/// surviving node, persisting the new owner through the coordination
/// store. A single token's write failure is logged and skipped — per-token
/// best effort, since the background failover path will retry later on the
/// next rebalance or topology change; this helper never fails the caller.
pub async fn rehome_ejected_schedule_tokens(
    store: &dyn CoordinationStore,
    schedule_dir: &str,
    tokens: &[ScheduleToken],
    ejected: &HashSet<NodeId>,
    keep_nodes: &[NodeId],
) {
    let mut next_keep_index = 0usize;
    for token in tokens {
        if !ejected.contains(&token.node_id) {
            continue;
        }
        let Some(new_owner) = choose_new_owner(keep_nodes, next_keep_index) else {
            warn!(token_id = %token.token_id, "no surviving node available to re-home schedule token");
            continue;
        };
        next_keep_index += 1;

        let mut moved = token.clone();
        moved.node_id = new_owner;
        let key = moved.store_key(schedule_dir);
        let value = match serde_json::to_string(&moved) {
            Ok(v) => v,
            Err(e) => {
                warn!(token_id = %token.token_id, error = %e, "failed to encode re-homed schedule token");
                continue;
            }
        };

        let result = retry_write("rehome schedule token", || {
            let store = store;
            let key = key.clone();
            let value = value.clone();
            async move { store.put(&key, &value).await }
        })
        .await;

        if let Err(e) = result {
            warn!(token_id = %token.token_id, error = %e, "failed to re-home schedule token, leaving for next failover pass");
        }
    }
}
