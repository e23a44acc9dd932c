//! Crate-wide error types.

use thiserror::Error;

use crate::rest::RestError;
use crate::store::StoreError;

/// Errors that can escape the rebalance core to a caller's `done` callback.
#[derive(Debug, Error)]
pub enum RebalanceError {
    /// A coordination-store write exhausted its retry budget.
    #[error("coordination store unreachable after {attempts} attempts: {source}")]
    StoreUnavailable {
        attempts: u32,
        #[source]
        source: StoreError,
    },

    /// A REST call to the local indexer surface failed non-recoverably.
    #[error("indexer REST call failed: {0}")]
    Rest(#[from] RestError),

    /// A token carried a non-empty `error` field; the rebalance aborts.
    #[error("token {token} failed: {message}")]
    TokenFailed { token: uuid::Uuid, message: String },

    /// `cancel()` was invoked; the rebalance unwound cleanly.
    #[error("rebalance cancelled")]
    Cancelled,

    /// The planner itself failed (e.g. could not reach a placement decision).
    #[error("planner error: {0}")]
    Planner(String),

    /// A DDL operation holds the interlock; the master refuses to start a
    /// rebalance until it clears.
    #[error("a DDL operation is in progress, refusing to start a rebalance")]
    DdlInProgress,

    /// A proxy-to-real merge failed and left the node's indexer state
    /// inconsistent. The embedder (server process) must treat this as
    /// fatal and exit; the handler itself stops touching this rebalance.
    #[error("merge of proxy instance into real instance left indexer state inconsistent, node must restart")]
    MergeInconsistent,

    /// The `Refused` token state has no defined handler yet — replan
    /// semantics are intentionally undecided, see DESIGN.md.
    #[error("refused-token replan is not implemented")]
    RefusedNotImplemented,

    /// Local bookkeeping found a state that should be unreachable (lost
    /// token, duplicate insert, etc). The crash-safety story rests on the
    /// coordination store, so callers are expected to treat this as fatal.
    #[error("internal bookkeeping invariant violated: {0}")]
    Invariant(String),
}

pub type Result<T> = std::result::Result<T, RebalanceError>;
