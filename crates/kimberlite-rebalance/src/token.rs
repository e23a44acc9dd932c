//! The transfer-token record and its state machine.
//!
//! A [`TransferToken`] is the only thing the master, source, and
//! destination roles ever exchange. It is written into the coordination
//! store; the watch subscription is the only signal any role ever acts on.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifies one cluster node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(u64);

impl NodeId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for NodeId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// Identifies an index definition (the DDL-level object, independent of
/// which instances/replicas/partitions of it exist).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct IndexDefnId(u64);

impl IndexDefnId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for IndexDefnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies one physical instance of an index definition (one replica,
/// or one proxy/real split of a partitioned replica).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InstanceId(u64);

impl InstanceId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// The sentinel used by [`IndexInstance::real_inst_id`] to mean "not a
    /// proxy — this instance stands on its own".
    pub const NONE: InstanceId = InstanceId(0);

    pub fn is_none(self) -> bool {
        self.0 == 0
    }

    pub fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies a single rebalance run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RebalanceId(Uuid);

impl RebalanceId {
    pub fn new(id: Uuid) -> Self {
        Self(id)
    }
}

impl fmt::Display for RebalanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Whether a token represents an actual instance move, or the creation of
/// an additional replica with no pre-existing source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TransferMode {
    /// The instance exists on `source_node` today and is moving to
    /// `dest_node`.
    Move,
    /// There is no source; the destination is materialising a fresh
    /// replica to restore the configured replica count.
    ReplicaRepair,
}

/// The role permitted to transition a token out of a given state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Owner {
    Master,
    Source,
    Destination,
}

/// One planned movement of one index instance, and the progress of its
/// execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TokenState {
    /// Just published by the master. Destination must materialise a shell
    /// (deferred) index and acknowledge.
    Created,
    /// Destination has the shell index; master ratifies acceptance.
    Accepted,
    /// Destination may begin the work.
    Initiate,
    /// Catch-up build is in progress on the destination.
    InProgress,
    /// A proxy partition is being merged into a pre-existing real
    /// instance on the destination.
    Merge,
    /// Destination is serving; source must drop its copy once idle.
    Ready,
    /// Move is logically complete; master may delete the token.
    Commit,
    /// Token has been removed from the coordination store. Terminal.
    Deleted,
    /// Destination refused the token (policy/DDL conflict). No handler
    /// exists today — reserved for a future replan path.
    Refused,
    /// Fatal per-token failure. Aborts the whole rebalance.
    Error,
}

impl TokenState {
    /// Numeric ordering used for the monotonicity check. This is distinct from the wire representation (which
    /// serialises the variant name) precisely so that adding states never
    /// has to renumber the wire format.
    ///
    /// `Error` and `Refused` are terminal-from-anywhere faults, so they
    /// are given codes higher than every in-flight state: a fault
    /// discovered while a token is at `InProgress` must still compare as
    /// "strictly greater than InProgress" to be accepted by every
    /// watcher.
    pub fn state_code(self) -> u8 {
        match self {
            TokenState::Created => 0,
            TokenState::Accepted => 1,
            TokenState::Initiate => 2,
            TokenState::InProgress => 3,
            TokenState::Merge => 4,
            TokenState::Ready => 5,
            TokenState::Commit => 6,
            TokenState::Deleted => 7,
            TokenState::Refused => 90,
            TokenState::Error => 99,
        }
    }

    /// The role that is permitted to advance the token out of this state.
    pub fn owner(self) -> Owner {
        match self {
            TokenState::Created | TokenState::Initiate | TokenState::InProgress | TokenState::Merge => {
                Owner::Destination
            }
            TokenState::Ready => Owner::Source,
            TokenState::Accepted
            | TokenState::Commit
            | TokenState::Deleted
            | TokenState::Refused
            | TokenState::Error => Owner::Master,
        }
    }

    /// True once a token can never transition again.
    pub fn is_terminal(self) -> bool {
        matches!(self, TokenState::Deleted | TokenState::Refused)
    }
}

/// Decides whether an incoming `(path, state)` notification should be
/// applied, given the last state this node has locally cached for the
/// token.
///
/// `cached == None` models first-notification re-entry: the very first
/// callback for a token has nothing to compare against and is always
/// applied. Every subsequent callback is applied only if its state
/// is strictly greater than the cached one — this is what makes duplicate
/// and reordered coordination-store notifications harmless.
pub fn should_apply(cached: Option<TokenState>, incoming: TokenState) -> bool {
    match cached {
        None => true,
        Some(c) => incoming.state_code() > c.state_code(),
    }
}

/// The index instance being moved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexInstance {
    pub defn_id: IndexDefnId,
    pub inst_id: InstanceId,
    pub replica_id: u32,
    /// Partitions of `defn_id` carried by this instance.
    pub partitions: Vec<u32>,
    /// Non-zero iff this instance is a proxy that must eventually be
    /// merged into the real instance with this id.
    pub real_inst_id: InstanceId,
    pub transfer_mode: TransferMode,
}

impl IndexInstance {
    /// Whether this instance is a proxy awaiting a merge.
    pub fn is_proxy(&self) -> bool {
        !self.real_inst_id.is_none()
    }
}

/// One planned movement of one index instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferToken {
    pub token_id: Uuid,
    pub rebal_id: RebalanceId,
    pub master_id: NodeId,
    /// Empty (`None`) for replica-repair tokens — there is no source.
    pub source_id: Option<NodeId>,
    pub dest_id: NodeId,
    pub index_inst: IndexInstance,
    pub state: TokenState,
    /// Non-empty iff the token has failed fatally.
    pub error: String,
    /// Per-vbucket sequence numbers the destination uses to request a
    /// catch-up build starting point.
    pub build_ts: Vec<u64>,
}

impl TransferToken {
    /// Coordination-store key for this token under a rebalance directory.
    pub fn store_key(&self) -> String {
        format!("TransferToken{}", self.token_id)
    }

    pub fn has_error(&self) -> bool {
        !self.error.is_empty()
    }

    pub fn mark_error(&mut self, message: impl Into<String>) {
        self.error = message.into();
        self.state = TokenState::Error;
    }

    /// True for a token with no source node: replica-repair tokens
    /// materialise a fresh replica with nothing to move from.
    pub fn is_replica_repair(&self) -> bool {
        matches!(self.index_inst.transfer_mode, TransferMode::ReplicaRepair)
    }
}
