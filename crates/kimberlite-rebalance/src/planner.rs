//! The planner seam.
//!
//! *What* moves *where* is decided by an external planner, invoked once at
//! the start of each rebalance. This module defines only the interface the
//! core calls and the data it exchanges with the planner — the planning
//! algorithm itself is out of scope.

use crate::token::{IndexDefnId, TransferToken};

/// Configuration knobs the planner needs, mirroring the
/// `rebalance.*`/`planner.*` configuration keys.
#[derive(Debug, Clone)]
pub struct PlannerInput {
    /// Master hint: only eject nodes being removed, don't otherwise
    /// rebalance (`rebalance.node_eject_only`).
    pub eject_only: bool,
    /// Disables replica-repair token generation
    /// (`rebalance.disable_replica_repair`).
    pub disable_replica_repair: bool,
    /// Overrides `eject_only` to allow full redistribution
    /// (`settings.rebalance.redistribute_indexes`).
    pub redistribute_indexes: bool,
    /// Wall-clock budget for the planning run (`planner.timeout`).
    pub timeout: std::time::Duration,
    /// Acceptable load variation before the planner stops iterating
    /// (`planner.variationThreshold`).
    pub variation_threshold: f64,
    pub min_iter_per_temp: u32,
    pub max_iter_per_temp: u32,
}

impl Default for PlannerInput {
    fn default() -> Self {
        Self {
            eject_only: false,
            disable_replica_repair: false,
            redistribute_indexes: false,
            timeout: std::time::Duration::from_secs(120),
            variation_threshold: 0.1,
            min_iter_per_temp: 100,
            max_iter_per_temp: 1000,
        }
    }
}

/// What the planner hands back to the master controller: the tokens to
/// execute, plus the set of indexes flagged as redundant replicas for the
/// duplicate-index pre-pass.
#[derive(Debug, Clone, Default)]
pub struct PlannerOutput {
    pub tokens: Vec<TransferToken>,
    pub redundant_indexes: Vec<IndexDefnId>,
}

/// The planner interface the master controller calls once per rebalance.
/// Implementing the actual placement algorithm is an explicit non-goal of
/// this crate.
pub trait RebalancePlanner: Send + Sync {
    fn plan(&self, input: &PlannerInput) -> Result<PlannerOutput, String>;
}

/// A planner that proposes no moves. Used when this rebalance is not
/// meant to run the planner at all, and as a baseline in tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullPlanner;

impl RebalancePlanner for NullPlanner {
    fn plan(&self, _input: &PlannerInput) -> Result<PlannerOutput, String> {
        Ok(PlannerOutput::default())
    }
}
