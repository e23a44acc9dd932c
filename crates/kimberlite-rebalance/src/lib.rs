//! # kmb-rebalance: Secondary-index rebalance orchestration for `Kimberlite`
//!
//! This crate moves secondary-index instances between nodes when the
//! cluster topology changes, without ever taking an index offline. A
//! rebalance is driven by one [`master::MasterController`] per run and
//! executed cooperatively by every node playing a destination or source
//! role for the instances it owns.
//!
//! ## Architecture
//!
//! - [`token`]: The [`token::TransferToken`] state machine every role
//!   advances, plus the monotonicity check that makes duplicate or
//!   reordered coordination-store notifications harmless.
//! - [`store`]: The coordination-store seam ([`store::CoordinationStore`])
//!   every cross-node signal flows through.
//! - [`planner`]: The placement-decision seam; the algorithm itself is out
//!   of scope for this crate.
//! - [`destination`]: Destination-side handling — shell-index creation,
//!   catch-up build, and proxy-to-real merge.
//! - [`source`]: Source-side handling — quiesce-then-drop, serialised
//!   through a single per-node drop worker.
//! - [`master`]: The controller that plans, batches, and reacts to the
//!   watch stream until the run drains.
//! - [`schedule_token`]: Re-homing of deferred-build intents orphaned by
//!   node ejection.
//! - [`duplicate`]: The best-effort duplicate-index pre-pass run before
//!   the batches are published.
//! - [`build_estimator`] / [`progress`]: Turning raw mutation counters into
//!   a remaining-build-time estimate and an external progress percentage.
//! - [`context`]: Per-run node-local state (in-flight token maps, the
//!   pending-build gate, cancellation).
//! - [`config`]: Recognised configuration keys and their defaults.
//! - [`error`]: The error type that can escape to an embedder's `done`
//!   callback.
//! - [`retry`]: The bounded-attempt backoff wrapper for coordination-store
//!   writes that must not be lost.
//! - [`rest`]: The local indexer REST surface and its error-string
//!   protocol.

pub mod build_estimator;
pub mod config;
pub mod context;
pub mod destination;
pub mod duplicate;
pub mod error;
pub mod master;
pub mod planner;
pub mod progress;
pub mod rest;
pub mod retry;
pub mod schedule_token;
pub mod source;
pub mod store;
pub mod token;

pub use config::RebalanceConfig;
pub use error::{RebalanceError, Result};
pub use master::{MasterController, TopologyChange};
pub use token::{NodeId, TokenState, TransferToken};

#[cfg(test)]
mod tests;
