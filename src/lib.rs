//! # Fedra: round-based coordination for federated learning
//!
//! A federated session is a sequence of rounds. In every round a central
//! coordinator samples a subset of the connected participants, hands each
//! of them the current global parameters together with a per-group
//! configuration, collects whatever comes back - results and failures
//! alike - and folds the successes into the next global parameter set.
//! Local training itself is a black box behind the [`Client`] trait:
//! fedra coordinates, it does not descend gradients.
//!
//! The crate splits along that seam:
//!
//! - [`coordinator`] - the round state machine: selection policy with a
//!   two-tier quorum, deterministic per-group configuration, weighted
//!   aggregation and failure bookkeeping;
//! - [`aggregation`] - the pure weighted-averaging routines;
//! - [`registry`] - the set of currently connected participants and the
//!   sampling over it;
//! - [`driver`] - the multi-round loop that dispatches instructions
//!   concurrently and owns timeouts and abort decisions;
//! - [`simulation`] - deterministic in-process participants for running
//!   the protocol without a training stack.
//!
//! Per-client failures are data, not exceptions: a participant that times
//! out or errors is carried through the round as a tagged
//! [`ClientFailure`] and excluded from the weighted averages, while the
//! round proceeds with the remaining successes.
//!
//! [`Client`]: crate::client::Client
//! [`ClientFailure`]: crate::client::ClientFailure

pub mod aggregation;
pub mod client;
pub mod coordinator;
pub mod driver;
pub mod model;
pub mod registry;
pub mod round;
pub mod settings;
pub mod simulation;
