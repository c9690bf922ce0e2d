//! Participant identity and the remote operations a participant exposes.
//!
//! How a participant trains or evaluates locally is opaque to the
//! coordinator: it only sees parameters and a config going out, and a
//! result or a [`ClientFailure`] coming back.

use std::sync::Arc;

use async_trait::async_trait;
use derive_more::Display;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::{
    model::ParameterSet,
    round::{Metrics, RoundConfig},
};

/// Identifies one participant for the lifetime of a session.
///
/// Registries key their membership by this id, and every result or
/// failure collected in a round carries it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, Serialize, Deserialize)]
pub struct ClientId(Uuid);

impl ClientId {
    /// Generates a fresh random identity.
    pub fn new() -> Self {
        ClientId(Uuid::new_v4())
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

/// The result of one completed local training pass.
#[derive(Debug, Clone)]
pub struct FitResult {
    /// The locally updated parameters, same ordered shapes as received.
    pub parameters: ParameterSet,
    /// The number of local examples trained on, used as aggregation weight.
    pub num_examples: u64,
    pub metrics: Metrics,
}

/// The result of one local evaluation pass.
#[derive(Debug, Clone)]
pub struct EvaluateResult {
    pub loss: f64,
    /// The number of local examples evaluated on, used as aggregation weight.
    pub num_examples: u64,
    pub metrics: Metrics,
}

/// An error reported for a single participant call.
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("the call timed out")]
    Timeout,

    #[error("the client disconnected")]
    Disconnected,

    #[error("the call failed: {0}")]
    Call(String),
}

/// A participant that did not return a usable result for a round.
///
/// Failures travel alongside successes in a round's result collection.
/// They are excluded from aggregation but never dropped silently.
#[derive(Debug)]
pub struct ClientFailure {
    pub client: ClientId,
    pub error: ClientError,
}

/// The remote operations of one participant.
///
/// Calls are request/response from the coordinator's point of view; any
/// transport or parallelism lives in the driver that performs them.
#[async_trait]
pub trait Client: Send + Sync {
    /// The stable identity of this participant.
    fn id(&self) -> ClientId;

    /// Returns the participant's current local parameters.
    ///
    /// Used by the driver to seed a session when the coordinator has no
    /// opinion on the initial parameters.
    async fn get_parameters(&self) -> Result<ParameterSet, ClientError>;

    /// Trains on the local dataset, starting from `parameters`.
    async fn fit(
        &self,
        parameters: ParameterSet,
        config: RoundConfig,
    ) -> Result<FitResult, ClientError>;

    /// Evaluates `parameters` against the local dataset.
    async fn evaluate(
        &self,
        parameters: ParameterSet,
        config: RoundConfig,
    ) -> Result<EvaluateResult, ClientError>;
}

/// A shared reference to a connected participant.
pub type ClientHandle = Arc<dyn Client>;
