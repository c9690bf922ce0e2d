//! Per-round value types: configuration maps, metrics and dispatch
//! instructions.

use std::{collections::HashMap, fmt};

use derive_more::{Display, From};
use serde::{Deserialize, Serialize};

use crate::{client::ClientHandle, model::ParameterSet};

/// A single configuration or metric value.
#[derive(Debug, Clone, PartialEq, From, Display, Serialize, Deserialize)]
pub enum Scalar {
    #[display(fmt = "{}", _0)]
    Float(f64),
    #[display(fmt = "{}", _0)]
    Int(i64),
    #[display(fmt = "{}", _0)]
    Text(String),
    #[display(fmt = "{}", _0)]
    Flag(bool),
}

impl From<&str> for Scalar {
    fn from(value: &str) -> Self {
        Scalar::Text(value.to_string())
    }
}

/// Per-client instructions for one round, built fresh by the coordinator
/// and immutable once dispatched.
pub type RoundConfig = HashMap<String, Scalar>;

/// Named values reported by participants or produced by aggregation.
pub type Metrics = HashMap<String, Scalar>;

/// One fit call to perform against one participant.
pub struct FitInstruction {
    pub client: ClientHandle,
    pub parameters: ParameterSet,
    pub config: RoundConfig,
}

/// One evaluate call to perform against one participant.
pub struct EvaluateInstruction {
    pub client: ClientHandle,
    pub parameters: ParameterSet,
    pub config: RoundConfig,
}

impl fmt::Debug for FitInstruction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("FitInstruction")
            .field("client", &self.client.id())
            .field("tensors", &self.parameters.len())
            .field("config", &self.config)
            .finish()
    }
}

impl fmt::Debug for EvaluateInstruction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("EvaluateInstruction")
            .field("client", &self.client.id())
            .field("tensors", &self.parameters.len())
            .field("config", &self.config)
            .finish()
    }
}
