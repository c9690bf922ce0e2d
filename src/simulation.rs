//! Deterministic in-process participants.
//!
//! Real deployments put a training stack behind the [`Client`] trait; the
//! simulation replaces it with a synthetic objective so the coordination
//! protocol can be exercised end to end without one. Each client's local
//! dataset is summarized by a local optimum: `fit` relaxes the received
//! weights toward that optimum, `evaluate` reports the mean squared
//! distance to it.

use async_trait::async_trait;

use crate::{
    client::{Client, ClientError, ClientId, EvaluateResult, FitResult},
    model::ParameterSet,
    round::{Metrics, RoundConfig, Scalar},
};

/// A simulated participant with a synthetic local objective.
pub struct LocalClient {
    id: ClientId,
    optimum: ParameterSet,
    num_examples: u64,
}

impl LocalClient {
    /// Creates a participant whose local data pulls toward `optimum` with
    /// the weight of `num_examples` examples.
    pub fn new(optimum: ParameterSet, num_examples: u64) -> Self {
        Self {
            id: ClientId::new(),
            optimum,
            num_examples,
        }
    }

    fn config_value(config: &RoundConfig, key: &str, default: f64) -> f64 {
        match config.get(key) {
            Some(Scalar::Float(value)) => *value,
            Some(Scalar::Int(value)) => *value as f64,
            _ => default,
        }
    }

    fn check_shapes(&self, parameters: &ParameterSet) -> Result<(), ClientError> {
        if parameters.same_shapes(&self.optimum) {
            Ok(())
        } else {
            Err(ClientError::Call(
                "parameter shapes do not match the local model".to_string(),
            ))
        }
    }
}

#[async_trait]
impl Client for LocalClient {
    fn id(&self) -> ClientId {
        self.id
    }

    async fn get_parameters(&self) -> Result<ParameterSet, ClientError> {
        // an untrained local model: all weights zero, shaped like the optimum
        Ok(self
            .optimum
            .iter()
            .map(|tensor| ndarray::ArrayD::zeros(tensor.raw_dim()))
            .collect())
    }

    async fn fit(
        &self,
        parameters: ParameterSet,
        config: RoundConfig,
    ) -> Result<FitResult, ClientError> {
        self.check_shapes(&parameters)?;
        let lr = Self::config_value(&config, "lr", 0.01);
        let epochs = Self::config_value(&config, "epochs", 1.0);
        let step = (lr * epochs).min(1.0) as f32;

        let updated: ParameterSet = parameters
            .iter()
            .zip(self.optimum.iter())
            .map(|(weights, optimum)| weights + &((optimum - weights) * step))
            .collect();

        let mut metrics = Metrics::new();
        metrics.insert("step".to_string(), Scalar::Float(step as f64));
        Ok(FitResult {
            parameters: updated,
            num_examples: self.num_examples,
            metrics,
        })
    }

    async fn evaluate(
        &self,
        parameters: ParameterSet,
        _config: RoundConfig,
    ) -> Result<EvaluateResult, ClientError> {
        self.check_shapes(&parameters)?;
        let mut squared = 0.0;
        let mut count = 0usize;
        for (weights, optimum) in parameters.iter().zip(self.optimum.iter()) {
            let diff = weights - optimum;
            squared += diff.iter().map(|value| (value * value) as f64).sum::<f64>();
            count += diff.len();
        }

        Ok(EvaluateResult {
            loss: squared / count as f64,
            num_examples: self.num_examples,
            metrics: Metrics::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use ndarray::{ArrayD, IxDyn};

    use super::*;

    fn set(values: &[f32]) -> ParameterSet {
        vec![ArrayD::from_shape_vec(IxDyn(&[values.len()]), values.to_vec()).unwrap()].into()
    }

    fn config(lr: f64, epochs: f64) -> RoundConfig {
        let mut config = RoundConfig::new();
        config.insert("lr".to_string(), Scalar::Float(lr));
        config.insert("epochs".to_string(), Scalar::Float(epochs));
        config
    }

    #[tokio::test]
    async fn test_fit_moves_toward_the_local_optimum() {
        let client = LocalClient::new(set(&[1.0, -1.0]), 10);

        let result = client
            .fit(set(&[0.0, 0.0]), config(0.5, 1.0))
            .await
            .unwrap();
        assert_eq!(result.parameters, set(&[0.5, -0.5]));
        assert_eq!(result.num_examples, 10);
    }

    #[tokio::test]
    async fn test_fit_rejects_foreign_shapes() {
        let client = LocalClient::new(set(&[1.0, -1.0]), 10);
        assert!(client.fit(set(&[0.0]), config(0.5, 1.0)).await.is_err());
    }

    #[tokio::test]
    async fn test_evaluate_reports_squared_distance() {
        let client = LocalClient::new(set(&[1.0, -1.0]), 10);

        let result = client
            .evaluate(set(&[0.0, 0.0]), RoundConfig::new())
            .await
            .unwrap();
        assert!((result.loss - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_get_parameters_is_zeroed() {
        let client = LocalClient::new(set(&[1.0, -1.0]), 10);
        let parameters = client.get_parameters().await.unwrap();
        assert_eq!(parameters, set(&[0.0, 0.0]));
    }
}
