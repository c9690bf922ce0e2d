//! The multi-round driving loop: concurrent dispatch, result collection
//! and round bookkeeping.
//!
//! The driver owns everything the coordinator deliberately does not:
//! parallelism, timeouts and the decision of what to do when a structural
//! error surfaces. Rounds run strictly one after another; round `N + 1`
//! never starts before round `N`'s aggregate is installed.

use std::time::Duration;

use futures::future::join_all;
use thiserror::Error;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::{
    aggregation::AggregationError,
    client::{ClientError, ClientFailure, ClientId, EvaluateResult, FitResult},
    coordinator::Coordinator,
    model::ParameterSet,
    registry::ClientRegistry,
    round::{EvaluateInstruction, FitInstruction, Metrics},
    settings::DriverSettings,
};

/// An error that ends a federated session.
#[derive(Error, Debug)]
pub enum DriverError {
    /// A structural aggregation failure. Per-client failures never end a
    /// session; inconsistent shapes or an all-zero weight do.
    #[error("aggregation failed in round {round}: {source}")]
    Aggregation {
        round: u64,
        #[source]
        source: AggregationError,
    },

    #[error("no initial parameters: the coordinator had no opinion and no client could provide any")]
    NoInitialParameters,
}

/// Per-round record of distributed and centralized results.
#[derive(Debug, Clone, Default)]
pub struct History {
    pub losses_distributed: Vec<(u64, f64)>,
    pub losses_centralized: Vec<(u64, f64)>,
    pub metrics_fit: Vec<(u64, Metrics)>,
    pub metrics_distributed: Vec<(u64, Metrics)>,
    pub metrics_centralized: Vec<(u64, Metrics)>,
}

/// Drives a [`Coordinator`] through a whole federated session.
pub struct Driver<C> {
    coordinator: C,
    registry: ClientRegistry,
    settings: DriverSettings,
}

impl<C> Driver<C>
where
    C: Coordinator,
{
    pub fn new(coordinator: C, registry: ClientRegistry, settings: DriverSettings) -> Self {
        Self {
            coordinator,
            registry,
            settings,
        }
    }

    /// The registry of connected participants. Clients may join or leave
    /// between rounds.
    pub fn registry_mut(&mut self) -> &mut ClientRegistry {
        &mut self.registry
    }

    /// Runs the full session and returns the collected history.
    pub async fn run(mut self) -> Result<History, DriverError> {
        let mut parameters = self.initial_parameters().await?;
        let mut history = History::default();

        for round in 1..=self.settings.num_rounds {
            info!(round, "starting round");
            parameters = self.fit_round(round, parameters, &mut history).await?;

            if let Some(evaluation) = self.coordinator.evaluate(round, &parameters) {
                info!(round, loss = evaluation.loss, "centralized evaluation");
                history.losses_centralized.push((round, evaluation.loss));
                history.metrics_centralized.push((round, evaluation.metrics));
            }

            self.evaluate_round(round, &parameters, &mut history).await?;
        }

        Ok(history)
    }

    async fn initial_parameters(&mut self) -> Result<ParameterSet, DriverError> {
        if let Some(parameters) = self.coordinator.initialize_parameters() {
            debug!("using the coordinator's initial parameters");
            return Ok(parameters);
        }

        // the coordinator has no opinion: ask an arbitrary connected client
        let sampled = self
            .registry
            .sample(1, 1)
            .map_err(|_| DriverError::NoInitialParameters)?;
        info!(client = %sampled[0].id(), "requesting initial parameters from a client");
        sampled[0]
            .get_parameters()
            .await
            .map_err(|_| DriverError::NoInitialParameters)
    }

    async fn fit_round(
        &mut self,
        round: u64,
        parameters: ParameterSet,
        history: &mut History,
    ) -> Result<ParameterSet, DriverError> {
        let instructions = self
            .coordinator
            .configure_fit(round, &parameters, &mut self.registry);
        if instructions.is_empty() {
            warn!(round, "no fit instructions, skipping the round");
            return Ok(parameters);
        }

        let (results, failures) = self.dispatch_fit(instructions).await;
        let (updated, metrics) = self
            .coordinator
            .aggregate_fit(round, results, &failures)
            .map_err(|source| DriverError::Aggregation { round, source })?;
        history.metrics_fit.push((round, metrics));
        Ok(updated.unwrap_or(parameters))
    }

    async fn evaluate_round(
        &mut self,
        round: u64,
        parameters: &ParameterSet,
        history: &mut History,
    ) -> Result<(), DriverError> {
        let instructions = self
            .coordinator
            .configure_evaluate(round, parameters, &mut self.registry);
        if instructions.is_empty() {
            return Ok(());
        }

        let (results, failures) = self.dispatch_evaluate(instructions).await;
        let (loss, metrics) = self
            .coordinator
            .aggregate_evaluate(round, results, &failures)
            .map_err(|source| DriverError::Aggregation { round, source })?;
        if let Some(loss) = loss {
            info!(round, loss, "federated evaluation");
            history.losses_distributed.push((round, loss));
        }
        history.metrics_distributed.push((round, metrics));
        Ok(())
    }

    async fn dispatch_fit(
        &self,
        instructions: Vec<FitInstruction>,
    ) -> (Vec<(ClientId, FitResult)>, Vec<ClientFailure>) {
        let limit = self.settings.call_timeout();
        let calls = instructions.into_iter().map(|instruction| async move {
            let FitInstruction {
                client,
                parameters,
                config,
            } = instruction;
            let id = client.id();
            (id, with_timeout(limit, client.fit(parameters, config)).await)
        });
        partition(join_all(calls).await)
    }

    async fn dispatch_evaluate(
        &self,
        instructions: Vec<EvaluateInstruction>,
    ) -> (Vec<(ClientId, EvaluateResult)>, Vec<ClientFailure>) {
        let limit = self.settings.call_timeout();
        let calls = instructions.into_iter().map(|instruction| async move {
            let EvaluateInstruction {
                client,
                parameters,
                config,
            } = instruction;
            let id = client.id();
            (id, with_timeout(limit, client.evaluate(parameters, config)).await)
        });
        partition(join_all(calls).await)
    }
}

async fn with_timeout<T>(
    limit: Option<Duration>,
    call: impl std::future::Future<Output = Result<T, ClientError>>,
) -> Result<T, ClientError> {
    match limit {
        Some(limit) => match timeout(limit, call).await {
            Ok(outcome) => outcome,
            Err(_) => Err(ClientError::Timeout),
        },
        None => call.await,
    }
}

/// Splits collected outcomes into successes and tagged failures.
fn partition<T>(
    outcomes: Vec<(ClientId, Result<T, ClientError>)>,
) -> (Vec<(ClientId, T)>, Vec<ClientFailure>) {
    let mut results = Vec::new();
    let mut failures = Vec::new();
    for (client, outcome) in outcomes {
        match outcome {
            Ok(result) => results.push((client, result)),
            Err(error) => {
                warn!(%client, %error, "client call failed");
                failures.push(ClientFailure { client, error });
            }
        }
    }
    (results, failures)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use ndarray::{ArrayD, IxDyn};

    use super::*;
    use crate::{
        coordinator::RoundCoordinator,
        settings::RoundSettings,
        simulation::LocalClient,
    };

    fn round_settings() -> RoundSettings {
        RoundSettings {
            fraction_fit: 1.0,
            fraction_evaluate: 1.0,
            min_fit_clients: 2,
            min_evaluate_clients: 2,
            min_available_clients: 2,
        }
    }

    fn driver_settings(num_rounds: u64) -> DriverSettings {
        DriverSettings {
            num_rounds,
            call_timeout_secs: None,
            seed: Some(11),
        }
    }

    fn optimum(value: f32) -> ParameterSet {
        vec![ArrayD::from_elem(IxDyn(&[4]), value)].into()
    }

    fn registry() -> ClientRegistry {
        let mut registry = ClientRegistry::with_seed(11);
        registry.register(Arc::new(LocalClient::new(optimum(1.0), 10)));
        registry.register(Arc::new(LocalClient::new(optimum(-1.0), 30)));
        registry
    }

    #[tokio::test]
    async fn test_session_records_every_round() {
        let coordinator =
            RoundCoordinator::new(round_settings()).with_initial_parameters(optimum(0.0));
        let driver = Driver::new(coordinator, registry(), driver_settings(3));

        let history = driver.run().await.unwrap();
        assert_eq!(history.metrics_fit.len(), 3);
        assert_eq!(history.losses_distributed.len(), 3);
        assert!(history.losses_centralized.is_empty());
    }

    #[tokio::test]
    async fn test_initial_parameters_fall_back_to_a_client() {
        // no server-side initial parameters: the driver must fetch them
        // from one of the connected clients
        let coordinator = RoundCoordinator::new(round_settings());
        let driver = Driver::new(coordinator, registry(), driver_settings(1));

        let history = driver.run().await.unwrap();
        assert_eq!(history.metrics_fit.len(), 1);
    }

    #[tokio::test]
    async fn test_session_without_clients_cannot_start() {
        let coordinator = RoundCoordinator::new(round_settings());
        let driver = Driver::new(
            coordinator,
            ClientRegistry::with_seed(11),
            driver_settings(1),
        );

        assert!(matches!(
            driver.run().await,
            Err(DriverError::NoInitialParameters)
        ));
    }
}
