//! The round coordinator: participant selection, per-round configuration
//! and result aggregation.
//!
//! A federated session is a sequence of rounds, each driven through the
//! [`Coordinator`] operations in a fixed order:
//!
//! 1. [`initialize_parameters`] - once, before round 1;
//! 2. [`configure_fit`] - select participants and pair each with the
//!    current global parameters and a per-group config;
//! 3. [`aggregate_fit`] - fold the collected results into the next global
//!    parameter set, weighted by sample counts;
//! 4. [`evaluate`] - optional centralized evaluation;
//! 5. [`configure_evaluate`] / [`aggregate_evaluate`] - the federated
//!    evaluation counterpart.
//!
//! The coordinator is synchronous and holds no locks: dispatching the
//! returned instructions and collecting results concurrently is the
//! driver's job. Per-client failures only shrink a round; structural
//! aggregation errors are surfaced to the driver.
//!
//! [`initialize_parameters`]: Coordinator::initialize_parameters
//! [`configure_fit`]: Coordinator::configure_fit
//! [`aggregate_fit`]: Coordinator::aggregate_fit
//! [`evaluate`]: Coordinator::evaluate
//! [`configure_evaluate`]: Coordinator::configure_evaluate
//! [`aggregate_evaluate`]: Coordinator::aggregate_evaluate

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
    aggregation::{weighted_average, weighted_scalar_average, AggregationError},
    client::{ClientFailure, ClientId, EvaluateResult, FitResult},
    model::ParameterSet,
    registry::ClientRegistry,
    round::{EvaluateInstruction, FitInstruction, Metrics, RoundConfig, Scalar},
    settings::RoundSettings,
};

/// The outcome of a centralized evaluation pass.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub loss: f64,
    pub metrics: Metrics,
}

/// A centralized evaluation hook, run against data external to all clients.
///
/// Returning `None` means "no centralized evaluation this round", which is
/// distinct from an evaluation that happens to report a zero loss.
pub type EvaluateFn = Box<dyn FnMut(u64, &ParameterSet) -> Option<Evaluation> + Send>;

/// Raised when a configuration assignment cannot cover a sample.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("a partitioned assignment needs at least one group")]
pub struct EmptyAssignment;

/// How fit configurations are assigned to a sampled client list.
///
/// The assignment is deterministic over the sampled ordering and
/// exhaustive: every sampled client ends up in exactly one group.
#[derive(Debug, Clone)]
pub enum ConfigAssignment {
    /// Every sampled client receives the same configuration.
    Uniform(RoundConfig),
    /// The sample is split into contiguous groups of equal share, one
    /// configuration per group. [`RoundCoordinator::with_fit_assignment`]
    /// rejects an assignment without any group.
    Partitioned(Vec<RoundConfig>),
}

impl ConfigAssignment {
    /// The configuration of the client at `index` of a sample of `total`.
    fn config_for(&self, index: usize, total: usize) -> &RoundConfig {
        match self {
            ConfigAssignment::Uniform(config) => config,
            ConfigAssignment::Partitioned(groups) => &groups[index * groups.len() / total],
        }
    }
}

/// One full federated round, as invoked by an external driver loop.
///
/// All operations are pure functions over their inputs plus the
/// coordinator's own stored state; none of them performs I/O.
pub trait Coordinator {
    /// Returns the starting global parameters, or `None` when the
    /// coordinator has no opinion and the driver should obtain initial
    /// parameters from an arbitrary available client. Called at most once,
    /// before round 1.
    fn initialize_parameters(&mut self) -> Option<ParameterSet>;

    /// Selects the training participants of `round` and pairs each with a
    /// clone of `parameters` and its group's configuration.
    ///
    /// Availability is re-queried from the registry on every call. When the
    /// quorum cannot be met the round is skipped: the returned list is
    /// empty, and the insufficiency is logged rather than raised.
    fn configure_fit(
        &mut self,
        round: u64,
        parameters: &ParameterSet,
        registry: &mut ClientRegistry,
    ) -> Vec<FitInstruction>;

    /// Folds the collected training results into the next global parameter
    /// set, weighted by each result's sample count.
    ///
    /// Failures reduce the effective participant count but never abort the
    /// aggregation; with no successful result at all the round produces no
    /// update and `(None, _)` is returned. Shape or weight inconsistencies
    /// across results are structural errors surfaced to the driver.
    fn aggregate_fit(
        &mut self,
        round: u64,
        results: Vec<(ClientId, FitResult)>,
        failures: &[ClientFailure],
    ) -> Result<(Option<ParameterSet>, Metrics), AggregationError>;

    /// Selects the evaluation participants of `round`. An evaluation
    /// fraction of exactly zero disables federated evaluation: the returned
    /// list is unconditionally empty.
    fn configure_evaluate(
        &mut self,
        round: u64,
        parameters: &ParameterSet,
        registry: &mut ClientRegistry,
    ) -> Vec<EvaluateInstruction>;

    /// Folds the collected evaluation results into a sample-count-weighted
    /// loss. With no successful result, `(None, _)` is returned.
    fn aggregate_evaluate(
        &mut self,
        round: u64,
        results: Vec<(ClientId, EvaluateResult)>,
        failures: &[ClientFailure],
    ) -> Result<(Option<f64>, Metrics), AggregationError>;

    /// Centralized evaluation of `parameters` against data external to all
    /// clients. `None` means no centralized evaluation for this round.
    fn evaluate(&mut self, round: u64, parameters: &ParameterSet) -> Option<Evaluation>;
}

/// The default [`Coordinator`]: fraction-based sampling with a session-wide
/// availability floor, deterministic per-group configuration and weighted
/// federated averaging.
pub struct RoundCoordinator {
    settings: RoundSettings,
    /// Parameters to hand out before round 1; consumed by
    /// `initialize_parameters`.
    initial: Option<ParameterSet>,
    /// The current global parameters, replaced once per round.
    global: Option<ParameterSet>,
    fit_assignment: ConfigAssignment,
    evaluate_config: RoundConfig,
    evaluate_fn: Option<EvaluateFn>,
}

impl RoundCoordinator {
    pub fn new(settings: RoundSettings) -> Self {
        Self {
            settings,
            initial: None,
            global: None,
            fit_assignment: ConfigAssignment::Uniform(RoundConfig::new()),
            evaluate_config: RoundConfig::new(),
            evaluate_fn: None,
        }
    }

    /// Seeds the session with server-side initial parameters.
    pub fn with_initial_parameters(mut self, parameters: ParameterSet) -> Self {
        self.initial = Some(parameters);
        self
    }

    /// Sets the per-group fit configuration rule.
    ///
    /// # Errors
    /// Fails when a partitioned assignment contains no group.
    pub fn with_fit_assignment(
        mut self,
        assignment: ConfigAssignment,
    ) -> Result<Self, EmptyAssignment> {
        if matches!(&assignment, ConfigAssignment::Partitioned(groups) if groups.is_empty()) {
            return Err(EmptyAssignment);
        }
        self.fit_assignment = assignment;
        Ok(self)
    }

    /// Sets the configuration dispatched with evaluation instructions.
    pub fn with_evaluate_config(mut self, config: RoundConfig) -> Self {
        self.evaluate_config = config;
        self
    }

    /// Installs a centralized evaluation hook.
    pub fn with_evaluate_fn(mut self, evaluate_fn: EvaluateFn) -> Self {
        self.evaluate_fn = Some(evaluate_fn);
        self
    }

    /// The current global parameters, if any round has produced an update
    /// or initial parameters were provided.
    pub fn global_parameters(&self) -> Option<&ParameterSet> {
        self.global.as_ref()
    }

    /// Returns the number of clients to sample for training and the quorum
    /// required for the selection to proceed.
    pub fn num_fit_clients(&self, available: u32) -> (u32, u32) {
        let target = (available as f64 * self.settings.fraction_fit) as u32;
        (
            target.max(self.settings.min_fit_clients),
            self.settings.min_available_clients,
        )
    }

    /// Returns the number of clients to sample for evaluation and the
    /// quorum required for the selection to proceed.
    pub fn num_evaluation_clients(&self, available: u32) -> (u32, u32) {
        let target = (available as f64 * self.settings.fraction_evaluate) as u32;
        (
            target.max(self.settings.min_evaluate_clients),
            self.settings.min_available_clients,
        )
    }

    fn round_config(&self, base: &RoundConfig, round: u64) -> RoundConfig {
        let mut config = base.clone();
        config.insert("round".to_string(), Scalar::Int(round as i64));
        config
    }
}

impl Coordinator for RoundCoordinator {
    fn initialize_parameters(&mut self) -> Option<ParameterSet> {
        let initial = self.initial.take();
        if let Some(parameters) = &initial {
            self.global = Some(parameters.clone());
        }
        initial
    }

    fn configure_fit(
        &mut self,
        round: u64,
        parameters: &ParameterSet,
        registry: &mut ClientRegistry,
    ) -> Vec<FitInstruction> {
        let available = registry.num_available();
        let (sample_size, required) = self.num_fit_clients(available);
        debug!(round, available, sample_size, "configuring fit");

        let sampled = match registry.sample(sample_size, required) {
            Ok(sampled) => sampled,
            Err(err) => {
                warn!(round, %err, "fit selection failed, skipping the round");
                return Vec::new();
            }
        };

        let total = sampled.len();
        sampled
            .into_iter()
            .enumerate()
            .map(|(index, client)| FitInstruction {
                client,
                parameters: parameters.clone(),
                config: self.round_config(self.fit_assignment.config_for(index, total), round),
            })
            .collect()
    }

    fn aggregate_fit(
        &mut self,
        round: u64,
        results: Vec<(ClientId, FitResult)>,
        failures: &[ClientFailure],
    ) -> Result<(Option<ParameterSet>, Metrics), AggregationError> {
        if !failures.is_empty() {
            warn!(round, failures = failures.len(), "fit round had failures");
        }
        if results.is_empty() {
            info!(round, "no fit results, keeping the previous global parameters");
            return Ok((None, Metrics::new()));
        }

        let weights: Vec<u64> = results
            .iter()
            .map(|(_, result)| result.num_examples)
            .collect();
        let sets: Vec<ParameterSet> = results
            .into_iter()
            .map(|(_, result)| result.parameters)
            .collect();
        let aggregated = weighted_average(&sets, &weights)?;
        self.global = Some(aggregated.clone());
        info!(round, results = sets.len(), "aggregated fit results");

        let mut metrics = Metrics::new();
        metrics.insert("num_results".to_string(), Scalar::Int(sets.len() as i64));
        metrics.insert(
            "num_failures".to_string(),
            Scalar::Int(failures.len() as i64),
        );
        Ok((Some(aggregated), metrics))
    }

    fn configure_evaluate(
        &mut self,
        round: u64,
        parameters: &ParameterSet,
        registry: &mut ClientRegistry,
    ) -> Vec<EvaluateInstruction> {
        if self.settings.fraction_evaluate == 0.0 {
            debug!(round, "federated evaluation is disabled");
            return Vec::new();
        }

        let available = registry.num_available();
        let (sample_size, required) = self.num_evaluation_clients(available);
        debug!(round, available, sample_size, "configuring evaluation");

        let sampled = match registry.sample(sample_size, required) {
            Ok(sampled) => sampled,
            Err(err) => {
                warn!(round, %err, "evaluation selection failed, skipping");
                return Vec::new();
            }
        };

        let config = self.round_config(&self.evaluate_config, round);
        sampled
            .into_iter()
            .map(|client| EvaluateInstruction {
                client,
                parameters: parameters.clone(),
                config: config.clone(),
            })
            .collect()
    }

    fn aggregate_evaluate(
        &mut self,
        round: u64,
        results: Vec<(ClientId, EvaluateResult)>,
        failures: &[ClientFailure],
    ) -> Result<(Option<f64>, Metrics), AggregationError> {
        if !failures.is_empty() {
            warn!(round, failures = failures.len(), "evaluation had failures");
        }
        if results.is_empty() {
            return Ok((None, Metrics::new()));
        }

        let pairs: Vec<(u64, f64)> = results
            .iter()
            .map(|(_, result)| (result.num_examples, result.loss))
            .collect();
        let loss = weighted_scalar_average(&pairs)?;

        let mut metrics = Metrics::new();
        metrics.insert("num_results".to_string(), Scalar::Int(pairs.len() as i64));
        metrics.insert(
            "num_failures".to_string(),
            Scalar::Int(failures.len() as i64),
        );
        Ok((Some(loss), metrics))
    }

    fn evaluate(&mut self, round: u64, parameters: &ParameterSet) -> Option<Evaluation> {
        let evaluate_fn = self.evaluate_fn.as_mut()?;
        evaluate_fn(round, parameters)
    }
}
