use std::{path::PathBuf, process, sync::Arc};

use ndarray::{ArrayD, IxDyn};
use structopt::StructOpt;
use tracing::info;

use fedra::{
    coordinator::{ConfigAssignment, RoundCoordinator},
    driver::Driver,
    model::ParameterSet,
    registry::ClientRegistry,
    round::{RoundConfig, Scalar},
    settings::Settings,
    simulation::LocalClient,
};

#[derive(Debug, StructOpt)]
#[structopt(name = "fedra")]
struct Opt {
    /// Path of the configuration file
    #[structopt(short, parse(from_os_str))]
    config_path: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opt = Opt::from_args();

    let settings = Settings::new(opt.config_path).unwrap_or_else(|err| {
        eprintln!("{}", err);
        process::exit(1);
    });
    let Settings {
        round: round_settings,
        driver: driver_settings,
        simulation: simulation_settings,
        log: log_settings,
    } = settings;

    tracing_subscriber::fmt()
        .with_env_filter(log_settings.filter)
        .init();

    let mut registry = match driver_settings.seed {
        Some(seed) => ClientRegistry::with_seed(seed),
        None => ClientRegistry::new(),
    };
    for index in 0..simulation_settings.num_clients {
        // spread the local optima out so the aggregate is non-trivial
        let target = index as f32 / simulation_settings.num_clients as f32 - 0.5;
        let optimum = ParameterSet::from(vec![ArrayD::from_elem(
            IxDyn(&[simulation_settings.model_length]),
            target,
        )]);
        let num_examples = 50 + 10 * u64::from(index);
        registry.register(Arc::new(LocalClient::new(optimum, num_examples)));
    }
    info!(
        clients = simulation_settings.num_clients,
        "simulated clients registered"
    );

    let mut low = RoundConfig::new();
    low.insert("lr".to_string(), Scalar::Float(0.001));
    low.insert("epochs".to_string(), Scalar::Float(2.0));
    let mut high = low.clone();
    high.insert("lr".to_string(), Scalar::Float(0.003));
    let mut evaluate_config = RoundConfig::new();
    evaluate_config.insert("split".to_string(), Scalar::from("test"));

    let initial = ParameterSet::from(vec![ArrayD::zeros(IxDyn(&[
        simulation_settings.model_length,
    ]))]);
    let coordinator = RoundCoordinator::new(round_settings)
        .with_initial_parameters(initial)
        .with_evaluate_config(evaluate_config)
        .with_fit_assignment(ConfigAssignment::Partitioned(vec![low, high]))?;

    let driver = Driver::new(coordinator, registry, driver_settings);
    let history = driver.run().await?;

    for (round, loss) in &history.losses_distributed {
        info!(round, loss, "distributed loss");
    }
    Ok(())
}
