//! Loading and validation of settings.
//!
//! Values defined in the configuration file can be overridden by environment
//! variables with the `FEDRA` prefix. An example configuration file lives in
//! the `configs/` directory at the repository root.

use std::{fmt, path::Path, time::Duration};

use config::{Config, ConfigError, Environment};
use serde::{
    de::{self, Deserializer, Visitor},
    Deserialize,
};
use thiserror::Error;
use tracing_subscriber::filter::EnvFilter;
use validator::{Validate, ValidationError, ValidationErrors};

#[derive(Error, Debug)]
/// An error related to loading and validation of settings.
pub enum SettingsError {
    #[error("configuration loading failed: {0}")]
    Loading(#[from] ConfigError),
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationErrors),
}

#[derive(Debug, Validate, Deserialize)]
/// The combined settings.
///
/// Each section in the configuration file corresponds to the identically
/// named settings field.
pub struct Settings {
    #[validate]
    pub round: RoundSettings,
    pub driver: DriverSettings,
    #[validate]
    pub simulation: SimulationSettings,
    pub log: LoggingSettings,
}

impl Settings {
    /// Loads and validates the settings via a configuration file.
    ///
    /// # Errors
    /// Fails when the loading of the configuration file or its validation failed.
    pub fn new(path: impl AsRef<Path>) -> Result<Self, SettingsError> {
        let settings: Settings = Self::load(path)?;
        settings.validate()?;
        Ok(settings)
    }

    fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let mut config = Config::new();
        config.merge(config::File::from(path.as_ref()))?;
        config.merge(Environment::with_prefix("fedra").separator("__"))?;
        config.try_into()
    }
}

/// Selection and quorum settings for a session.
///
/// Two thresholds apply to every selection: a per-round target (the sampled
/// fraction, floored by the per-round minimum) and the session-wide
/// availability floor below which selection fails.
#[derive(Debug, Validate, Deserialize, Clone, Copy)]
#[validate(schema(function = "validate_round"))]
pub struct RoundSettings {
    /// The fraction of available clients sampled for training each round.
    /// The value must be between `0` and `1`.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [round]
    /// fraction_fit = 0.3
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDRA_ROUND__FRACTION_FIT=0.3
    /// ```
    pub fraction_fit: f64,

    /// The fraction of available clients sampled for federated evaluation
    /// each round. `0` disables federated evaluation entirely.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [round]
    /// fraction_evaluate = 0.5
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDRA_ROUND__FRACTION_EVALUATE=0.5
    /// ```
    pub fraction_evaluate: f64,

    /// The minimal number of clients sampled for training, regardless of the
    /// fraction.
    pub min_fit_clients: u32,

    /// The minimal number of clients sampled for federated evaluation,
    /// regardless of the fraction.
    pub min_evaluate_clients: u32,

    /// The session-wide availability floor. A selection fails explicitly when
    /// fewer clients are connected.
    pub min_available_clients: u32,
}

impl RoundSettings {
    /// Checks the round settings.
    fn validate_round(&self) -> Result<(), ValidationError> {
        self.validate_fractions()?;
        self.validate_minimums()
    }

    // the validate attribute only accepts literals, therefore we check the
    // invariants here
    fn validate_fractions(&self) -> Result<(), ValidationError> {
        if 0. <= self.fraction_fit
            && self.fraction_fit <= 1.
            && 0. <= self.fraction_evaluate
            && self.fraction_evaluate <= 1.
        {
            Ok(())
        } else {
            Err(ValidationError::new("fraction outside of [0, 1]"))
        }
    }

    /// Checks that the availability floor covers the per-round minimums.
    fn validate_minimums(&self) -> Result<(), ValidationError> {
        if self.min_fit_clients >= 1
            && self.min_evaluate_clients >= 1
            && self.min_available_clients >= self.min_fit_clients
            && self.min_available_clients >= self.min_evaluate_clients
        {
            Ok(())
        } else {
            Err(ValidationError::new(
                "min_available_clients below a per-round minimum",
            ))
        }
    }
}

/// A wrapper for validate derive.
fn validate_round(s: &RoundSettings) -> Result<(), ValidationError> {
    s.validate_round()
}

/// Settings of the round-driving loop.
#[derive(Debug, Deserialize, Clone, Copy)]
pub struct DriverSettings {
    /// The number of federated rounds to run.
    pub num_rounds: u64,

    /// Per-call timeout for client dispatch, in seconds. A client that does
    /// not answer in time is recorded as a failure for that round. Leave this
    /// out to wait indefinitely.
    pub call_timeout_secs: Option<u64>,

    /// Seed for participant sampling. Leave this out for a random seed.
    pub seed: Option<u64>,
}

impl DriverSettings {
    pub fn call_timeout(&self) -> Option<Duration> {
        self.call_timeout_secs.map(Duration::from_secs)
    }
}

/// Settings of the in-process simulation harness.
#[derive(Debug, Validate, Deserialize, Clone, Copy)]
#[validate(schema(function = "validate_simulation"))]
pub struct SimulationSettings {
    /// The number of simulated clients to spawn.
    pub num_clients: u32,

    /// The number of weights of the simulated model.
    pub model_length: usize,
}

/// A wrapper for validate derive.
fn validate_simulation(s: &SimulationSettings) -> Result<(), ValidationError> {
    if s.num_clients >= 1 && s.model_length >= 1 {
        Ok(())
    } else {
        Err(ValidationError::new("empty simulation"))
    }
}

#[derive(Debug, Deserialize)]
/// Logging settings.
pub struct LoggingSettings {
    /// A comma-separated list of logging directives.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [log]
    /// filter = "info"
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDRA_LOG__FILTER=info
    /// ```
    #[serde(deserialize_with = "deserialize_env_filter")]
    pub filter: EnvFilter,
}

fn deserialize_env_filter<'de, D>(deserializer: D) -> Result<EnvFilter, D::Error>
where
    D: Deserializer<'de>,
{
    struct EnvFilterVisitor;

    impl<'de> Visitor<'de> for EnvFilterVisitor {
        type Value = EnvFilter;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            write!(formatter, "a comma-separated list of logging directives")
        }

        fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            EnvFilter::try_new(value)
                .map_err(|_| de::Error::invalid_value(serde::de::Unexpected::Str(value), &self))
        }
    }

    deserializer.deserialize_str(EnvFilterVisitor)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_settings() -> RoundSettings {
        RoundSettings {
            fraction_fit: 0.3,
            fraction_evaluate: 0.5,
            min_fit_clients: 2,
            min_evaluate_clients: 2,
            min_available_clients: 2,
        }
    }

    #[test]
    fn test_valid_round_settings() {
        assert!(round_settings().validate().is_ok());
    }

    #[test]
    fn test_fraction_out_of_range() {
        let settings = RoundSettings {
            fraction_fit: 1.5,
            ..round_settings()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_floor_below_per_round_minimum() {
        let settings = RoundSettings {
            min_fit_clients: 5,
            min_available_clients: 3,
            ..round_settings()
        };
        assert!(settings.validate().is_err());
    }
}
