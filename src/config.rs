//! Global configuration for the shrike CLI and engine defaults.

use crate::circuit::CircuitBreakerConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Layered configuration: defaults, then `shrike.yaml` (current
/// directory or `~/.config/shrike/`), then `SHRIKE__*` environment
/// variables. Command-line arguments override everything.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ShrikeConfig {
    #[serde(default)]
    pub engine: EngineSettings,
    #[serde(default)]
    pub run: RunSettings,
}

/// Engine tuning knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSettings {
    /// Cap on concurrently running tasks per execution.
    pub parallelism: usize,

    /// Live event stream buffer size.
    pub event_buffer_size: usize,

    /// Multiple of the layer-median task duration past which an
    /// anomaly event is raised.
    pub anomaly_factor: f64,

    /// Failures within the window before a service's circuit opens.
    pub circuit_failure_threshold: u32,

    /// Failure counting window, in milliseconds.
    pub circuit_window_ms: u64,

    /// How long an open circuit rejects traffic before probing again,
    /// in milliseconds.
    pub circuit_cool_off_ms: u64,

    /// Consecutive successes needed to close a half-open circuit.
    pub circuit_half_open_successes: u32,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            parallelism: 50,
            event_buffer_size: 1024,
            anomaly_factor: 3.0,
            circuit_failure_threshold: 5,
            circuit_window_ms: 30_000,
            circuit_cool_off_ms: 10_000,
            circuit_half_open_successes: 2,
        }
    }
}

/// Defaults for the `run` command.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RunSettings {
    /// Enable verbose output.
    #[serde(default)]
    pub verbose: bool,

    /// Print the execution trace after every run.
    #[serde(default)]
    pub trace: bool,

    /// Default workflow timeout, as a duration string.
    pub timeout: Option<String>,
}

impl ShrikeConfig {
    /// Load configuration from file, environment, and defaults.
    pub fn load() -> Result<Self, config::ConfigError> {
        let builder = config::Config::builder()
            .add_source(config::Config::try_from(&ShrikeConfig::default())?)
            .add_source(
                config::File::with_name("shrike")
                    .format(config::FileFormat::Yaml)
                    .required(false),
            )
            .add_source(
                config::File::with_name(&format!(
                    "{}/.config/shrike/shrike",
                    std::env::var("HOME").unwrap_or_else(|_| ".".to_string())
                ))
                .format(config::FileFormat::Yaml)
                .required(false),
            )
            .add_source(
                config::Environment::with_prefix("SHRIKE")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    /// Circuit-breaker configuration derived from the engine settings.
    #[must_use]
    pub fn circuit_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.engine.circuit_failure_threshold,
            window: Duration::from_millis(self.engine.circuit_window_ms),
            cool_off: Duration::from_millis(self.engine.circuit_cool_off_ms),
            half_open_successes: self.engine.circuit_half_open_successes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ShrikeConfig::default();
        assert_eq!(config.engine.parallelism, 50);
        assert_eq!(config.engine.circuit_failure_threshold, 5);
        assert!(!config.run.trace);
    }

    #[test]
    fn test_circuit_config_derivation() {
        let config = ShrikeConfig::default();
        let circuit = config.circuit_config();
        assert_eq!(circuit.failure_threshold, 5);
        assert_eq!(circuit.cool_off, Duration::from_secs(10));
    }
}
