//! Analysis configuration, grouped per engine and read from TOML. Every key
//! is optional; missing keys take the defaults.

use crate::bootstrap::{BootstrapConfig, BootstrapError};
use crate::dca::{DecisionCurveError, ThresholdGrid};
use crate::model::GeeConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read or write configuration file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse TOML configuration file: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Failed to serialize configuration to TOML format: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
    #[error("Invalid GEE settings: {0}")]
    InvalidGee(String),
    #[error("Invalid bootstrap settings: {0}")]
    InvalidBootstrap(#[from] BootstrapError),
    #[error("Invalid decision-curve settings: {0}")]
    InvalidDecisionCurve(#[from] DecisionCurveError),
}

/// Threshold grid of the decision-curve analysis.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DcaConfig {
    pub threshold_min: f64,
    pub threshold_max: f64,
    pub n_thresholds: usize,
}

impl Default for DcaConfig {
    fn default() -> Self {
        Self {
            threshold_min: 0.05,
            threshold_max: 0.25,
            n_thresholds: 50,
        }
    }
}

impl DcaConfig {
    pub fn grid(&self) -> Result<ThresholdGrid, DecisionCurveError> {
        ThresholdGrid::linspace(self.threshold_min, self.threshold_max, self.n_thresholds)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    pub gee: GeeConfig,
    pub bootstrap: BootstrapConfig,
    pub dca: DcaConfig,
}

impl AnalysisConfig {
    /// Reads and validates a configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let toml_string = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&toml_string)?;
        config.validate()?;
        log::info!("Loaded analysis configuration from {}", path.display());
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let toml_string = toml::to_string_pretty(self)?;
        std::fs::write(path, toml_string)?;
        Ok(())
    }

    /// Checks every setting before any computation starts.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.gee.tolerance.is_finite() && self.gee.tolerance > 0.0) {
            return Err(ConfigError::InvalidGee(format!(
                "tolerance must be a positive number, got {}",
                self.gee.tolerance
            )));
        }
        if self.gee.max_iterations == 0 {
            return Err(ConfigError::InvalidGee(
                "max_iterations must be at least 1".to_string(),
            ));
        }
        self.bootstrap.validate()?;
        self.dca.grid()?;
        Ok(())
    }
}
