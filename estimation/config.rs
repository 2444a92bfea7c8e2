//! # Estimation Settings
//!
//! Every knob of `feols`/`fepois` lives in [`EstimationConfig`]. The struct is
//! plain serde data: it can be built in code, read from a TOML file, and is
//! validated once, up front, before any numeric work starts.

use crate::inference::ssc::SscConfig;
use crate::inference::vcov::VcovType;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

/// Errors raised while validating or loading configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Unknown option '{value}' for '{argument}'. Expected one of: {expected}.")]
    UnknownOption {
        argument: &'static str,
        value: String,
        expected: &'static str,
    },

    #[error("Invalid value {value} for '{argument}': {requirement}.")]
    RangeViolation {
        argument: &'static str,
        value: String,
        requirement: &'static str,
    },

    #[error("Failed to parse configuration: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Failed to serialize configuration: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// What to do with fixed-effect levels observed only once.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FixefRemoval {
    #[default]
    None,
    Singleton,
}

impl FromStr for FixefRemoval {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(FixefRemoval::None),
            "singleton" => Ok(FixefRemoval::Singleton),
            other => Err(ConfigError::UnknownOption {
                argument: "fixef_rm",
                value: other.to_string(),
                expected: "none, singleton",
            }),
        }
    }
}

/// How observation weights enter the estimator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum WeightsType {
    /// Precision weights: observation `i` has error variance proportional to `1 / w_i`.
    #[default]
    #[serde(rename = "aweights")]
    Analytic,
    /// Frequency weights: observation `i` stands for `w_i` identical rows.
    #[serde(rename = "fweights")]
    Frequency,
}

impl FromStr for WeightsType {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "aweights" => Ok(WeightsType::Analytic),
            "fweights" => Ok(WeightsType::Frequency),
            other => Err(ConfigError::UnknownOption {
                argument: "weights_type",
                value: other.to_string(),
                expected: "aweights, fweights",
            }),
        }
    }
}

impl fmt::Display for WeightsType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WeightsType::Analytic => f.write_str("aweights"),
            WeightsType::Frequency => f.write_str("fweights"),
        }
    }
}

/// Settings shared by every model of one `feols`/`fepois` call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EstimationConfig {
    /// Covariance estimator, e.g. `"iid"`, `"hetero"`, `"CRV1:f1+f2"`. When
    /// unset, models without fixed effects use iid errors and models with
    /// fixed effects cluster by the first one.
    pub vcov: Option<String>,
    /// Name of the column holding observation weights.
    pub weights: Option<String>,
    pub weights_type: WeightsType,
    pub fixef_rm: FixefRemoval,
    pub fixef_tol: f64,
    pub fixef_maxiter: usize,
    pub collin_tol: f64,
    pub drop_intercept: bool,
    pub iwls_tol: f64,
    pub iwls_maxiter: usize,
    /// Fit OLS on sufficient statistics of identical regressor rows.
    pub use_compression: bool,
    /// Turn non-convergence warnings into errors.
    pub strict: bool,
    /// Small-sample corrections; kept last so it serializes as a trailing table.
    pub ssc: SscConfig,
}

impl Default for EstimationConfig {
    fn default() -> Self {
        Self {
            vcov: None,
            weights: None,
            weights_type: WeightsType::Analytic,
            fixef_rm: FixefRemoval::None,
            fixef_tol: 1e-8,
            fixef_maxiter: 100_000,
            collin_tol: 1e-10,
            drop_intercept: false,
            iwls_tol: 1e-8,
            iwls_maxiter: 25,
            use_compression: false,
            strict: false,
            ssc: SscConfig::default(),
        }
    }
}

fn open_unit_interval(argument: &'static str, value: f64) -> Result<(), ConfigError> {
    if value > 0.0 && value < 1.0 {
        Ok(())
    } else {
        Err(ConfigError::RangeViolation {
            argument,
            value: value.to_string(),
            requirement: "must be strictly between 0 and 1",
        })
    }
}

fn positive(argument: &'static str, value: usize) -> Result<(), ConfigError> {
    if value > 0 {
        Ok(())
    } else {
        Err(ConfigError::RangeViolation {
            argument,
            value: value.to_string(),
            requirement: "must be at least 1",
        })
    }
}

impl EstimationConfig {
    /// Checks every tolerance and option string.
    pub fn validate(&self) -> Result<(), ConfigError> {
        open_unit_interval("fixef_tol", self.fixef_tol)?;
        open_unit_interval("collin_tol", self.collin_tol)?;
        open_unit_interval("iwls_tol", self.iwls_tol)?;
        positive("fixef_maxiter", self.fixef_maxiter)?;
        positive("iwls_maxiter", self.iwls_maxiter)?;
        self.vcov_type()?;
        Ok(())
    }

    /// The requested covariance estimator, if any.
    pub fn vcov_type(&self) -> Result<Option<VcovType>, ConfigError> {
        self.vcov.as_deref().map(str::parse).transpose()
    }

    pub fn with_vcov(mut self, vcov: &str) -> Self {
        self.vcov = Some(vcov.to_string());
        self
    }

    pub fn with_weights(mut self, column: &str, weights_type: WeightsType) -> Self {
        self.weights = Some(column.to_string());
        self.weights_type = weights_type;
        self
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        std::fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }
}
