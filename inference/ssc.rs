//! Small-sample corrections applied on top of every covariance estimator.

use crate::fixef::FixedEffects;
use serde::{Deserialize, Serialize};

/// How absorbed fixed effects count towards the number of parameters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FixefK {
    /// Fixed effects are not counted.
    #[default]
    None,
    /// Every absorbed level counts, less the redundant ones.
    Full,
    /// Like `Full`, but effects nested inside a clustering variable are free.
    Nested,
}

/// Which number of clusters enters the cluster adjustment of a multiway term.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClusterDf {
    /// The smallest number of clusters among the clustering variables.
    #[default]
    Min,
    /// Each term uses its own number of clusters.
    Conventional,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SscConfig {
    /// Multiply by `(N - 1) / (N - K)`.
    pub adj: bool,
    pub fixef_k: FixefK,
    /// Multiply cluster-robust estimators by `G / (G - 1)`.
    pub cluster_adj: bool,
    pub cluster_df: ClusterDf,
}

impl Default for SscConfig {
    fn default() -> Self {
        Self {
            adj: true,
            fixef_k: FixefK::None,
            cluster_adj: true,
            cluster_df: ClusterDf::Min,
        }
    }
}

impl SscConfig {
    /// No corrections at all.
    pub fn none() -> Self {
        Self {
            adj: false,
            fixef_k: FixefK::None,
            cluster_adj: false,
            cluster_df: ClusterDf::Conventional,
        }
    }

    /// Parameters attributed to the fixed effects under this configuration.
    pub fn fixef_dof(&self, fixef: Option<&FixedEffects>, clusters: &[&[usize]]) -> usize {
        match (self.fixef_k, fixef) {
            (FixefK::None, _) | (_, None) => 0,
            (FixefK::Full, Some(fe)) => fe.dof(),
            (FixefK::Nested, Some(fe)) => fe.dof_excluding_nested(clusters),
        }
    }

    /// The `(N - 1) / (N - K)` factor, or one when disabled.
    pub fn adjustment(&self, nobs: f64, n_params: usize) -> f64 {
        if self.adj {
            (nobs - 1.0) / (nobs - n_params as f64)
        } else {
            1.0
        }
    }

    /// The `G / (G - 1)` factor, or one when disabled.
    pub fn cluster_adjustment(&self, groups: usize) -> f64 {
        if self.cluster_adj {
            let g = groups as f64;
            g / (g - 1.0)
        } else {
            1.0
        }
    }
}
