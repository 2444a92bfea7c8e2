//! # Covariance Estimators
//!
//! Every estimator here is a function of the same few pieces of a fit: the
//! bread `(X'WX)^-1`, the weighted score regressors, the weighted working
//! residuals and the sample bookkeeping needed for small-sample corrections.
//! Fits store those pieces, so switching estimators after estimation never
//! refits the model.
//!
//! - `iid`: `adj * sigma^2 * bread` with `sigma^2 = SSR / (N - 1)`.
//! - `HC1`: `adj * bread * meat * bread` with per-observation scores.
//! - `HC2`/`HC3`: leverage-corrected residuals, no degrees-of-freedom factor.
//! - `CRV1`: cluster-summed scores; multiway clustering by inclusion-exclusion.
//! - `CRV3`: leave-one-cluster-out jackknife of the coefficients.

use crate::compression::CompressedMoments;
use crate::config::{ConfigError, WeightsType};
use crate::estimate::EstimationError;
use crate::fixef::{FixedEffects, factorize};
use crate::inference::distributions::Reference;
use crate::inference::ssc::{ClusterDf, SscConfig};
use crate::model::ModelFamily;
use itertools::Itertools;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use ndarray_linalg::Solve;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Flavours of heteroskedasticity-robust estimators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HeteroKind {
    Hc1,
    Hc2,
    Hc3,
}

/// A requested covariance estimator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VcovType {
    Iid,
    Hetero(HeteroKind),
    /// Cluster-robust by one or more (possibly interacted) variables.
    Crv1(Vec<String>),
    /// Jackknife cluster-robust by one variable.
    Crv3(String),
}

impl VcovType {
    pub fn crv1(clusters: &[&str]) -> Self {
        VcovType::Crv1(clusters.iter().map(|c| c.to_string()).collect())
    }

    /// Clustering variables, as written (`f1`, `f1^f2`).
    pub fn cluster_names(&self) -> Vec<String> {
        match self {
            VcovType::Crv1(names) => names.clone(),
            VcovType::Crv3(name) => vec![name.clone()],
            VcovType::Iid | VcovType::Hetero(_) => Vec::new(),
        }
    }

    pub fn is_clustered(&self) -> bool {
        matches!(self, VcovType::Crv1(_) | VcovType::Crv3(_))
    }
}

impl fmt::Display for VcovType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VcovType::Iid => f.write_str("iid"),
            VcovType::Hetero(HeteroKind::Hc1) => f.write_str("hetero"),
            VcovType::Hetero(HeteroKind::Hc2) => f.write_str("HC2"),
            VcovType::Hetero(HeteroKind::Hc3) => f.write_str("HC3"),
            VcovType::Crv1(names) => write!(f, "CRV1:{}", names.join("+")),
            VcovType::Crv3(name) => write!(f, "CRV3:{name}"),
        }
    }
}

impl FromStr for VcovType {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let unknown = || ConfigError::UnknownOption {
            argument: "vcov",
            value: s.to_string(),
            expected: "iid, hetero, HC1, HC2, HC3, CRV1:<clusters>, CRV3:<cluster>",
        };
        let trimmed = s.trim();
        let (kind, clusters) = match trimmed.split_once(':') {
            Some((kind, clusters)) => (kind.trim(), Some(clusters)),
            None => (trimmed, None),
        };
        let names: Vec<String> = clusters
            .map(|c| {
                c.split('+')
                    .map(|name| name.trim().to_string())
                    .filter(|name| !name.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        match (kind, names.len()) {
            ("iid", 0) => Ok(VcovType::Iid),
            ("hetero" | "HC1", 0) => Ok(VcovType::Hetero(HeteroKind::Hc1)),
            ("HC2", 0) => Ok(VcovType::Hetero(HeteroKind::Hc2)),
            ("HC3", 0) => Ok(VcovType::Hetero(HeteroKind::Hc3)),
            ("CRV1", n) if n > 0 => Ok(VcovType::Crv1(names)),
            ("CRV3", 1) => Ok(VcovType::Crv3(names[0].clone())),
            _ => Err(unknown()),
        }
    }
}

/// Dense cluster codes of one clustering variable on the estimation sample.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterVar {
    pub name: String,
    pub ids: Vec<usize>,
    pub n_groups: usize,
}

impl ClusterVar {
    pub fn from_labels<K: Eq + std::hash::Hash>(name: &str, labels: Vec<K>) -> Self {
        let (ids, n_groups) = factorize(labels);
        Self {
            name: name.to_string(),
            ids,
            n_groups,
        }
    }

    /// The clustering by all combinations of the given variables.
    pub fn intersect(vars: &[&ClusterVar]) -> Self {
        let n = vars.first().map_or(0, |v| v.ids.len());
        let keys: Vec<Vec<usize>> = (0..n)
            .map(|i| vars.iter().map(|v| v.ids[i]).collect())
            .collect();
        let name = vars.iter().map(|v| v.name.as_str()).join("^");
        Self::from_labels(&name, keys)
    }
}

/// A covariance matrix together with what is needed to use it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vcov {
    pub kind: VcovType,
    pub matrix: Array2<f64>,
    /// Degrees of freedom of the t reference distribution.
    pub df_t: f64,
    /// Number of clusters per clustering variable, empty when unclustered.
    pub cluster_groups: Vec<usize>,
    pub normal_reference: bool,
}

impl Vcov {
    pub fn reference(&self) -> Reference {
        if self.normal_reference {
            Reference::StandardNormal
        } else {
            Reference::StudentT(self.df_t)
        }
    }

    pub fn standard_errors(&self) -> Array1<f64> {
        self.matrix.diag().mapv(f64::sqrt)
    }
}

/// The pieces of a fit every covariance estimator consumes.
#[derive(Debug, Clone, Copy)]
pub(crate) struct VcovInputs<'a> {
    pub family: ModelFamily,
    pub bread: ArrayView2<'a, f64>,
    /// Weighted score regressors: `sqrt(w) * X` (projected for IV).
    pub scores_x: ArrayView2<'a, f64>,
    /// Weighted working residuals.
    pub residuals: ArrayView1<'a, f64>,
    /// Weighted demeaned outcome, needed by the jackknife. Least squares only.
    pub outcome: Option<ArrayView1<'a, f64>>,
    pub prior_weights: ArrayView1<'a, f64>,
    pub weights_type: WeightsType,
    pub weighted: bool,
    pub nobs: f64,
    /// Number of estimated slope coefficients, which may exceed the bread
    /// dimension for partialled-out fits.
    pub n_coef: usize,
    pub fixef: Option<&'a FixedEffects>,
    pub compressed: Option<&'a CompressedMoments>,
}

/// Rejects estimator/model combinations that have no valid formula.
pub(crate) fn check_support(
    kind: &VcovType,
    family: ModelFamily,
    has_fixef: bool,
    compressed: bool,
    frequency_weights: bool,
) -> Result<(), EstimationError> {
    let reject = |reason: &str| -> Result<(), EstimationError> {
        Err(EstimationError::NotSupported(format!("{kind}: {reason}")))
    };
    match kind {
        VcovType::Hetero(HeteroKind::Hc2 | HeteroKind::Hc3) => {
            if has_fixef {
                return reject("leverage corrections are not available with fixed effects");
            }
            if family != ModelFamily::Ols {
                return reject("leverage corrections are only available for least squares");
            }
            if compressed || frequency_weights {
                return reject("leverage corrections need one row per observation");
            }
        }
        VcovType::Crv1(_) if compressed => {
            return reject("clustered errors cannot be computed from compressed data");
        }
        VcovType::Crv3(_) => {
            if family != ModelFamily::Ols {
                return reject("the jackknife is only available for least squares");
            }
            if compressed {
                return reject("clustered errors cannot be computed from compressed data");
            }
        }
        _ => {}
    }
    Ok(())
}

/// Computes the requested covariance from fit inputs and resolved clusters.
pub(crate) fn compute_vcov(
    inputs: &VcovInputs,
    kind: &VcovType,
    clusters: &[ClusterVar],
    ssc: &SscConfig,
) -> Result<Vcov, EstimationError> {
    check_support(
        kind,
        inputs.family,
        inputs.fixef.is_some(),
        inputs.compressed.is_some(),
        inputs.weighted && inputs.weights_type == WeightsType::Frequency,
    )?;

    let normal_reference = inputs.family == ModelFamily::Poisson;
    let (matrix, df_t, cluster_groups) = match kind {
        VcovType::Iid => {
            let (matrix, df) = iid(inputs, ssc);
            (matrix, df, Vec::new())
        }
        VcovType::Hetero(hc) => {
            let (matrix, df) = hetero(inputs, *hc, ssc);
            (matrix, df, Vec::new())
        }
        VcovType::Crv1(_) => crv1(inputs, clusters, ssc)?,
        VcovType::Crv3(_) => crv3(inputs, clusters, ssc)?,
    };

    Ok(Vcov {
        kind: kind.clone(),
        matrix,
        df_t,
        cluster_groups,
        normal_reference,
    })
}

fn sandwich(bread: ArrayView2<f64>, meat: &Array2<f64>) -> Array2<f64> {
    bread.dot(meat).dot(&bread)
}

/// Per-observation scores `s_i = x_i * u_i`.
fn scores(inputs: &VcovInputs) -> Array2<f64> {
    let mut scores = inputs.scores_x.to_owned();
    for (mut row, &u) in scores.axis_iter_mut(Axis(0)).zip(inputs.residuals.iter()) {
        row *= u;
    }
    scores
}

fn residual_sum_of_squares(inputs: &VcovInputs) -> f64 {
    match inputs.compressed {
        Some(moments) => moments.rss.sum(),
        None => inputs.residuals.dot(&inputs.residuals),
    }
}

fn iid(inputs: &VcovInputs, ssc: &SscConfig) -> (Array2<f64>, f64) {
    let n_params = inputs.n_coef + ssc.fixef_dof(inputs.fixef, &[]);
    let sigma2 = match inputs.family {
        ModelFamily::Poisson => 1.0,
        ModelFamily::Ols | ModelFamily::Iv => residual_sum_of_squares(inputs) / (inputs.nobs - 1.0),
    };
    let factor = ssc.adjustment(inputs.nobs, n_params) * sigma2;
    (
        inputs.bread.mapv(|b| b * factor),
        inputs.nobs - n_params as f64,
    )
}

fn hetero(inputs: &VcovInputs, hc: HeteroKind, ssc: &SscConfig) -> (Array2<f64>, f64) {
    let n_params = inputs.n_coef + ssc.fixef_dof(inputs.fixef, &[]);
    let df = inputs.nobs - n_params as f64;

    if let Some(moments) = inputs.compressed {
        let mut weighted = moments.x.clone();
        for (mut row, &rss) in weighted.axis_iter_mut(Axis(0)).zip(moments.rss.iter()) {
            row *= rss;
        }
        let meat = moments.x.t().dot(&weighted);
        let factor = ssc.adjustment(inputs.nobs, n_params);
        return (sandwich(inputs.bread, &meat).mapv(|v| v * factor), df);
    }

    let mut s = scores(inputs);
    let factor = match hc {
        HeteroKind::Hc1 => {
            if inputs.weighted && inputs.weights_type == WeightsType::Frequency {
                for (mut row, &w) in s.axis_iter_mut(Axis(0)).zip(inputs.prior_weights.iter()) {
                    if w > 0.0 {
                        row /= w.sqrt();
                    }
                }
            }
            ssc.adjustment(inputs.nobs, n_params)
        }
        HeteroKind::Hc2 | HeteroKind::Hc3 => {
            let leverage = (inputs.scores_x.dot(&inputs.bread) * inputs.scores_x).sum_axis(Axis(1));
            for (mut row, &h) in s.axis_iter_mut(Axis(0)).zip(leverage.iter()) {
                let scale = match hc {
                    HeteroKind::Hc2 => (1.0 - h).sqrt(),
                    _ => 1.0 - h,
                };
                row /= scale;
            }
            1.0
        }
    };
    let meat = s.t().dot(&s);
    (sandwich(inputs.bread, &meat).mapv(|v| v * factor), df)
}

fn require_clusters(clusters: &[ClusterVar], expected: usize) -> Result<(), EstimationError> {
    if clusters.len() < expected {
        return Err(EstimationError::NotSupported(format!(
            "expected {expected} clustering variable(s), found {}",
            clusters.len()
        )));
    }
    for var in clusters {
        if var.n_groups < 2 {
            return Err(EstimationError::TooFewClusters {
                name: var.name.clone(),
                found: var.n_groups,
            });
        }
    }
    Ok(())
}

/// `sum_g s_g s_g'` with scores summed within each cluster.
fn cluster_meat(s: &Array2<f64>, ids: &[usize], n_groups: usize) -> Array2<f64> {
    let mut sums = Array2::<f64>::zeros((n_groups, s.ncols()));
    for (row, &g) in s.axis_iter(Axis(0)).zip(ids) {
        let mut target = sums.row_mut(g);
        target += &row;
    }
    sums.t().dot(&sums)
}

fn crv1(
    inputs: &VcovInputs,
    clusters: &[ClusterVar],
    ssc: &SscConfig,
) -> Result<(Array2<f64>, f64, Vec<usize>), EstimationError> {
    require_clusters(clusters, 1)?;
    let base_ids: Vec<&[usize]> = clusters.iter().map(|c| c.ids.as_slice()).collect();
    let n_params = inputs.n_coef + ssc.fixef_dof(inputs.fixef, &base_ids);
    let adj = ssc.adjustment(inputs.nobs, n_params);
    let min_groups = clusters.iter().map(|c| c.n_groups).min().unwrap_or(0);

    let s = scores(inputs);
    let k = inputs.bread.nrows();
    let mut matrix = Array2::<f64>::zeros((k, k));
    for size in 1..=clusters.len() {
        let sign = if size % 2 == 1 { 1.0 } else { -1.0 };
        for subset in (0..clusters.len()).combinations(size) {
            let members: Vec<&ClusterVar> = subset.iter().map(|&i| &clusters[i]).collect();
            let var = if size == 1 {
                members[0].clone()
            } else {
                ClusterVar::intersect(&members)
            };
            let groups = match ssc.cluster_df {
                ClusterDf::Min => min_groups,
                ClusterDf::Conventional => var.n_groups,
            };
            let factor = sign * adj * ssc.cluster_adjustment(groups);
            let meat = cluster_meat(&s, &var.ids, var.n_groups);
            matrix.scaled_add(factor, &sandwich(inputs.bread, &meat));
        }
    }

    let groups = clusters.iter().map(|c| c.n_groups).collect();
    Ok((matrix, min_groups as f64 - 1.0, groups))
}

fn crv3(
    inputs: &VcovInputs,
    clusters: &[ClusterVar],
    ssc: &SscConfig,
) -> Result<(Array2<f64>, f64, Vec<usize>), EstimationError> {
    require_clusters(clusters, 1)?;
    let cluster = &clusters[0];
    let y = inputs.outcome.ok_or_else(|| {
        EstimationError::NotSupported("CRV3 needs the outcome of a least squares fit".to_string())
    })?;
    let x = inputs.scores_x;
    let k = x.ncols();
    let g = cluster.n_groups;

    let mut xtx_g = vec![Array2::<f64>::zeros((k, k)); g];
    let mut xty_g = vec![Array1::<f64>::zeros(k); g];
    for ((row, &yi), &c) in x.axis_iter(Axis(0)).zip(y.iter()).zip(&cluster.ids) {
        let outer = row
            .view()
            .insert_axis(Axis(1))
            .dot(&row.view().insert_axis(Axis(0)));
        xtx_g[c] += &outer;
        xty_g[c].scaled_add(yi, &row);
    }
    let xtx = x.t().dot(&x);
    let xty = x.t().dot(&y);

    let mut jackknife = Array2::<f64>::zeros((g, k));
    for c in 0..g {
        let lhs = &xtx - &xtx_g[c];
        let rhs = &xty - &xty_g[c];
        let beta = lhs
            .solve(&rhs)
            .map_err(EstimationError::LinearSystemSolveFailed)?;
        jackknife.row_mut(c).assign(&beta);
    }

    let centre = jackknife.mean_axis(Axis(0)).unwrap_or_else(|| Array1::zeros(k));
    let deviations = &jackknife - &centre;
    let n_params = inputs.n_coef + ssc.fixef_dof(inputs.fixef, &[&cluster.ids]);
    let factor = ssc.adjustment(inputs.nobs, n_params) * (g as f64 - 1.0) / g as f64;
    let matrix = deviations.t().dot(&deviations).mapv(|v| v * factor);

    Ok((matrix, g as f64 - 1.0, vec![g]))
}
