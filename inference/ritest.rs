//! # Randomization Inference
//!
//! Tests a sharp null on one coefficient by re-assigning the treatment at
//! random and recomputing the statistic, `reps` times. The p-value is the
//! share of draws at least as extreme as the observed statistic.
//!
//! Two engines compute the statistic of a draw:
//!
//! - slow: refits the whole model on a copy of the design with the treatment
//!   replaced. Works for every model family and covariance estimator.
//! - fast: least squares only. By Frisch-Waugh-Lovell the coefficient of the
//!   treatment is `r'y / r'r`, where `r` is the demeaned treatment with the
//!   other regressors partialled out. The basis of the other regressors and
//!   the residualized outcome are computed once, so a draw costs one
//!   demeaning and two projections.
//!
//! Every repetition seeds its own RNG from the root seed and its index, so
//! draws are identical for both engines and do not depend on rayon's
//! scheduling.

use crate::cache::DemeanCache;
use crate::collinear::{is_negligible_pivot, reference_scale};
use crate::config::ConfigError;
use crate::data::{DataError, Dataset};
use crate::demean::demean_vector;
use crate::estimate::{EstimationError, resolve_clusters};
use crate::fit::{FitResult, check_demean_convergence, fit_design, scale_rows};
use crate::inference::distributions::{clopper_pearson, wald_interval};
use crate::inference::vcov::{ClusterVar, HeteroKind, VcovInputs, VcovType, compute_vcov};
use crate::model::ModelFamily;
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use itertools::Itertools;
use ndarray::{Array1, Array2, ArrayView1, Axis};
use ndarray_linalg::QR;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::IsTerminal;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RitestError {
    #[error(transparent)]
    Estimation(#[from] EstimationError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Data(#[from] DataError),

    #[error("'{0}' is not an estimated coefficient of the model.")]
    UnknownCoefficient(String),

    #[error("Cannot parse resampling variable '{0}'. Expected 'X', 'X=h0', 'X>h0' or 'X<h0'.")]
    InvalidResampvar(String),

    #[error("Resampling is degenerate: '{0}' takes fewer than two distinct values.")]
    DegenerateResampling(String),

    #[error("'{treatment}' varies within clusters of '{cluster}'; cannot re-assign by cluster.")]
    TreatmentVariesWithinCluster { treatment: String, cluster: String },

    #[error("All {reps} randomization draws left '{name}' collinear with the other regressors.")]
    AllDrawsDegenerate { name: String, reps: usize },

    #[error("Not supported: {0}")]
    NotSupported(String),
}

/// Which engine computes the statistic of each draw.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RitestAlgorithm {
    Slow,
    Fast,
    /// Fast when the model allows it, slow otherwise.
    #[default]
    Auto,
}

impl FromStr for RitestAlgorithm {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "slow" => Ok(RitestAlgorithm::Slow),
            "fast" => Ok(RitestAlgorithm::Fast),
            "auto" => Ok(RitestAlgorithm::Auto),
            other => Err(ConfigError::UnknownOption {
                argument: "algorithm",
                value: other.to_string(),
                expected: "slow, fast, auto",
            }),
        }
    }
}

impl fmt::Display for RitestAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RitestAlgorithm::Slow => "slow",
            RitestAlgorithm::Fast => "fast",
            RitestAlgorithm::Auto => "auto",
        })
    }
}

/// The statistic compared across draws.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RitestStatistic {
    /// The coefficient itself.
    #[default]
    #[serde(rename = "randomization-c")]
    RandomizationC,
    /// The coefficient over its standard error.
    #[serde(rename = "randomization-t")]
    RandomizationT,
}

impl FromStr for RitestStatistic {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "randomization-c" => Ok(RitestStatistic::RandomizationC),
            "randomization-t" => Ok(RitestStatistic::RandomizationT),
            other => Err(ConfigError::UnknownOption {
                argument: "type",
                value: other.to_string(),
                expected: "randomization-c, randomization-t",
            }),
        }
    }
}

impl fmt::Display for RitestStatistic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RitestStatistic::RandomizationC => "randomization-c",
            RitestStatistic::RandomizationT => "randomization-t",
        })
    }
}

/// How the Monte-Carlo interval around the p-value is formed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CiMethod {
    #[default]
    Wald,
    ClopperPearson,
}

impl FromStr for CiMethod {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "wald" => Ok(CiMethod::Wald),
            "clopper-pearson" => Ok(CiMethod::ClopperPearson),
            other => Err(ConfigError::UnknownOption {
                argument: "ci_method",
                value: other.to_string(),
                expected: "wald, clopper-pearson",
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Alternative {
    TwoSided,
    Greater,
    Less,
}

/// A parsed `resampvar` argument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResampVar {
    pub name: String,
    pub h0: f64,
    pub alternative: Alternative,
}

impl FromStr for ResampVar {
    type Err = RitestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || RitestError::InvalidResampvar(s.to_string());
        let (name, h0, alternative) = match s.find(['=', '>', '<']) {
            None => (s, "0", Alternative::TwoSided),
            Some(at) => {
                let alternative = match &s[at..at + 1] {
                    "=" => Alternative::TwoSided,
                    ">" => Alternative::Greater,
                    _ => Alternative::Less,
                };
                (&s[..at], &s[at + 1..], alternative)
            }
        };
        let name = name.trim();
        if name.is_empty() {
            return Err(invalid());
        }
        let h0: f64 = h0.trim().parse().map_err(|_| invalid())?;
        if !h0.is_finite() {
            return Err(invalid());
        }
        Ok(Self {
            name: name.to_string(),
            h0,
            alternative,
        })
    }
}

/// Settings of one randomization test.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RitestOptions {
    /// `X`, `X=h0`, `X>h0` or `X<h0`.
    pub resampvar: String,
    pub reps: usize,
    pub algorithm: RitestAlgorithm,
    pub statistic: RitestStatistic,
    pub seed: u64,
    /// Re-assign the treatment at the level of this clustering variable.
    pub cluster: Option<String>,
    /// Confidence level of the interval around the p-value.
    pub level: f64,
    pub ci_method: CiMethod,
    pub store_statistics: bool,
    pub show_progress: bool,
}

impl Default for RitestOptions {
    fn default() -> Self {
        Self {
            resampvar: String::new(),
            reps: 100,
            algorithm: RitestAlgorithm::Auto,
            statistic: RitestStatistic::RandomizationC,
            seed: 0,
            cluster: None,
            level: 0.95,
            ci_method: CiMethod::Wald,
            store_statistics: false,
            show_progress: false,
        }
    }
}

impl RitestOptions {
    pub fn new(resampvar: &str) -> Self {
        Self {
            resampvar: resampvar.to_string(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.reps == 0 {
            return Err(ConfigError::RangeViolation {
                argument: "reps",
                value: self.reps.to_string(),
                requirement: "must be at least 1",
            });
        }
        if !(self.level > 0.0 && self.level < 1.0) {
            return Err(ConfigError::RangeViolation {
                argument: "level",
                value: self.level.to_string(),
                requirement: "must be strictly between 0 and 1",
            });
        }
        Ok(())
    }
}

/// The raw outcome of the resampling loop.
#[derive(Debug, Clone, PartialEq)]
pub struct RitestState {
    /// One statistic per repetition, in repetition order.
    pub statistics: Vec<f64>,
    pub observed: f64,
    pub statistic: RitestStatistic,
    /// Cluster code of every observation when resampling by cluster.
    pub clusters: Option<Vec<usize>>,
}

/// The summary of a randomization test, as attached to a fit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RitestResult {
    pub coefficient: String,
    pub h0: f64,
    pub alternative: Alternative,
    /// The model's estimate of the coefficient.
    pub estimate: f64,
    /// The statistic on the observed assignment, under the sharp null.
    pub observed: f64,
    pub statistic: RitestStatistic,
    pub algorithm: RitestAlgorithm,
    pub reps: usize,
    /// Draws where the treatment dropped out as collinear. They are left out
    /// of the p-value and its standard error.
    pub degenerate_draws: usize,
    pub pvalue: f64,
    /// Monte-Carlo standard error of the p-value.
    pub std_error: f64,
    pub conf_int: (f64, f64),
    pub level: f64,
    pub ci_method: CiMethod,
    pub cluster: Option<String>,
    pub statistics: Option<Vec<f64>>,
}

impl fmt::Display for RitestResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = match self.alternative {
            Alternative::TwoSided => "=",
            Alternative::Greater => ">",
            Alternative::Less => "<",
        };
        writeln!(
            f,
            "Randomization inference ({}, {} engine)",
            self.statistic, self.algorithm
        )?;
        writeln!(f, "H0:          {} {} {}", self.coefficient, sign, self.h0)?;
        writeln!(f, "Repetitions: {}", self.reps)?;
        if self.degenerate_draws > 0 {
            writeln!(f, "Degenerate:  {}", self.degenerate_draws)?;
        }
        if let Some(cluster) = &self.cluster {
            writeln!(f, "Cluster:     {cluster}")?;
        }
        writeln!(
            f,
            "{:<12} {:>12} {:>12} {:>12} {:>12}",
            "Estimate",
            "Pr(>|t|)",
            "Std. Error",
            format!("{:.1}%", (1.0 - self.level) / 2.0 * 100.0),
            format!("{:.1}%", (1.0 + self.level) / 2.0 * 100.0)
        )?;
        writeln!(
            f,
            "{:<12.6} {:>12.4} {:>12.4} {:>12.4} {:>12.4}",
            self.estimate, self.pvalue, self.std_error, self.conf_int.0, self.conf_int.1
        )
    }
}

/// Computes the test statistic for one assignment of the treatment.
trait RandomizationStatistic: Sync {
    fn statistic(&self, treatment: ArrayView1<f64>) -> Result<f64, RitestError>;
}

/// Refits the full model for every draw.
struct RefitStatistic<'a> {
    fit: &'a FitResult,
    name: String,
    outcome: Array1<f64>,
    statistic: RitestStatistic,
    kind: VcovType,
    clusters: Vec<ClusterVar>,
}

impl RandomizationStatistic for RefitStatistic<'_> {
    fn statistic(&self, treatment: ArrayView1<f64>) -> Result<f64, RitestError> {
        let design = self
            .fit
            .design()
            .with_regressor(&self.name, treatment)
            .with_outcome(self.outcome.clone());
        // Column names no longer identify their values, so nothing is cached.
        let mut cache = DemeanCache::disabled();
        let core = fit_design(self.fit.family(), &design, self.fit.config(), &mut cache)?;
        let Some(j) = core.coefficient_index(&self.name) else {
            log::debug!("'{}' was dropped as collinear in a draw.", self.name);
            return Ok(f64::NAN);
        };
        match self.statistic {
            RitestStatistic::RandomizationC => Ok(core.beta[j]),
            RitestStatistic::RandomizationT => {
                let vcov = compute_vcov(
                    &core.vcov_inputs(&design),
                    &self.kind,
                    &self.clusters,
                    &self.fit.config().ssc,
                )?;
                Ok(core.beta[j] / vcov.matrix[[j, j]].sqrt())
            }
        }
    }
}

/// Frisch-Waugh-Lovell update on a fixed basis of the other regressors.
struct PartialledStatistic<'a> {
    fit: &'a FitResult,
    /// Orthonormal basis of the other weighted, demeaned regressors.
    basis: Option<Array2<f64>>,
    /// Weighted, demeaned outcome with the other regressors partialled out.
    outcome: Array1<f64>,
    sqrt_weights: Array1<f64>,
    statistic: RitestStatistic,
    kind: VcovType,
    clusters: Vec<ClusterVar>,
}

impl<'a> PartialledStatistic<'a> {
    fn new(
        fit: &'a FitResult,
        name: &str,
        outcome: &Array1<f64>,
        statistic: RitestStatistic,
        clusters: Vec<ClusterVar>,
    ) -> Result<Self, RitestError> {
        let design = fit.design();
        let config = fit.config();
        let others: Vec<usize> = fit
            .core()
            .coef_names
            .iter()
            .filter(|n| n.as_str() != name)
            .filter_map(|n| design.x_names.iter().position(|x| x == n))
            .collect();

        let sqrt_weights = design.sqrt_weights();
        let mut cache = DemeanCache::disabled();
        let mut columns: Vec<(&str, ArrayView1<f64>)> =
            vec![(design.y_name.as_str(), outcome.view())];
        for &j in &others {
            columns.push((design.x_names[j].as_str(), design.x.column(j)));
        }
        let block = match (design.fixef.as_ref(), design.cache_key()) {
            (Some(fixef), Some(key)) => {
                let (block, converged) = cache.demean_columns(
                    &key,
                    &columns,
                    fixef,
                    design.weights.view(),
                    config.fixef_tol,
                    config.fixef_maxiter,
                );
                check_demean_convergence(converged, config)?;
                block
            }
            _ => {
                let mut block = Array2::zeros((design.nobs(), columns.len()));
                for (j, (_, column)) in columns.iter().enumerate() {
                    block.column_mut(j).assign(column);
                }
                block
            }
        };
        let weighted = scale_rows(block.view(), sqrt_weights.view());
        let yw = weighted.column(0).to_owned();

        let basis = if others.is_empty() {
            None
        } else {
            let xw = weighted.slice(ndarray::s![.., 1..]).to_owned();
            let (q, _) = xw
                .qr()
                .map_err(EstimationError::LinearSystemSolveFailed)?;
            Some(q)
        };
        let mut partialled = Self {
            fit,
            basis,
            outcome: Array1::zeros(0),
            sqrt_weights,
            statistic,
            kind: fit.vcov_info().kind.clone(),
            clusters,
        };
        partialled.outcome = partialled.residualize(yw);
        Ok(partialled)
    }

    fn residualize(&self, v: Array1<f64>) -> Array1<f64> {
        match &self.basis {
            Some(q) => {
                let projection = q.dot(&q.t().dot(&v));
                v - projection
            }
            None => v,
        }
    }
}

impl RandomizationStatistic for PartialledStatistic<'_> {
    fn statistic(&self, treatment: ArrayView1<f64>) -> Result<f64, RitestError> {
        let design = self.fit.design();
        let config = self.fit.config();
        let demeaned = match design.fixef.as_ref() {
            Some(fixef) => {
                let (values, converged) = demean_vector(
                    treatment,
                    fixef,
                    design.weights.view(),
                    config.fixef_tol,
                    config.fixef_maxiter,
                );
                check_demean_convergence(converged, config)?;
                values
            }
            None => treatment.to_owned(),
        };
        let raw = &treatment * &self.sqrt_weights;
        let demeaned = demeaned * &self.sqrt_weights;
        let scale = reference_scale(demeaned.dot(&demeaned), raw.view());
        let r = self.residualize(demeaned);
        let rr = r.dot(&r);
        if is_negligible_pivot(rr, scale, config.collin_tol) {
            return Ok(f64::NAN);
        }
        let beta = r.dot(&self.outcome) / rr;

        match self.statistic {
            RitestStatistic::RandomizationC => Ok(beta),
            RitestStatistic::RandomizationT => {
                let residuals = &self.outcome - &(&r * beta);
                let scores_x = r.insert_axis(Axis(1));
                let bread = Array2::from_elem((1, 1), 1.0 / rr);
                let inputs = VcovInputs {
                    family: ModelFamily::Ols,
                    bread: bread.view(),
                    scores_x: scores_x.view(),
                    residuals: residuals.view(),
                    outcome: None,
                    prior_weights: design.weights.view(),
                    weights_type: design.weights_type,
                    weighted: design.is_weighted(),
                    nobs: design.effective_nobs(),
                    n_coef: self.fit.coef_names().len(),
                    fixef: design.fixef.as_ref(),
                    compressed: None,
                };
                let vcov = compute_vcov(&inputs, &self.kind, &self.clusters, &config.ssc)?;
                Ok(beta / vcov.matrix[[0, 0]].sqrt())
            }
        }
    }
}

/// Why the fast engine cannot run on this fit, if it cannot.
fn fast_engine_obstacle(
    fit: &FitResult,
    statistic: RitestStatistic,
    clustered: bool,
) -> Option<String> {
    if fit.family() != ModelFamily::Ols {
        return Some(format!("the fast engine needs least squares, not {}", fit.family().name()));
    }
    if fit.core().compressed.is_some() {
        return Some("the fast engine cannot run on a compressed fit".to_string());
    }
    if clustered {
        return Some("the fast engine does not support cluster-level re-assignment".to_string());
    }
    let kind = &fit.vcov_info().kind;
    let leverage_or_jackknife = matches!(
        kind,
        VcovType::Hetero(HeteroKind::Hc2 | HeteroKind::Hc3) | VcovType::Crv3(_)
    );
    if statistic == RitestStatistic::RandomizationT && leverage_or_jackknife {
        return Some(format!("the fast engine cannot compute {kind} standard errors"));
    }
    None
}

fn repetition_rng(seed: u64, rep: u64) -> StdRng {
    StdRng::seed_from_u64(seed.wrapping_add(rep.wrapping_mul(0x9E37_79B9_7F4A_7C15)))
}

/// Treatment values and how a draw maps them back to observations.
enum Assignment {
    Observations(Vec<f64>),
    /// One value per cluster; the treatment is constant within each.
    Clusters { values: Vec<f64>, ids: Vec<usize> },
}

impl Assignment {
    fn new(
        name: &str,
        treatment: &Array1<f64>,
        cluster: Option<&ClusterVar>,
    ) -> Result<Self, RitestError> {
        let Some(var) = cluster else {
            return Ok(Assignment::Observations(treatment.to_vec()));
        };
        let mut values: Vec<Option<f64>> = vec![None; var.n_groups];
        for (&g, &t) in var.ids.iter().zip(treatment.iter()) {
            match values[g] {
                None => values[g] = Some(t),
                Some(first) if first.to_bits() != t.to_bits() => {
                    return Err(RitestError::TreatmentVariesWithinCluster {
                        treatment: name.to_string(),
                        cluster: var.name.clone(),
                    });
                }
                Some(_) => {}
            }
        }
        Ok(Assignment::Clusters {
            values: values.into_iter().map(|v| v.unwrap_or(f64::NAN)).collect(),
            ids: var.ids.clone(),
        })
    }

    fn assignable_values(&self) -> &[f64] {
        match self {
            Assignment::Observations(values) => values,
            Assignment::Clusters { values, .. } => values,
        }
    }

    fn draw(&self, rng: &mut StdRng) -> Array1<f64> {
        match self {
            Assignment::Observations(values) => {
                let mut permuted = values.clone();
                permuted.shuffle(rng);
                Array1::from(permuted)
            }
            Assignment::Clusters { values, ids } => {
                let mut permuted = values.clone();
                permuted.shuffle(rng);
                ids.iter().map(|&g| permuted[g]).collect()
            }
        }
    }
}

fn create_progress_bar(len: u64, show: bool) -> ProgressBar {
    let draw_target = if show && std::io::stderr().is_terminal() {
        ProgressDrawTarget::stderr_with_hz(20)
    } else {
        ProgressDrawTarget::hidden()
    };
    let pb = ProgressBar::with_draw_target(Some(len), draw_target);
    let template = "> [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}";
    if let Ok(style) = ProgressStyle::with_template(template) {
        pb.set_style(style.progress_chars("█▉▊▋▌▍▎▏  "));
    }
    pb.set_message("randomization draws");
    pb
}

/// Tally of the draws that enter the p-value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DrawTally {
    /// Share of the valid draws at least as extreme as the observed statistic.
    pub pvalue: f64,
    pub extreme: usize,
    /// Draws with a defined statistic.
    pub valid: usize,
}

/// Counts the draws at least as extreme as `observed`. Undefined (NaN)
/// draws are skipped entirely; the p-value is NaN when none is left.
pub fn randomization_pvalue(
    statistics: &[f64],
    observed: f64,
    alternative: Alternative,
) -> DrawTally {
    let valid: Vec<f64> = statistics.iter().copied().filter(|s| !s.is_nan()).collect();
    let extreme = valid
        .iter()
        .filter(|&&s| match alternative {
            Alternative::TwoSided => s.abs() >= observed.abs(),
            Alternative::Greater => s >= observed,
            Alternative::Less => s <= observed,
        })
        .count();
    DrawTally {
        pvalue: extreme as f64 / valid.len() as f64,
        extreme,
        valid: valid.len(),
    }
}

/// Runs randomization inference for one coefficient of `fit`.
pub fn ritest(
    fit: &FitResult,
    data: &Dataset,
    options: &RitestOptions,
) -> Result<RitestResult, RitestError> {
    options.validate()?;
    let resampvar: ResampVar = options.resampvar.parse()?;
    let design = fit.design();
    let unknown = || RitestError::UnknownCoefficient(resampvar.name.clone());
    let coef_index = fit.core().coefficient_index(&resampvar.name).ok_or_else(unknown)?;
    let column = design
        .x_names
        .iter()
        .position(|n| *n == resampvar.name)
        .ok_or_else(unknown)?;

    if fit.family() == ModelFamily::Poisson && resampvar.h0 != 0.0 {
        return Err(RitestError::NotSupported(
            "a non-zero sharp null cannot be imposed on a Poisson outcome".to_string(),
        ));
    }

    let treatment = design.x.column(column).to_owned();
    let outcome = if resampvar.h0 != 0.0 {
        &design.y - &(&treatment * resampvar.h0)
    } else {
        design.y.clone()
    };

    let resampling_cluster = match options.cluster.as_ref() {
        Some(name) => resolve_clusters(data, std::slice::from_ref(name), &design.rows)?
            .into_iter()
            .next(),
        None => None,
    };
    let assignment = Assignment::new(&resampvar.name, &treatment, resampling_cluster.as_ref())?;
    let distinct = assignment
        .assignable_values()
        .iter()
        .map(|v| v.to_bits())
        .unique()
        .count();
    if distinct < 2 {
        return Err(RitestError::DegenerateResampling(resampvar.name.clone()));
    }

    let obstacle = fast_engine_obstacle(fit, options.statistic, resampling_cluster.is_some());
    let algorithm = match (options.algorithm, obstacle) {
        (RitestAlgorithm::Fast, Some(reason)) => return Err(RitestError::NotSupported(reason)),
        (RitestAlgorithm::Slow, _) | (RitestAlgorithm::Auto, Some(_)) => RitestAlgorithm::Slow,
        (RitestAlgorithm::Fast | RitestAlgorithm::Auto, None) => RitestAlgorithm::Fast,
    };

    let kind = fit.vcov_info().kind.clone();
    let clusters = resolve_clusters(data, &kind.cluster_names(), &design.rows)?;
    let engine: Box<dyn RandomizationStatistic + '_> = match algorithm {
        RitestAlgorithm::Fast => Box::new(PartialledStatistic::new(
            fit,
            &resampvar.name,
            &outcome,
            options.statistic,
            clusters,
        )?),
        _ => Box::new(RefitStatistic {
            fit,
            name: resampvar.name.clone(),
            outcome,
            statistic: options.statistic,
            kind,
            clusters,
        }),
    };

    log::info!(
        "Running {} {} draws for '{}' with the {} engine.",
        options.reps,
        options.statistic,
        options.resampvar,
        algorithm
    );
    let observed = engine.statistic(treatment.view())?;
    let progress = create_progress_bar(options.reps as u64, options.show_progress);
    let statistics = (0..options.reps as u64)
        .into_par_iter()
        .map(|rep| {
            let mut rng = repetition_rng(options.seed, rep);
            let draw = assignment.draw(&mut rng);
            let value = engine.statistic(draw.view());
            progress.inc(1);
            value
        })
        .collect::<Result<Vec<f64>, RitestError>>()?;
    progress.finish_and_clear();

    let state = RitestState {
        statistics,
        observed,
        statistic: options.statistic,
        clusters: resampling_cluster.map(|c| c.ids),
    };
    summarize(fit, &resampvar, options, algorithm, coef_index, state)
}

fn summarize(
    fit: &FitResult,
    resampvar: &ResampVar,
    options: &RitestOptions,
    algorithm: RitestAlgorithm,
    coef_index: usize,
    state: RitestState,
) -> Result<RitestResult, RitestError> {
    let reps = state.statistics.len();
    let DrawTally {
        pvalue,
        extreme,
        valid,
    } = randomization_pvalue(&state.statistics, state.observed, resampvar.alternative);
    if valid == 0 {
        return Err(RitestError::AllDrawsDegenerate {
            name: resampvar.name.clone(),
            reps,
        });
    }
    let degenerate_draws = reps - valid;
    if degenerate_draws > 0 {
        log::warn!(
            "'{}' was collinear in {degenerate_draws} of {reps} draws; they are left out.",
            resampvar.name
        );
    }
    let std_error = (pvalue * (1.0 - pvalue) / valid as f64).sqrt();
    let conf_int = match options.ci_method {
        CiMethod::Wald => wald_interval(pvalue, std_error, options.level),
        CiMethod::ClopperPearson => clopper_pearson(extreme, valid, options.level),
    };
    log::debug!("Randomization p-value {pvalue:.4} from {extreme} extreme draws out of {valid}.");

    Ok(RitestResult {
        coefficient: resampvar.name.clone(),
        h0: resampvar.h0,
        alternative: resampvar.alternative,
        estimate: fit.coefficients()[coef_index],
        observed: state.observed,
        statistic: state.statistic,
        algorithm,
        reps,
        degenerate_draws,
        pvalue,
        std_error,
        conf_int,
        level: options.level,
        ci_method: options.ci_method,
        cluster: options.cluster.clone(),
        statistics: options.store_statistics.then_some(state.statistics),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resampvar_forms() {
        let two: ResampVar = "X1".parse().unwrap();
        assert_eq!(
            (two.name.as_str(), two.h0, two.alternative),
            ("X1", 0.0, Alternative::TwoSided)
        );
        let eq: ResampVar = "X1=0.5".parse().unwrap();
        assert_eq!((eq.h0, eq.alternative), (0.5, Alternative::TwoSided));
        let gt: ResampVar = "X1 > -1".parse().unwrap();
        assert_eq!((gt.name.as_str(), gt.h0, gt.alternative), ("X1", -1.0, Alternative::Greater));
        let lt: ResampVar = "X1<2".parse().unwrap();
        assert_eq!(lt.alternative, Alternative::Less);
        for bad in ["", "=1", "X1=abc", "X1>"] {
            assert!(matches!(bad.parse::<ResampVar>(), Err(RitestError::InvalidResampvar(_))));
        }
    }

    #[test]
    fn pvalue_counts_extreme_draws_by_alternative() {
        let stats = [-3.0, -1.0, 0.5, 2.0, 2.5];
        let count = |observed, alternative| {
            let tally = randomization_pvalue(&stats, observed, alternative);
            (tally.pvalue, tally.extreme, tally.valid)
        };
        assert_eq!(count(2.0, Alternative::TwoSided), (0.6, 3, 5));
        assert_eq!(count(2.0, Alternative::Greater), (0.4, 2, 5));
        assert_eq!(count(-1.0, Alternative::Less), (0.4, 2, 5));
    }

    #[test]
    fn undefined_draws_leave_the_denominator() {
        let statistics = [f64::NAN, 1.0, 0.1, f64::NAN];
        let tally = randomization_pvalue(&statistics, 0.5, Alternative::TwoSided);
        assert_eq!(tally, DrawTally { pvalue: 0.5, extreme: 1, valid: 2 });
        assert!(randomization_pvalue(&[f64::NAN], 0.5, Alternative::Less).pvalue.is_nan());
    }

    #[test]
    fn repetition_streams_are_reproducible_and_distinct() {
        let values = Array1::from((0..20).map(f64::from).collect::<Vec<_>>());
        let assignment = Assignment::new("x", &values, None).unwrap();
        let a = assignment.draw(&mut repetition_rng(7, 3));
        let b = assignment.draw(&mut repetition_rng(7, 3));
        let c = assignment.draw(&mut repetition_rng(7, 4));
        assert_eq!(a, b);
        assert_ne!(a, c);
        let mut sorted = a.to_vec();
        sorted.sort_by(f64::total_cmp);
        assert_eq!(sorted, (0..20).map(f64::from).collect::<Vec<_>>());
    }

    #[test]
    fn cluster_draws_are_constant_within_clusters() {
        let var = ClusterVar::from_labels("g", vec![0, 0, 1, 1, 1, 2]);
        let treatment = Array1::from(vec![1.0, 1.0, 0.0, 0.0, 0.0, 1.0]);
        let assignment = Assignment::new("t", &treatment, Some(&var)).unwrap();
        assert_eq!(assignment.assignable_values(), &[1.0, 0.0, 1.0]);
        for rep in 0..10 {
            let draw = assignment.draw(&mut repetition_rng(1, rep));
            assert_eq!(draw[0], draw[1]);
            assert_eq!(draw[2], draw[3]);
            assert_eq!(draw[3], draw[4]);
        }
    }

    #[test]
    fn treatments_varying_within_a_cluster_are_rejected() {
        let var = ClusterVar::from_labels("g", vec![0, 0, 1, 1]);
        let treatment = Array1::from(vec![1.0, 0.0, 0.0, 0.0]);
        assert!(matches!(
            Assignment::new("t", &treatment, Some(&var)),
            Err(RitestError::TreatmentVariesWithinCluster { treatment, cluster })
                if treatment == "t" && cluster == "g"
        ));
    }

    #[test]
    fn both_engines_stop_on_unconverged_demeaning_in_strict_mode() {
        use crate::{Dataset, EstimationConfig, feols};
        use polars::prelude::*;
        use rand::Rng;

        let mut rng = StdRng::seed_from_u64(17);
        let n = 300;
        let f1: Vec<i64> = (0..n).map(|_| rng.gen_range(0..20)).collect();
        let f2: Vec<i64> = (0..n).map(|_| rng.gen_range(0..20)).collect();
        let x1: Vec<f64> = (0..n).map(|_| rng.r#gen::<f64>()).collect();
        let t: Vec<f64> = (0..n).map(|i| f64::from(i % 2 == 0)).collect();
        let y: Vec<f64> = x1.iter().map(|x| x + rng.r#gen::<f64>()).collect();
        let frame = df!("f1" => f1, "f2" => f2, "X1" => x1, "T" => t, "Y" => y).unwrap();
        let data = Dataset::new(frame);

        let loose = EstimationConfig {
            fixef_tol: 1e-14,
            fixef_maxiter: 1,
            ..EstimationConfig::default()
        };
        let fit = feols("Y ~ T + X1 | f1 + f2", &data, &loose)
            .unwrap()
            .into_models()
            .remove(0);
        let strict = FitResult::new(
            fit.spec().clone(),
            fit.core().clone(),
            fit.design().clone(),
            EstimationConfig {
                strict: true,
                ..loose.clone()
            },
            fit.vcov_info().clone(),
        );

        for algorithm in [RitestAlgorithm::Slow, RitestAlgorithm::Fast] {
            let options = RitestOptions {
                reps: 5,
                algorithm,
                ..RitestOptions::new("T")
            };
            assert!(ritest(&fit, &data, &options).is_ok());
            assert!(matches!(
                ritest(&strict, &data, &options),
                Err(RitestError::Estimation(EstimationError::DemeanDidNotConverge {
                    max_iterations: 1
                }))
            ));
        }
    }

    #[test]
    fn options_are_range_checked() {
        let mut options = RitestOptions::new("X1");
        assert!(options.validate().is_ok());
        options.reps = 0;
        assert!(matches!(
            options.validate(),
            Err(ConfigError::RangeViolation { argument: "reps", .. })
        ));
        options.reps = 10;
        options.level = 1.0;
        assert!(matches!(
            options.validate(),
            Err(ConfigError::RangeViolation { argument: "level", .. })
        ));
        assert_eq!("fast".parse::<RitestAlgorithm>().unwrap(), RitestAlgorithm::Fast);
        assert_eq!(
            "randomization-t".parse::<RitestStatistic>().unwrap(),
            RitestStatistic::RandomizationT
        );
    }
}
