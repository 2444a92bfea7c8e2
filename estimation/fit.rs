//! # Model Fit Core
//!
//! Every family implements [`Estimator`]: given a raw [`ModelDesign`] it
//! demeans what it needs, drops collinear regressors, solves, and returns a
//! [`FitCore`] with the coefficients and the pieces covariance estimators
//! need. [`FitResult`] wraps a core with its covariance and is what users see.
//!
//! Least squares goes through a QR decomposition of `sqrt(W) X`:
//! `beta = R^-1 Q' sqrt(W) y` and `bread = R^-1 R^-T = (X'WX)^-1`.

use crate::cache::DemeanCache;
use crate::collinear::{CollinearityReport, check_collinearity_within};
use crate::compression::{self, CompressedMoments};
use crate::config::EstimationConfig;
use crate::data::Dataset;
use crate::estimate::{EstimationError, resolve_clusters};
use crate::inference::ritest::{self, RitestError, RitestOptions, RitestResult};
use crate::inference::ssc::SscConfig;
use crate::inference::vcov::{Vcov, VcovInputs, VcovType, compute_vcov};
use crate::iv::TwoStageLeastSquares;
use crate::iwls::{IwlsSummary, PoissonPseudoLikelihood};
use crate::model::{ModelDesign, ModelFamily, ModelSpec};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use ndarray_linalg::{Diag, QR, SolveTriangular, UPLO};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

/// The capability every model family provides.
pub(crate) trait Estimator {
    fn fit(
        &self,
        design: &ModelDesign,
        config: &EstimationConfig,
        cache: &mut DemeanCache,
    ) -> Result<FitCore, EstimationError>;
}

/// Ordinary and weighted least squares.
pub(crate) struct LeastSquares;

pub(crate) fn estimator_for(family: ModelFamily) -> &'static dyn Estimator {
    match family {
        ModelFamily::Ols => &LeastSquares,
        ModelFamily::Poisson => &PoissonPseudoLikelihood,
        ModelFamily::Iv => &TwoStageLeastSquares,
    }
}

/// Estimates on a design without computing any covariance.
pub(crate) fn fit_design(
    family: ModelFamily,
    design: &ModelDesign,
    config: &EstimationConfig,
    cache: &mut DemeanCache,
) -> Result<FitCore, EstimationError> {
    estimator_for(family).fit(design, config, cache)
}

/// Coefficients plus everything post-estimation needs, before any covariance.
#[derive(Debug, Clone)]
pub(crate) struct FitCore {
    pub family: ModelFamily,
    pub coef_names: Vec<String>,
    pub beta: Array1<f64>,
    pub bread: Array2<f64>,
    pub fitted: Array1<f64>,
    pub residuals: Array1<f64>,
    pub collinear: CollinearityReport,
    pub demean_converged: bool,
    pub iwls: Option<IwlsSummary>,
    /// Weighted score regressors, one row per observation.
    pub scores_x: Array2<f64>,
    /// Weighted working residuals matching `scores_x`.
    pub working_residuals: Array1<f64>,
    /// Weighted demeaned outcome of least-squares fits.
    pub outcome: Option<Array1<f64>>,
    pub compressed: Option<CompressedMoments>,
}

impl FitCore {
    pub fn vcov_inputs<'a>(&'a self, design: &'a ModelDesign) -> VcovInputs<'a> {
        VcovInputs {
            family: self.family,
            bread: self.bread.view(),
            scores_x: self.scores_x.view(),
            residuals: self.working_residuals.view(),
            outcome: self.outcome.as_ref().map(Array1::view),
            prior_weights: design.weights.view(),
            weights_type: design.weights_type,
            weighted: design.is_weighted(),
            nobs: design.effective_nobs(),
            n_coef: self.beta.len(),
            fixef: design.fixef.as_ref(),
            compressed: self.compressed.as_ref(),
        }
    }

    pub fn coefficient_index(&self, name: &str) -> Option<usize> {
        self.coef_names.iter().position(|n| n == name)
    }
}

/// Solution of a (pre-weighted) least squares problem.
#[derive(Debug, Clone)]
pub(crate) struct LeastSquaresSolution {
    pub beta: Array1<f64>,
    pub bread: Array2<f64>,
}

/// Solves `min ||y - X b||` for a full-column-rank `x` via QR.
pub(crate) fn least_squares(
    x: ArrayView2<f64>,
    y: ArrayView1<f64>,
) -> Result<LeastSquaresSolution, EstimationError> {
    let (n, k) = x.dim();
    if n <= k {
        return Err(EstimationError::InsufficientObservations { nobs: n, params: k });
    }
    let (q, r) = x.qr().map_err(EstimationError::LinearSystemSolveFailed)?;
    let r_inv = r
        .solve_triangular(UPLO::Upper, Diag::NonUnit, &Array2::<f64>::eye(k))
        .map_err(EstimationError::LinearSystemSolveFailed)?;
    let beta = r_inv.dot(&q.t().dot(&y));
    let bread = r_inv.dot(&r_inv.t());
    Ok(LeastSquaresSolution { beta, bread })
}

/// Scales every row of `x` by the matching entry of `scale`.
pub(crate) fn scale_rows(x: ArrayView2<f64>, scale: ArrayView1<f64>) -> Array2<f64> {
    &x * &scale.insert_axis(Axis(1))
}

/// Demeaned outcome, regressors and (for IV) instruments of a design.
pub(crate) struct DemeanedDesign {
    pub y: Array1<f64>,
    pub x: Array2<f64>,
    pub z: Option<Array2<f64>>,
    pub converged: bool,
}

/// Removes the fixed effects from every column of the design, through the
/// cache. Designs without fixed effects are returned as they are.
pub(crate) fn demean_design(
    design: &ModelDesign,
    config: &EstimationConfig,
    cache: &mut DemeanCache,
) -> Result<DemeanedDesign, EstimationError> {
    let (Some(fixef), Some(key)) = (design.fixef.as_ref(), design.cache_key()) else {
        return Ok(DemeanedDesign {
            y: design.y.clone(),
            x: design.x.clone(),
            z: design.z.clone(),
            converged: true,
        });
    };

    let mut columns: Vec<(&str, ArrayView1<f64>)> = vec![(design.y_name.as_str(), design.y.view())];
    for (name, column) in design.x_names.iter().zip(design.x.columns()) {
        columns.push((name.as_str(), column));
    }
    if let Some(z) = design.z.as_ref() {
        for (name, column) in design.z_names.iter().zip(z.columns()) {
            columns.push((name.as_str(), column));
        }
    }

    let (block, converged) = cache.demean_columns(
        &key,
        &columns,
        fixef,
        design.weights.view(),
        config.fixef_tol,
        config.fixef_maxiter,
    );
    check_demean_convergence(converged, config)?;

    let kx = design.x.ncols();
    let y = block.column(0).to_owned();
    let x = block.slice(ndarray::s![.., 1..1 + kx]).to_owned();
    let z = design
        .z
        .as_ref()
        .map(|_| block.slice(ndarray::s![.., 1 + kx..]).to_owned());
    Ok(DemeanedDesign { y, x, z, converged })
}

pub(crate) fn check_demean_convergence(
    converged: bool,
    config: &EstimationConfig,
) -> Result<(), EstimationError> {
    if converged {
        return Ok(());
    }
    if config.strict {
        return Err(EstimationError::DemeanDidNotConverge {
            max_iterations: config.fixef_maxiter,
        });
    }
    log::warn!(
        "Demeaning did not converge within {} sweeps (tolerance {:e}). Results may be inaccurate.",
        config.fixef_maxiter,
        config.fixef_tol
    );
    Ok(())
}

impl Estimator for LeastSquares {
    fn fit(
        &self,
        design: &ModelDesign,
        config: &EstimationConfig,
        cache: &mut DemeanCache,
    ) -> Result<FitCore, EstimationError> {
        if config.use_compression {
            return compression::fit_compressed(design, config);
        }

        let demeaned = demean_design(design, config, cache)?;
        let sqrt_w = design.sqrt_weights();
        let xw = scale_rows(demeaned.x.view(), sqrt_w.view());
        let yw = &demeaned.y * &sqrt_w;
        let raw = scale_rows(design.x.view(), sqrt_w.view());

        let collinear =
            check_collinearity_within(xw.view(), raw.view(), &design.x_names, config.collin_tol);
        if collinear.kept.is_empty() {
            return Err(EstimationError::AllRegressorsCollinear(collinear.dropped));
        }
        let xw = xw.select(Axis(1), &collinear.kept);
        let x = demeaned.x.select(Axis(1), &collinear.kept);

        let solution = least_squares(xw.view(), yw.view())?;
        let residuals = &demeaned.y - &x.dot(&solution.beta);
        let fitted = &design.y - &residuals;
        let working_residuals = &yw - &xw.dot(&solution.beta);

        Ok(FitCore {
            family: ModelFamily::Ols,
            coef_names: collinear
                .kept
                .iter()
                .map(|&j| design.x_names[j].clone())
                .collect(),
            beta: solution.beta,
            bread: solution.bread,
            fitted,
            residuals,
            collinear,
            demean_converged: demeaned.converged,
            iwls: None,
            scores_x: xw,
            working_residuals,
            outcome: Some(yw),
            compressed: None,
        })
    }
}

/// Results attached after estimation, without touching the primary estimates.
#[derive(Debug, Clone, Default)]
pub struct InferenceExtras {
    pub ritest: Vec<RitestResult>,
}

/// One line of a coefficient table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CoefficientRow {
    pub name: String,
    pub estimate: f64,
    pub std_error: f64,
    pub statistic: f64,
    pub pvalue: f64,
    pub conf_low: f64,
    pub conf_high: f64,
}

/// A fitted model: estimates, covariance and the data to revisit both.
///
/// Estimation produces the base result. Post-estimation methods return
/// augmented copies; the coefficients are never overwritten.
#[derive(Debug, Clone)]
pub struct FitResult {
    spec: ModelSpec,
    core: Arc<FitCore>,
    design: Arc<ModelDesign>,
    config: Arc<EstimationConfig>,
    vcov: Vcov,
    extras: InferenceExtras,
}

impl FitResult {
    pub(crate) fn new(
        spec: ModelSpec,
        core: FitCore,
        design: ModelDesign,
        config: EstimationConfig,
        vcov: Vcov,
    ) -> Self {
        Self {
            spec,
            core: Arc::new(core),
            design: Arc::new(design),
            config: Arc::new(config),
            vcov,
            extras: InferenceExtras::default(),
        }
    }

    pub(crate) fn core(&self) -> &FitCore {
        &self.core
    }

    pub(crate) fn design(&self) -> &ModelDesign {
        &self.design
    }

    pub(crate) fn config(&self) -> &EstimationConfig {
        &self.config
    }

    pub fn spec(&self) -> &ModelSpec {
        &self.spec
    }

    pub fn family(&self) -> ModelFamily {
        self.core.family
    }

    pub fn coef_names(&self) -> &[String] {
        &self.core.coef_names
    }

    pub fn coefficients(&self) -> ArrayView1<'_, f64> {
        self.core.beta.view()
    }

    pub fn coefficient(&self, name: &str) -> Option<f64> {
        self.core.coefficient_index(name).map(|j| self.core.beta[j])
    }

    /// `(X'WX)^-1` on the demeaned, weighted design.
    pub fn bread(&self) -> ArrayView2<'_, f64> {
        self.core.bread.view()
    }

    pub fn residuals(&self) -> ArrayView1<'_, f64> {
        self.core.residuals.view()
    }

    pub fn fitted_values(&self) -> ArrayView1<'_, f64> {
        self.core.fitted.view()
    }

    pub fn weights(&self) -> ArrayView1<'_, f64> {
        self.design.weights.view()
    }

    pub fn nobs(&self) -> usize {
        self.design.nobs()
    }

    /// Dataset rows used by this model.
    pub fn sample_rows(&self) -> &[usize] {
        &self.design.rows
    }

    pub fn pruned_rows(&self) -> usize {
        self.design.pruned_rows
    }

    pub fn collinearity(&self) -> &CollinearityReport {
        &self.core.collinear
    }

    /// False if demeaning or the IWLS loop stopped at its iteration cap.
    pub fn converged(&self) -> bool {
        self.core.demean_converged && self.core.iwls.is_none_or(|s| s.converged)
    }

    pub fn iwls_summary(&self) -> Option<IwlsSummary> {
        self.core.iwls
    }

    pub fn vcov_info(&self) -> &Vcov {
        &self.vcov
    }

    pub fn vcov_matrix(&self) -> ArrayView2<'_, f64> {
        self.vcov.matrix.view()
    }

    pub fn standard_errors(&self) -> Array1<f64> {
        self.vcov.standard_errors()
    }

    pub fn tstats(&self) -> Array1<f64> {
        &self.core.beta / &self.standard_errors()
    }

    pub fn pvalues(&self) -> Array1<f64> {
        let reference = self.vcov.reference();
        self.tstats().mapv(|t| reference.two_sided_pvalue(t))
    }

    /// Symmetric confidence intervals, one `[low, high]` row per coefficient.
    pub fn confint(&self, level: f64) -> Array2<f64> {
        let critical = self.vcov.reference().critical_value(level);
        let se = self.standard_errors();
        Array2::from_shape_fn((self.core.beta.len(), 2), |(j, side)| {
            let margin = critical * se[j];
            if side == 0 {
                self.core.beta[j] - margin
            } else {
                self.core.beta[j] + margin
            }
        })
    }

    pub fn tidy(&self, level: f64) -> Vec<CoefficientRow> {
        let se = self.standard_errors();
        let t = self.tstats();
        let p = self.pvalues();
        let ci = self.confint(level);
        self.core
            .coef_names
            .iter()
            .enumerate()
            .map(|(j, name)| CoefficientRow {
                name: name.clone(),
                estimate: self.core.beta[j],
                std_error: se[j],
                statistic: t[j],
                pvalue: p[j],
                conf_low: ci[[j, 0]],
                conf_high: ci[[j, 1]],
            })
            .collect()
    }

    pub fn extras(&self) -> &InferenceExtras {
        &self.extras
    }

    /// A copy of this fit with a different covariance estimator.
    pub fn vcov(&self, data: &Dataset, kind: &VcovType) -> Result<FitResult, EstimationError> {
        self.vcov_with_ssc(data, kind, &self.config.ssc)
    }

    pub fn vcov_with_ssc(
        &self,
        data: &Dataset,
        kind: &VcovType,
        ssc: &SscConfig,
    ) -> Result<FitResult, EstimationError> {
        let clusters = resolve_clusters(data, &kind.cluster_names(), &self.design.rows)?;
        let vcov = compute_vcov(&self.core.vcov_inputs(&self.design), kind, &clusters, ssc)?;
        log::debug!("Recomputed covariance of '{}' as {}.", self.spec, kind);
        Ok(FitResult {
            vcov,
            ..self.clone()
        })
    }

    /// Runs randomization inference and returns its result.
    pub fn ritest(
        &self,
        data: &Dataset,
        options: &RitestOptions,
    ) -> Result<RitestResult, RitestError> {
        ritest::ritest(self, data, options)
    }

    /// A copy of this fit with `result` appended to its inference extras.
    pub fn with_ritest(&self, result: RitestResult) -> FitResult {
        let mut augmented = self.clone();
        augmented.extras.ritest.push(result);
        augmented
    }
}

impl fmt::Display for FitResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stat_label = if self.vcov.normal_reference {
            ("z value", "Pr(>|z|)")
        } else {
            ("t value", "Pr(>|t|)")
        };
        writeln!(f, "Estimation:  {}", self.family().name())?;
        writeln!(f, "Formula:     {}", self.spec)?;
        writeln!(f, "Inference:   {}", self.vcov.kind)?;
        writeln!(f, "Observations: {}", self.nobs())?;
        if self.core.collinear.has_dropped() {
            writeln!(
                f,
                "Dropped as collinear: {}",
                self.core.collinear.dropped.join(", ")
            )?;
        }
        writeln!(f)?;
        writeln!(
            f,
            "{:<16} {:>12} {:>12} {:>10} {:>10} {:>12} {:>12}",
            "Coefficient", "Estimate", "Std. Error", stat_label.0, stat_label.1, "2.5%", "97.5%"
        )?;
        for row in self.tidy(0.95) {
            writeln!(
                f,
                "{:<16} {:>12.6} {:>12.6} {:>10.3} {:>10.4} {:>12.6} {:>12.6}",
                row.name,
                row.estimate,
                row.std_error,
                row.statistic,
                row.pvalue,
                row.conf_low,
                row.conf_high
            )?;
        }
        if let Some(summary) = self.core.iwls {
            writeln!(
                f,
                "Deviance: {:.4}  IWLS iterations: {}",
                summary.deviance, summary.iterations
            )?;
        }
        Ok(())
    }
}
