//! Lossless compression of least-squares problems.
//!
//! Rows with identical regressors are collapsed into one record carrying the
//! row count and the first two moments of the outcome. The weighted fit on
//! the group means has the same coefficients and bread as the full fit, and
//! the per-group residual sums of squares keep iid and heteroskedasticity
//! robust covariances exact.

use crate::collinear::check_collinearity;
use crate::config::EstimationConfig;
use crate::estimate::EstimationError;
use crate::fit::{FitCore, least_squares, scale_rows};
use crate::fixef::factorize;
use crate::model::{ModelDesign, ModelFamily};
use ndarray::{Array1, Array2, Axis};

/// Sufficient statistics of a compressed least-squares problem.
#[derive(Debug, Clone)]
pub(crate) struct CompressedMoments {
    /// One row per distinct regressor row, restricted to the kept columns.
    pub x: Array2<f64>,
    /// Residual sum of squares within each group.
    pub rss: Array1<f64>,
    pub counts: Array1<f64>,
}

impl CompressedMoments {
    pub fn n_groups(&self) -> usize {
        self.counts.len()
    }
}

struct Groups {
    ids: Vec<usize>,
    x: Array2<f64>,
    counts: Array1<f64>,
    sum_y: Array1<f64>,
    sum_y2: Array1<f64>,
}

fn group_identical_rows(design: &ModelDesign) -> Groups {
    let keys = design
        .x
        .axis_iter(Axis(0))
        .map(|row| row.iter().map(|v| v.to_bits()).collect::<Vec<u64>>());
    let (ids, n_groups) = factorize(keys);

    let k = design.x.ncols();
    let mut x = Array2::<f64>::zeros((n_groups, k));
    let mut counts = Array1::<f64>::zeros(n_groups);
    let mut sum_y = Array1::<f64>::zeros(n_groups);
    let mut sum_y2 = Array1::<f64>::zeros(n_groups);
    for ((row, &g), &yi) in design.x.axis_iter(Axis(0)).zip(&ids).zip(design.y.iter()) {
        if counts[g] == 0.0 {
            x.row_mut(g).assign(&row);
        }
        counts[g] += 1.0;
        sum_y[g] += yi;
        sum_y2[g] += yi * yi;
    }
    Groups {
        ids,
        x,
        counts,
        sum_y,
        sum_y2,
    }
}

/// Fits an unweighted, fixed-effect-free least-squares design on its groups
/// of identical regressor rows.
pub(crate) fn fit_compressed(
    design: &ModelDesign,
    config: &EstimationConfig,
) -> Result<FitCore, EstimationError> {
    if design.fixef.is_some() || design.is_weighted() || design.z.is_some() {
        return Err(EstimationError::NotSupported(
            "compression needs an unweighted least squares model without fixed effects".to_string(),
        ));
    }

    let groups = group_identical_rows(design);

    let sqrt_n = groups.counts.mapv(f64::sqrt);
    let mean_y = &groups.sum_y / &groups.counts;
    let xw = scale_rows(groups.x.view(), sqrt_n.view());
    let yw = &mean_y * &sqrt_n;

    let collinear = check_collinearity(xw.view(), &design.x_names, config.collin_tol);
    if collinear.kept.is_empty() {
        return Err(EstimationError::AllRegressorsCollinear(collinear.dropped));
    }
    let xw = xw.select(Axis(1), &collinear.kept);
    if design.nobs() <= collinear.kept.len() {
        return Err(EstimationError::InsufficientObservations {
            nobs: design.nobs(),
            params: collinear.kept.len(),
        });
    }
    let solution = if xw.nrows() > xw.ncols() {
        least_squares(xw.view(), yw.view())?
    } else {
        // As many groups as coefficients: the group means are fitted exactly,
        // but the QR solver wants a tall matrix, so pad with a zero row.
        let mut padded = Array2::<f64>::zeros((xw.nrows() + 1, xw.ncols()));
        padded.slice_mut(ndarray::s![..xw.nrows(), ..]).assign(&xw);
        let mut padded_y = Array1::<f64>::zeros(yw.len() + 1);
        padded_y.slice_mut(ndarray::s![..yw.len()]).assign(&yw);
        least_squares(padded.view(), padded_y.view())?
    };

    let x_kept = groups.x.select(Axis(1), &collinear.kept);
    let group_fit = x_kept.dot(&solution.beta);
    let rss = Array1::from_shape_fn(group_fit.len(), |g| {
        let yhat = group_fit[g];
        groups.counts[g] * yhat * yhat - 2.0 * yhat * groups.sum_y[g] + groups.sum_y2[g]
    });

    let fitted = Array1::from_iter(groups.ids.iter().map(|&g| group_fit[g]));
    let residuals = &design.y - &fitted;
    let scores_x = design.x.select(Axis(1), &collinear.kept);
    let moments = CompressedMoments {
        x: x_kept,
        rss,
        counts: groups.counts,
    };
    log::info!(
        "Compressed {} observations into {} groups of identical regressors.",
        design.nobs(),
        moments.n_groups()
    );

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
        working_residuals: residuals.clone(),
        residuals,
        collinear,
        demean_converged: true,
        iwls: None,
        scores_x,
        outcome: Some(design.y.clone()),
        compressed: Some(moments),
    })
}
