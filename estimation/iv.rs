//! Two-stage least squares on demeaned data.
//!
//! The first stage projects the regressors onto the instrument space through
//! a QR basis of the weighted instruments. The second stage regresses the
//! outcome on the projections, while residuals are formed with the actual
//! regressors.

use crate::cache::DemeanCache;
use crate::collinear::check_collinearity_within;
use crate::config::EstimationConfig;
use crate::estimate::EstimationError;
use crate::fit::{Estimator, FitCore, demean_design, least_squares, scale_rows};
use crate::model::{ModelDesign, ModelFamily};
use ndarray::{Array2, ArrayView2, Axis};
use ndarray_linalg::QR;

pub(crate) struct TwoStageLeastSquares;

/// Orthogonal projection of the columns of `x` onto the column space of `z`.
pub(crate) fn project_onto(
    z: ArrayView2<f64>,
    x: ArrayView2<f64>,
) -> Result<Array2<f64>, EstimationError> {
    let (q, _) = z.qr().map_err(EstimationError::LinearSystemSolveFailed)?;
    Ok(q.dot(&q.t().dot(&x)))
}

impl Estimator for TwoStageLeastSquares {
    fn fit(
        &self,
        design: &ModelDesign,
        config: &EstimationConfig,
        cache: &mut DemeanCache,
    ) -> Result<FitCore, EstimationError> {
        let demeaned = demean_design(design, config, cache)?;
        let z = demeaned.z.ok_or_else(|| {
            EstimationError::NotSupported("an IV model needs instruments".to_string())
        })?;
        let sqrt_w = design.sqrt_weights();
        let xw = scale_rows(demeaned.x.view(), sqrt_w.view());
        let zw = scale_rows(z.view(), sqrt_w.view());
        let yw = &demeaned.y * &sqrt_w;

        let raw_x = scale_rows(design.x.view(), sqrt_w.view());
        let collinear =
            check_collinearity_within(xw.view(), raw_x.view(), &design.x_names, config.collin_tol);
        if collinear.kept.is_empty() {
            return Err(EstimationError::AllRegressorsCollinear(collinear.dropped));
        }
        let raw_z = design
            .z
            .as_ref()
            .map_or_else(|| zw.clone(), |z| scale_rows(z.view(), sqrt_w.view()));
        let instruments =
            check_collinearity_within(zw.view(), raw_z.view(), &design.z_names, config.collin_tol);
        if instruments.kept.len() < collinear.kept.len() {
            return Err(EstimationError::Underidentified {
                endogenous: collinear.kept.len(),
                instruments: instruments.kept.len(),
            });
        }

        let xw = xw.select(Axis(1), &collinear.kept);
        let zw = zw.select(Axis(1), &instruments.kept);
        let x = demeaned.x.select(Axis(1), &collinear.kept);

        let x_hat = project_onto(zw.view(), xw.view())?;
        let solution = least_squares(x_hat.view(), yw.view())?;
        log::debug!(
            "2SLS with {} regressors and {} instruments on {} observations.",
            xw.ncols(),
            zw.ncols(),
            design.nobs()
        );

        let residuals = &demeaned.y - &x.dot(&solution.beta);
        let fitted = &design.y - &residuals;
        let working_residuals = &yw - &xw.dot(&solution.beta);

        Ok(FitCore {
            family: ModelFamily::Iv,
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
            scores_x: x_hat,
            working_residuals,
            outcome: None,
            compressed: None,
        })
    }
}
