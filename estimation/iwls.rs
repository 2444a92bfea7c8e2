//! # Poisson Pseudo-Maximum Likelihood
//!
//! Iteratively re-weighted least squares with a log link. Each iteration
//! builds the working outcome `z = eta + (y - mu) / mu`, demeans `z` and the
//! regressors with weights `mu`, and solves a weighted least-squares step.
//!
//! Demeaning is warm-started: the input of each iteration is the previous
//! demeaned column plus the change of the raw column. Under the new weights
//! this has the same projection as the raw column, but it is already close to
//! orthogonal to the fixed effects, so few sweeps are needed.

use crate::cache::DemeanCache;
use crate::collinear::{CollinearityReport, check_collinearity_within};
use crate::config::EstimationConfig;
use crate::demean::demean;
use crate::estimate::EstimationError;
use crate::fit::{Estimator, FitCore, check_demean_convergence, least_squares, scale_rows};
use crate::model::{ModelDesign, ModelFamily};
use ndarray::{Array1, Array2, Axis, concatenate, s};
use serde::Serialize;

/// How the IWLS loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct IwlsSummary {
    pub iterations: usize,
    pub deviance: f64,
    pub converged: bool,
}

pub(crate) struct PoissonPseudoLikelihood;

/// Poisson deviance `2 * sum(y log(y / mu) - (y - mu))`, with `0 log 0 = 0`.
pub fn poisson_deviance(y: &Array1<f64>, mu: &Array1<f64>) -> f64 {
    2.0 * y
        .iter()
        .zip(mu.iter())
        .map(|(&yi, &mi)| {
            let log_term = if yi > 0.0 { yi * (yi / mi).ln() } else { 0.0 };
            log_term - (yi - mi)
        })
        .sum::<f64>()
}

impl Estimator for PoissonPseudoLikelihood {
    // The cache is keyed on fixed prior weights; IWLS weights change every
    // iteration, so demeaning here bypasses it.
    fn fit(
        &self,
        design: &ModelDesign,
        config: &EstimationConfig,
        _: &mut DemeanCache,
    ) -> Result<FitCore, EstimationError> {
        let y = &design.y;
        if y.iter().any(|&v| v < 0.0) {
            return Err(EstimationError::NegativeOutcome(design.y_name.clone()));
        }
        let mean_y = y.mean().unwrap_or(0.0);
        if mean_y <= 0.0 {
            return Err(EstimationError::NotSupported(format!(
                "Poisson outcome '{}' is zero for every observation",
                design.y_name
            )));
        }

        let k_all = design.x.ncols();
        let mut mu = y.mapv(|v| (v + mean_y) / 2.0);
        let mut eta = mu.mapv(f64::ln);
        let mut deviance = poisson_deviance(y, &mu);

        let mut raw_z_prev: Option<Array1<f64>> = None;
        let mut demeaned: Option<Array2<f64>> = None;
        let mut collinear: Option<CollinearityReport> = None;
        let mut demean_converged = true;
        let mut converged = false;
        let mut iterations = 0;
        let mut last_step = None;

        for iteration in 1..=config.iwls_maxiter {
            iterations = iteration;
            let z = &eta + &((y - &mu) / &mu);

            let block = match design.fixef.as_ref() {
                Some(fixef) => {
                    let input = match (raw_z_prev.as_ref(), demeaned.as_ref()) {
                        (Some(z_prev), Some(previous)) => {
                            let mut input = previous.clone();
                            let mut z_column = input.column_mut(0);
                            z_column += &z;
                            z_column -= z_prev;
                            input
                        }
                        _ => concatenate![Axis(1), z.view().insert_axis(Axis(1)), design.x.view()],
                    };
                    let outcome = demean(
                        input.view(),
                        fixef,
                        mu.view(),
                        config.fixef_tol,
                        config.fixef_maxiter,
                    );
                    demean_converged &= outcome.converged;
                    outcome.values
                }
                None => concatenate![Axis(1), z.view().insert_axis(Axis(1)), design.x.view()],
            };

            let sqrt_w = mu.mapv(f64::sqrt);
            let z_tilde = block.column(0).to_owned();
            let x_tilde = block.slice(s![.., 1..]).to_owned();
            let xw_all = scale_rows(x_tilde.view(), sqrt_w.view());

            let report = match collinear.take() {
                Some(report) => report,
                None => {
                    let raw = scale_rows(design.x.view(), sqrt_w.view());
                    let report = check_collinearity_within(
                        xw_all.view(),
                        raw.view(),
                        &design.x_names,
                        config.collin_tol,
                    );
                    if report.kept.is_empty() {
                        return Err(EstimationError::AllRegressorsCollinear(report.dropped));
                    }
                    report
                }
            };
            let xw = xw_all.select(Axis(1), &report.kept);
            let zw = &z_tilde * &sqrt_w;
            let solution = least_squares(xw.view(), zw.view())?;
            let x_kept = x_tilde.select(Axis(1), &report.kept);
            let resid = &z_tilde - &x_kept.dot(&solution.beta);

            eta = &z - &resid;
            mu = eta.mapv(f64::exp);
            let new_deviance = poisson_deviance(y, &mu);
            let change = (new_deviance - deviance).abs() / (0.1 + deviance.abs());
            log::debug!(
                "IWLS iteration {iteration}: deviance {new_deviance:.8}, relative change {change:.3e}"
            );
            deviance = new_deviance;

            raw_z_prev = Some(z);
            demeaned = Some(block);
            collinear = Some(report);
            last_step = Some((solution, xw, sqrt_w, change));
            if change < config.iwls_tol {
                converged = true;
                break;
            }
        }

        let (Some((solution, xw, sqrt_w, change)), Some(collinear)) = (last_step, collinear)
        else {
            return Err(EstimationError::IwlsDidNotConverge {
                max_iterations: config.iwls_maxiter,
                last_change: f64::NAN,
            });
        };

        check_demean_convergence(demean_converged, config)?;
        if !converged {
            if config.strict {
                return Err(EstimationError::IwlsDidNotConverge {
                    max_iterations: config.iwls_maxiter,
                    last_change: change,
                });
            }
            log::warn!(
                "IWLS did not converge after {} iterations (last relative deviance change {:.3e}).",
                config.iwls_maxiter,
                change
            );
        }
        log::debug!("Poisson fit used {k_all} regressors, kept {}.", collinear.kept.len());

        // Scores of the Poisson likelihood are x_i (y_i - mu_i); with
        // sqrt(mu)-scaled regressors the working residual is (y - mu) / sqrt(mu).
        let response_residuals = y - &mu;
        let working_residuals = &response_residuals / &sqrt_w;

        Ok(FitCore {
            family: ModelFamily::Poisson,
            coef_names: collinear
                .kept
                .iter()
                .map(|&j| design.x_names[j].clone())
                .collect(),
            beta: solution.beta,
            bread: solution.bread,
            fitted: mu,
            residuals: response_residuals,
            collinear,
            demean_converged,
            iwls: Some(IwlsSummary {
                iterations,
                deviance,
                converged,
            }),
            scores_x: xw,
            working_residuals,
            outcome: None,
            compressed: None,
        })
    }
}
