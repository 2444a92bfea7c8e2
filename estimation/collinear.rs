//! # Collinearity Detection
//!
//! Regressors that are (numerically) linear combinations of earlier
//! regressors are removed before solving. Detection runs a Cholesky
//! factorization of the Gram matrix that skips a column whenever its
//! remaining pivot is too small relative to a reference squared norm. Skipped
//! columns do not enter later pivots, so the first of two duplicates is kept.
//!
//! On demeaned data the reference is the norm before demeaning: a regressor
//! absorbed by the fixed effects is left with rounding noise only, which is
//! collinear with nothing but still tiny next to the original column.

use ndarray::{Array2, ArrayView1, ArrayView2};
use serde::{Deserialize, Serialize};

/// Which regressors survived the collinearity check.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CollinearityReport {
    /// Positions (in the original regressor order) that were kept.
    pub kept: Vec<usize>,
    /// Names of the regressors that were dropped, in original order.
    pub dropped: Vec<String>,
}

impl CollinearityReport {
    pub fn has_dropped(&self) -> bool {
        !self.dropped.is_empty()
    }
}

/// Reference squared norm of a column: the larger of its own squared norm
/// and that of the same column before demeaning.
pub fn reference_scale(own: f64, raw: ArrayView1<f64>) -> f64 {
    raw.dot(&raw).max(own)
}

/// Whether a pivot is too small to tell the column apart from the ones
/// already kept.
pub fn is_negligible_pivot(pivot: f64, scale: f64, tol: f64) -> bool {
    pivot <= tol * scale || pivot <= 0.0
}

/// Flags columns of the Gram matrix `xtx` that are collinear with earlier
/// columns. A column is flagged when its Cholesky pivot falls to at most
/// `tol` times its entry in `scale`.
pub fn find_collinear_columns(xtx: ArrayView2<f64>, scale: &[f64], tol: f64) -> Vec<bool> {
    let k = xtx.nrows();
    let mut r = Array2::<f64>::zeros((k, k));
    let mut excluded = vec![false; k];

    for j in 0..k {
        let mut pivot = xtx[[j, j]];
        for p in 0..j {
            if !excluded[p] {
                pivot -= r[[p, j]] * r[[p, j]];
            }
        }
        if is_negligible_pivot(pivot, scale[j], tol) {
            excluded[j] = true;
            continue;
        }

        let root = pivot.sqrt();
        r[[j, j]] = root;
        for i in (j + 1)..k {
            let mut value = xtx[[i, j]];
            for p in 0..j {
                if !excluded[p] {
                    value -= r[[p, i]] * r[[p, j]];
                }
            }
            r[[j, i]] = value / root;
        }
    }
    excluded
}

/// Runs the check on a design, relative to the columns' own norms.
pub fn check_collinearity(x: ArrayView2<f64>, names: &[String], tol: f64) -> CollinearityReport {
    check_collinearity_within(x, x, names, tol)
}

/// Runs the check on a demeaned design `x`, relative to the norms of the same
/// columns in `raw`, and names the casualties.
pub fn check_collinearity_within(
    x: ArrayView2<f64>,
    raw: ArrayView2<f64>,
    names: &[String],
    tol: f64,
) -> CollinearityReport {
    let xtx = x.t().dot(&x);
    let scale: Vec<f64> = raw
        .columns()
        .into_iter()
        .zip(xtx.diag())
        .map(|(column, &own)| reference_scale(own, column))
        .collect();
    let excluded = find_collinear_columns(xtx.view(), &scale, tol);

    let mut report = CollinearityReport::default();
    for (j, &dropped) in excluded.iter().enumerate() {
        if dropped {
            report.dropped.push(names[j].clone());
        } else {
            report.kept.push(j);
        }
    }
    if report.has_dropped() {
        log::warn!(
            "The following variables are collinear with other regressors (or absorbed by the fixed effects) and were dropped: {}",
            report.dropped.join(", ")
        );
    }
    report
}
