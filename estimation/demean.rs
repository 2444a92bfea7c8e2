//! # Demeaning by Alternating Projections
//!
//! Absorbing fixed effects means projecting every variable onto the space
//! orthogonal to all fixed-effect indicators. With one effect that is a single
//! subtraction of (weighted) group means. With several effects the projection
//! has no closed form, so we sweep over the effects, subtracting each one's
//! group means in turn, until the sweep stops moving the data.
//!
//! Columns are independent problems. They are demeaned in parallel, and each
//! column carries its own convergence decision, so the result for a variable
//! never depends on which other variables were demeaned alongside it. The
//! demeaning cache relies on this.

use crate::fixef::FixedEffects;
use ndarray::parallel::prelude::*;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, ArrayViewMut1, Axis};

/// The result of demeaning a block of columns.
#[derive(Debug, Clone)]
pub struct DemeanOutcome {
    pub values: Array2<f64>,
    /// Whether each column met the tolerance, in column order.
    pub column_converged: Vec<bool>,
    /// True only if every column met the tolerance.
    pub converged: bool,
    /// The largest number of sweeps any column needed.
    pub sweeps: usize,
}

/// Projects the fixed effects out of every column of `x`.
///
/// `weights` must have one entry per row. A column is converged once no
/// effect's weighted group means exceed `tol` in absolute value after a full
/// sweep, i.e. the next sweep would move no value by more than `tol` per
/// effect. With a single effect this holds after exactly one sweep.
pub fn demean(
    x: ArrayView2<f64>,
    fixef: &FixedEffects,
    weights: ArrayView1<f64>,
    tol: f64,
    max_iter: usize,
) -> DemeanOutcome {
    let group_weights: Vec<Vec<f64>> = (0..fixef.n_effects())
        .map(|effect| fixef.level_sums(effect, weights.iter().copied()))
        .collect();

    let mut values = x.to_owned();
    let per_column: Vec<(bool, usize)> = values
        .axis_iter_mut(Axis(1))
        .into_par_iter()
        .map(|mut column| {
            demean_column(
                &mut column,
                fixef,
                weights,
                &group_weights,
                tol,
                max_iter,
            )
        })
        .collect();

    let column_converged: Vec<bool> = per_column.iter().map(|&(ok, _)| ok).collect();
    let converged = column_converged.iter().all(|&ok| ok);
    let sweeps = per_column.iter().map(|&(_, n)| n).max().unwrap_or(0);
    if !converged {
        log::debug!(
            "Demeaning stopped at {max_iter} sweeps with {} of {} columns unconverged.",
            per_column.iter().filter(|&&(ok, _)| !ok).count(),
            per_column.len()
        );
    }

    DemeanOutcome {
        values,
        column_converged,
        converged,
        sweeps,
    }
}

/// Single-column convenience wrapper around [`demean`].
pub fn demean_vector(
    x: ArrayView1<f64>,
    fixef: &FixedEffects,
    weights: ArrayView1<f64>,
    tol: f64,
    max_iter: usize,
) -> (Array1<f64>, bool) {
    let block = x.insert_axis(Axis(1));
    let outcome = demean(block, fixef, weights, tol, max_iter);
    let column = outcome.values.column(0).to_owned();
    (column, outcome.converged)
}

fn demean_column(
    column: &mut ArrayViewMut1<f64>,
    fixef: &FixedEffects,
    weights: ArrayView1<f64>,
    group_weights: &[Vec<f64>],
    tol: f64,
    max_iter: usize,
) -> (bool, usize) {
    let n_effects = fixef.n_effects();
    if n_effects == 0 {
        return (true, 0);
    }
    let mut means: Vec<Vec<f64>> = (0..n_effects)
        .map(|effect| vec![0.0; fixef.n_levels(effect)])
        .collect();

    for sweep in 1..=max_iter {
        for effect in 0..n_effects {
            let ids = fixef.ids(effect);
            group_means(column, ids, weights, &group_weights[effect], &mut means[effect]);
            for (value, &level) in column.iter_mut().zip(ids) {
                *value -= means[effect][level];
            }
        }

        // The last projection zeroed its own means, so only the earlier
        // effects can still be off.
        let mut largest = 0.0f64;
        for effect in 0..n_effects - 1 {
            let ids = fixef.ids(effect);
            group_means(column, ids, weights, &group_weights[effect], &mut means[effect]);
            largest = means[effect]
                .iter()
                .fold(largest, |acc, mean| acc.max(mean.abs()));
        }
        if largest < tol {
            return (true, sweep);
        }
    }
    (false, max_iter)
}

fn group_means(
    column: &ArrayViewMut1<f64>,
    ids: &[usize],
    weights: ArrayView1<f64>,
    group_weights: &[f64],
    means: &mut [f64],
) {
    means.iter_mut().for_each(|m| *m = 0.0);
    for ((value, &level), weight) in column.iter().zip(ids).zip(weights.iter()) {
        means[level] += weight * value;
    }
    for (mean, &total) in means.iter_mut().zip(group_weights) {
        *mean = if total > 0.0 { *mean / total } else { 0.0 };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{Array2, array};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn random_effects(rng: &mut StdRng, n: usize, levels: &[usize]) -> FixedEffects {
        let names = (0..levels.len()).map(|i| format!("f{i}")).collect();
        let labels = levels
            .iter()
            .map(|&l| (0..n).map(|_| rng.gen_range(0..l)).collect::<Vec<usize>>())
            .collect();
        FixedEffects::from_labels(names, labels)
    }

    #[test]
    fn single_effect_converges_in_one_sweep_with_zero_weighted_group_sums() {
        let mut rng = StdRng::seed_from_u64(42);
        let n = 500;
        let fe = random_effects(&mut rng, n, &[25]);
        let x = Array2::from_shape_fn((n, 2), |_| rng.r#gen::<f64>() * 10.0);
        let w = Array1::from_shape_fn(n, |_| 0.5 + rng.r#gen::<f64>());

        let outcome = demean(x.view(), &fe, w.view(), 1e-10, 100);
        assert!(outcome.converged);
        assert_eq!(outcome.sweeps, 1);

        for col in outcome.values.columns() {
            let weighted: Vec<f64> = col.iter().zip(w.iter()).map(|(v, w)| v * w).collect();
            for sum in fe.level_sums(0, weighted.into_iter()) {
                assert_abs_diff_eq!(sum, 0.0, epsilon = 1e-9);
            }
        }
    }

    #[test]
    fn two_effects_reach_the_joint_projection() {
        let mut rng = StdRng::seed_from_u64(7);
        let n = 400;
        let fe = random_effects(&mut rng, n, &[12, 9]);
        let x = Array2::from_shape_fn((n, 1), |_| rng.r#gen::<f64>());
        let w = Array1::ones(n);

        let outcome = demean(x.view(), &fe, w.view(), 1e-12, 10_000);
        assert!(outcome.converged);
        assert!(outcome.sweeps > 1);
        for effect in 0..2 {
            for sum in fe.level_sums(effect, outcome.values.column(0).iter().copied()) {
                assert_abs_diff_eq!(sum, 0.0, epsilon = 1e-8);
            }
        }
    }

    #[test]
    fn relabeling_levels_leaves_the_projection_unchanged() {
        let mut rng = StdRng::seed_from_u64(3);
        let n = 300;
        let fe = random_effects(&mut rng, n, &[10, 6]);
        let x = Array2::from_shape_fn((n, 2), |_| rng.r#gen::<f64>());
        let w = Array1::from_shape_fn(n, |_| 1.0 + rng.r#gen::<f64>());

        // Reverse the level labels of both effects and rebuild the encoding.
        let relabeled_ids: Vec<Vec<String>> = (0..2)
            .map(|effect| {
                let levels = fe.n_levels(effect);
                fe.ids(effect)
                    .iter()
                    .map(|&id| format!("L{}", levels - 1 - id))
                    .collect()
            })
            .collect();
        let relabeled = FixedEffects::from_labels(fe.names().to_vec(), relabeled_ids);

        let a = demean(x.view(), &fe, w.view(), 1e-12, 10_000);
        let b = demean(x.view(), &relabeled, w.view(), 1e-12, 10_000);
        for (u, v) in a.values.iter().zip(b.values.iter()) {
            assert_abs_diff_eq!(u, v, epsilon = 1e-9);
        }
    }

    #[test]
    fn columns_do_not_depend_on_their_neighbours() {
        let mut rng = StdRng::seed_from_u64(11);
        let n = 200;
        let fe = random_effects(&mut rng, n, &[8, 5]);
        let x = Array2::from_shape_fn((n, 3), |_| rng.r#gen::<f64>());
        let w = Array1::ones(n);

        let together = demean(x.view(), &fe, w.view(), 1e-8, 1000);
        let (alone, converged) = demean_vector(x.column(1), &fe, w.view(), 1e-8, 1000);
        assert!(converged);
        assert_eq!(together.values.column(1).to_vec(), alone.to_vec());
    }

    #[test]
    fn reports_non_convergence_when_capped() {
        let mut rng = StdRng::seed_from_u64(5);
        let n = 300;
        let fe = random_effects(&mut rng, n, &[20, 20]);
        // The second column is already centred and settles in one sweep.
        let x = Array2::from_shape_fn((n, 2), |(_, j)| {
            if j == 0 { rng.r#gen::<f64>() } else { 0.0 }
        });
        let outcome = demean(x.view(), &fe, Array1::ones(n).view(), 1e-14, 1);
        assert!(!outcome.converged);
        assert_eq!(outcome.column_converged, vec![false, true]);
    }

    #[test]
    fn zero_weight_groups_are_left_alone() {
        let fe = FixedEffects::from_labels(vec!["g".into()], vec![vec![0, 0, 1]]);
        let x = array![[1.0], [3.0], [5.0]];
        let w = array![1.0, 1.0, 0.0];
        let outcome = demean(x.view(), &fe, w.view(), 1e-10, 10);
        assert_eq!(outcome.values.column(0).to_vec(), vec![-1.0, 1.0, 5.0]);
    }
}
