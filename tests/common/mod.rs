//! Synthetic panels with known coefficients.

use hdfe::Dataset;
use polars::prelude::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal, Poisson};

pub const BETA_X1: f64 = 1.5;
pub const BETA_X2: f64 = -0.7;
pub const BETA_D: f64 = 2.0;
pub const POISSON_X1: f64 = 0.3;
pub const POISSON_X2: f64 = -0.2;

pub const F1_LEVELS: usize = 20;
pub const F2_LEVELS: usize = 10;

/// Columns:
/// - `f1`, `f2`: crossed fixed effects, `g1`, `g2`: clustering variables
/// - `X1`, `X2`: exogenous regressors, `Y = 1.5 X1 - 0.7 X2 + a(f1) + b(f2) + e`
/// - `Z`, `D`, `Yiv`: an instrument, an endogenous regressor and its outcome
/// - `C`: Poisson counts with log mean `0.3 X1 - 0.2 X2 + a(f1) / 4`
/// - `W`: positive weights, `T`: a binary treatment with no effect on `Y`
pub fn panel(n: usize, seed: u64) -> DataFrame {
    let mut rng = StdRng::seed_from_u64(seed);
    let normal = Normal::new(0.0, 1.0).unwrap();
    let f1_effects: Vec<f64> = (0..F1_LEVELS).map(|_| normal.sample(&mut rng) * 2.0).collect();
    let f2_effects: Vec<f64> = (0..F2_LEVELS).map(|_| normal.sample(&mut rng)).collect();

    let mut f1 = Vec::with_capacity(n);
    let mut f2 = Vec::with_capacity(n);
    let mut g1 = Vec::with_capacity(n);
    let mut g2 = Vec::with_capacity(n);
    let mut x1 = Vec::with_capacity(n);
    let mut x2 = Vec::with_capacity(n);
    let mut y = Vec::with_capacity(n);
    let mut z = Vec::with_capacity(n);
    let mut d = Vec::with_capacity(n);
    let mut yiv = Vec::with_capacity(n);
    let mut counts = Vec::with_capacity(n);
    let mut weights = Vec::with_capacity(n);
    let mut treatment = Vec::with_capacity(n);

    for i in 0..n {
        let a = i % F1_LEVELS;
        let b = rng.gen_range(0..F2_LEVELS);
        let xa: f64 = normal.sample(&mut rng) + 0.1 * f1_effects[a];
        let xb: f64 = normal.sample(&mut rng);
        let noise: f64 = normal.sample(&mut rng);

        let instrument: f64 = normal.sample(&mut rng);
        let confounder: f64 = normal.sample(&mut rng);
        let endogenous = 0.8 * instrument + confounder + 0.5 * normal.sample(&mut rng);
        let iv_outcome =
            BETA_D * endogenous + 0.5 * xa + 1.5 * confounder + normal.sample(&mut rng);

        let log_mean = POISSON_X1 * xa + POISSON_X2 * xb + f1_effects[a] / 4.0;
        let count = Poisson::new(log_mean.exp()).unwrap().sample(&mut rng);

        f1.push(format!("a{a}"));
        f2.push(format!("b{b}"));
        g1.push((i / 10) as i64);
        g2.push(rng.gen_range(0..15i64));
        x1.push(xa);
        x2.push(xb);
        y.push(BETA_X1 * xa + BETA_X2 * xb + f1_effects[a] + f2_effects[b] + noise);
        z.push(instrument);
        d.push(endogenous);
        yiv.push(iv_outcome);
        counts.push(count);
        weights.push(0.5 + rng.r#gen::<f64>());
        treatment.push(f64::from(rng.gen_bool(0.5)));
    }

    df!(
        "f1" => f1,
        "f2" => f2,
        "g1" => g1,
        "g2" => g2,
        "X1" => x1,
        "X2" => x2,
        "Y" => y,
        "Z" => z,
        "D" => d,
        "Yiv" => yiv,
        "C" => counts,
        "W" => weights,
        "T" => treatment
    )
    .unwrap()
}

pub fn dataset(n: usize, seed: u64) -> Dataset {
    Dataset::new(panel(n, seed))
}
