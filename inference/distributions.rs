//! Reference distributions for coefficient tests and for Monte-Carlo
//! proportions.

use statrs::distribution::{Beta, ContinuousCDF, Normal, StudentsT};

/// The distribution a test statistic is compared against.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Reference {
    /// Student's t with the given degrees of freedom.
    StudentT(f64),
    StandardNormal,
}

impl Reference {
    /// Two-sided p-value `P(|T| >= |stat|)`.
    pub fn two_sided_pvalue(&self, stat: f64) -> f64 {
        if !stat.is_finite() {
            return f64::NAN;
        }
        match *self {
            Reference::StudentT(df) => match StudentsT::new(0.0, 1.0, df) {
                Ok(dist) => 2.0 * dist.sf(stat.abs()),
                Err(_) => f64::NAN,
            },
            Reference::StandardNormal => 2.0 * standard_normal_sf(stat.abs()),
        }
    }

    /// The `1 - (1 - level) / 2` quantile, used for symmetric intervals.
    pub fn critical_value(&self, level: f64) -> f64 {
        let upper = 1.0 - (1.0 - level) / 2.0;
        match *self {
            Reference::StudentT(df) => match StudentsT::new(0.0, 1.0, df) {
                Ok(dist) => dist.inverse_cdf(upper),
                Err(_) => f64::NAN,
            },
            Reference::StandardNormal => normal_quantile(upper),
        }
    }
}

fn standard_normal_sf(z: f64) -> f64 {
    match Normal::new(0.0, 1.0) {
        Ok(dist) => dist.sf(z),
        Err(_) => f64::NAN,
    }
}

pub fn normal_quantile(p: f64) -> f64 {
    match Normal::new(0.0, 1.0) {
        Ok(dist) => dist.inverse_cdf(p),
        Err(_) => f64::NAN,
    }
}

/// Normal-approximation interval for a proportion, clamped to `[0, 1]`.
pub fn wald_interval(p: f64, se: f64, level: f64) -> (f64, f64) {
    let z = normal_quantile(1.0 - (1.0 - level) / 2.0);
    ((p - z * se).max(0.0), (p + z * se).min(1.0))
}

/// Exact binomial (Clopper–Pearson) interval for `successes` out of `trials`.
pub fn clopper_pearson(successes: usize, trials: usize, level: f64) -> (f64, f64) {
    let alpha = 1.0 - level;
    let x = successes as f64;
    let n = trials as f64;

    let lower = if successes == 0 {
        0.0
    } else {
        match Beta::new(x, n - x + 1.0) {
            Ok(dist) => dist.inverse_cdf(alpha / 2.0),
            Err(_) => f64::NAN,
        }
    };
    let upper = if successes >= trials {
        1.0
    } else {
        match Beta::new(x + 1.0, n - x) {
            Ok(dist) => dist.inverse_cdf(1.0 - alpha / 2.0),
            Err(_) => f64::NAN,
        }
    };
    (lower, upper)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn normal_reference_values() {
        let z = Reference::StandardNormal;
        assert_abs_diff_eq!(z.two_sided_pvalue(1.959963984540054), 0.05, epsilon = 1e-9);
        assert_abs_diff_eq!(z.critical_value(0.95), 1.959963984540054, epsilon = 1e-6);
    }

    #[test]
    fn student_t_is_wider_than_normal_and_converges_to_it() {
        let small = Reference::StudentT(5.0);
        let large = Reference::StudentT(1e6);
        assert!(small.two_sided_pvalue(2.0) > Reference::StandardNormal.two_sided_pvalue(2.0));
        assert_abs_diff_eq!(
            large.two_sided_pvalue(2.0),
            Reference::StandardNormal.two_sided_pvalue(2.0),
            epsilon = 1e-5
        );
        // t(5) 97.5% quantile.
        assert_abs_diff_eq!(small.critical_value(0.95), 2.570581835636314, epsilon = 1e-4);
    }

    #[test]
    fn clopper_pearson_edges_and_coverage() {
        let (lo, hi) = clopper_pearson(0, 100, 0.95);
        assert_eq!(lo, 0.0);
        assert_abs_diff_eq!(hi, 0.03621669264517642, epsilon = 1e-4);

        let (lo, hi) = clopper_pearson(50, 100, 0.95);
        assert!(lo < 0.5 && hi > 0.5);
        assert_abs_diff_eq!(lo, 0.3983211, epsilon = 1e-4);
        assert_abs_diff_eq!(hi, 0.6016789, epsilon = 1e-4);

        assert_eq!(clopper_pearson(100, 100, 0.95).1, 1.0);
    }

    #[test]
    fn wald_interval_is_clamped() {
        let (lo, hi) = wald_interval(0.01, 0.02, 0.95);
        assert_eq!(lo, 0.0);
        assert!(hi > 0.01 && hi < 1.0);
    }
}
