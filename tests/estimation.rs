mod common;

use approx::assert_abs_diff_eq;
use common::{BETA_D, BETA_X1, BETA_X2, F1_LEVELS, F2_LEVELS, POISSON_X1, POISSON_X2};
use hdfe::config::FixefRemoval;
use hdfe::estimate::EstimationError;
use hdfe::inference::ssc::{ClusterDf, FixefK};
use hdfe::{Dataset, EstimationConfig, SscConfig, VcovType, WeightsType, feols, fepois};
use ndarray::{Array1, Array2};
use ndarray_linalg::Inverse;
use polars::prelude::*;

fn precise() -> EstimationConfig {
    EstimationConfig {
        fixef_tol: 1e-13,
        ..EstimationConfig::default()
    }
}

fn column(data: &Dataset, name: &str) -> Vec<f64> {
    data.numeric_column(name)
        .unwrap()
        .into_iter()
        .map(|v| v.unwrap())
        .collect()
}

fn labels(data: &Dataset, name: &str) -> Vec<String> {
    data.categorical_column(name)
        .unwrap()
        .into_iter()
        .map(|v| v.unwrap())
        .collect()
}

#[test]
fn two_way_model_matches_dummy_variable_regression() {
    let data = common::dataset(1000, 7);
    let config = EstimationConfig {
        vcov: Some("iid".into()),
        ssc: SscConfig {
            fixef_k: FixefK::Full,
            ..SscConfig::default()
        },
        ..precise()
    };
    let fits = feols("Y ~ X1 + X2 | f1 + f2", &data, &config).unwrap();
    let fit = fits.fetch_model(0).unwrap();
    assert!(fit.converged());
    assert_eq!(fit.coef_names(), ["X1", "X2"]);
    assert_abs_diff_eq!(fit.coefficient("X1").unwrap(), BETA_X1, epsilon = 0.1);
    assert_abs_diff_eq!(fit.coefficient("X2").unwrap(), BETA_X2, epsilon = 0.1);

    // Explicit dummies: all levels of f1, all but the first of f2.
    let n = data.nrows();
    let f1 = labels(&data, "f1");
    let f2 = labels(&data, "f2");
    let f1_levels: Vec<String> = (0..F1_LEVELS).map(|a| format!("a{a}")).collect();
    let f2_levels: Vec<String> = (1..F2_LEVELS).map(|b| format!("b{b}")).collect();
    let k = 2 + f1_levels.len() + f2_levels.len();
    let x1 = column(&data, "X1");
    let x2 = column(&data, "X2");
    let mut x = Array2::<f64>::zeros((n, k));
    for i in 0..n {
        x[[i, 0]] = x1[i];
        x[[i, 1]] = x2[i];
        for (j, level) in f1_levels.iter().enumerate() {
            if &f1[i] == level {
                x[[i, 2 + j]] = 1.0;
            }
        }
        for (j, level) in f2_levels.iter().enumerate() {
            if &f2[i] == level {
                x[[i, 2 + f1_levels.len() + j]] = 1.0;
            }
        }
    }
    let y = Array1::from(column(&data, "Y"));
    let xtx_inv = x.t().dot(&x).inv().unwrap();
    let beta = xtx_inv.dot(&x.t().dot(&y));
    let resid = &y - &x.dot(&beta);
    let sigma2 = resid.dot(&resid) / (n - k) as f64;

    let se = fit.standard_errors();
    for j in 0..2 {
        assert_abs_diff_eq!(fit.coefficients()[j], beta[j], epsilon = 1e-8);
        assert_abs_diff_eq!(se[j], (sigma2 * xtx_inv[[j, j]]).sqrt(), epsilon = 1e-8);
    }
    assert_eq!(fit.vcov_info().df_t, (n - k) as f64);
}

#[test]
fn two_way_clustering_is_inclusion_exclusion() {
    let data = common::dataset(600, 11);
    let fits = feols("Y ~ X1 + X2 | f1", &data, &precise()).unwrap();
    let fit = fits.fetch_model(0).unwrap();
    let ssc = SscConfig {
        cluster_df: ClusterDf::Conventional,
        ..SscConfig::default()
    };
    let vcov = |spec: &str| {
        fit.vcov_with_ssc(&data, &spec.parse::<VcovType>().unwrap(), &ssc)
            .unwrap()
            .vcov_matrix()
            .to_owned()
    };
    let both = vcov("CRV1:g1+g2");
    let combined = vcov("CRV1:g1") + vcov("CRV1:g2") - vcov("CRV1:g1^g2");
    for (a, b) in both.iter().zip(combined.iter()) {
        assert_abs_diff_eq!(a, b, epsilon = 1e-12);
    }
    let clustered = fit
        .vcov_with_ssc(&data, &VcovType::crv1(&["g1", "g2"]), &ssc)
        .unwrap();
    assert_eq!(clustered.vcov_info().cluster_groups, vec![60, 15]);
    assert_eq!(clustered.vcov_info().df_t, 14.0);
    // The primary estimates are untouched by the new covariance.
    assert_eq!(clustered.coefficients(), fit.coefficients());
}

#[test]
fn crv3_matches_leave_one_cluster_out_refits() {
    let frame = common::panel(300, 41);
    let data = Dataset::new(frame.clone());
    let g1: Vec<i64> = frame
        .column("g1")
        .unwrap()
        .i64()
        .unwrap()
        .into_iter()
        .map(|v| v.unwrap())
        .collect();
    let y = column(&data, "Y");
    let n_clusters = 30;

    // Dropping a cluster's outcomes drops its rows from the sample.
    let mut jackknife = Array2::<f64>::zeros((n_clusters, 3));
    for c in 0..n_clusters {
        let held_out: Vec<Option<f64>> = y
            .iter()
            .zip(&g1)
            .map(|(&v, &g)| (g != c as i64).then_some(v))
            .collect();
        let mut reduced = frame.clone();
        reduced.with_column(Series::new("Y".into(), held_out)).unwrap();
        let fit = feols("Y ~ X1 + X2", &Dataset::new(reduced), &precise()).unwrap();
        let fit = fit.fetch_model(0).unwrap();
        assert_eq!(fit.nobs(), 290);
        jackknife.row_mut(c).assign(&fit.coefficients());
    }
    let centre = jackknife.mean_axis(ndarray::Axis(0)).unwrap();
    let deviations = &jackknife - &centre;
    let g = n_clusters as f64;
    let expected = deviations.t().dot(&deviations) * ((g - 1.0) / g);

    let config = EstimationConfig {
        ssc: SscConfig::none(),
        ..precise().with_vcov("CRV3:g1")
    };
    let fits = feols("Y ~ X1 + X2", &data, &config).unwrap();
    let fit = fits.fetch_model(0).unwrap();
    assert_eq!(fit.vcov_info().kind, VcovType::Crv3("g1".into()));
    for (a, b) in fit.vcov_matrix().iter().zip(expected.iter()) {
        assert_abs_diff_eq!(a, b, epsilon = 1e-10);
    }

    // Switching an iid fit over afterwards gives the same matrix.
    let iid = feols("Y ~ X1 + X2", &data, &precise().with_vcov("iid")).unwrap();
    let switched = iid
        .fetch_model(0)
        .unwrap()
        .vcov_with_ssc(&data, &"CRV3:g1".parse().unwrap(), &SscConfig::none())
        .unwrap();
    for (a, b) in switched.vcov_matrix().iter().zip(expected.iter()) {
        assert_abs_diff_eq!(a, b, epsilon = 1e-10);
    }
}

#[test]
fn interacted_fixed_effect_equals_a_combined_label() {
    let mut frame = common::panel(1000, 43);
    let data = Dataset::new(frame.clone());
    let combined: Vec<String> = labels(&data, "f1")
        .into_iter()
        .zip(labels(&data, "f2"))
        .map(|(a, b)| format!("{a}_{b}"))
        .collect();
    frame.with_column(Series::new("f12".into(), combined)).unwrap();
    let data = Dataset::new(frame);

    let config = precise().with_vcov("hetero");
    let interacted = feols("Y ~ X1 + X2 | f1^f2", &data, &config).unwrap();
    let combined = feols("Y ~ X1 + X2 | f12", &data, &config).unwrap();
    let (a, b) = (interacted.fetch_model(0).unwrap(), combined.fetch_model(0).unwrap());
    assert_eq!(a.spec().fixef_names(), vec!["f1^f2"]);
    assert_eq!(a.nobs(), b.nobs());
    for (x, y) in a.coefficients().iter().zip(b.coefficients().iter()) {
        assert_abs_diff_eq!(x, y, epsilon = 1e-10);
    }
    for (x, y) in a.standard_errors().iter().zip(b.standard_errors().iter()) {
        assert_abs_diff_eq!(x, y, epsilon = 1e-10);
    }
}

#[test]
fn nested_fixed_effects_are_not_counted_against_the_cluster() {
    let data = common::dataset(300, 47);
    let crv1 = "CRV1:g1".parse::<VcovType>().unwrap();
    let variance = |formula: &str, fixef_k: FixefK| {
        let fits = feols(formula, &data, &precise()).unwrap();
        let ssc = SscConfig {
            fixef_k,
            ..SscConfig::default()
        };
        fits.fetch_model(0)
            .unwrap()
            .vcov_with_ssc(&data, &crv1, &ssc)
            .unwrap()
            .vcov_matrix()[[0, 0]]
    };

    // g1 has 30 levels, each inside one cluster of g1.
    let none = variance("Y ~ X1 | g1", FixefK::None);
    let nested = variance("Y ~ X1 | g1", FixefK::Nested);
    let full = variance("Y ~ X1 | g1", FixefK::Full);
    assert_abs_diff_eq!(nested, none, epsilon = 1e-14);
    assert_abs_diff_eq!(full / none, 299.0 / 269.0, epsilon = 1e-10);

    // Levels of f1 span several clusters, so nothing is discounted.
    let nested = variance("Y ~ X1 | f1", FixefK::Nested);
    let full = variance("Y ~ X1 | f1", FixefK::Full);
    assert_abs_diff_eq!(nested, full, epsilon = 1e-14);
}

#[test]
fn duplicated_regressor_is_dropped_without_changing_the_fit() {
    let mut frame = common::panel(500, 3);
    let copy = frame.column("X1").unwrap().clone().with_name("X1copy".into());
    frame.with_column(copy).unwrap();
    let data = Dataset::new(frame);

    let base = feols("Y ~ X1 + X2 | f1 + f2", &data, &precise()).unwrap();
    let dup = feols("Y ~ X1 + X2 + X1copy | f1 + f2", &data, &precise()).unwrap();
    let base = base.fetch_model(0).unwrap();
    let dup = dup.fetch_model(0).unwrap();

    assert_eq!(dup.collinearity().dropped, vec!["X1copy".to_string()]);
    assert_eq!(dup.coef_names(), base.coef_names());
    for (a, b) in dup.coefficients().iter().zip(base.coefficients().iter()) {
        assert_abs_diff_eq!(a, b, epsilon = 1e-10);
    }
    for (a, b) in dup.standard_errors().iter().zip(base.standard_errors().iter()) {
        assert_abs_diff_eq!(a, b, epsilon = 1e-10);
    }
}

#[test]
fn regressor_absorbed_by_fixed_effects_is_reported() {
    let mut frame = common::panel(300, 5);
    let level: Vec<f64> = frame
        .column("g1")
        .unwrap()
        .i64()
        .unwrap()
        .into_iter()
        .map(|v| v.unwrap() as f64)
        .collect();
    frame.with_column(Series::new("G".into(), level)).unwrap();
    let data = Dataset::new(frame);
    let fit = feols("Y ~ X1 + G | g1", &data, &precise()).unwrap();
    let fit = fit.fetch_model(0).unwrap();
    assert_eq!(fit.collinearity().dropped, vec!["G".to_string()]);
    assert_eq!(fit.coef_names(), ["X1"]);

    let all = feols("Y ~ G | g1", &data, &precise());
    assert!(matches!(all, Err(EstimationError::AllRegressorsCollinear(_))));
}

#[test]
fn compression_is_lossless_for_iid_and_hetero() {
    let mut frame = common::panel(800, 13);
    let g = frame
        .column("g2")
        .unwrap()
        .cast(&DataType::Float64)
        .unwrap()
        .with_name("G2".into());
    frame.with_column(g).unwrap();
    let data = Dataset::new(frame);

    for vcov in ["iid", "hetero"] {
        let plain = EstimationConfig::default().with_vcov(vcov);
        let compressed = EstimationConfig {
            use_compression: true,
            ..plain.clone()
        };
        let a = feols("Y ~ T + G2", &data, &plain).unwrap();
        let b = feols("Y ~ T + G2", &data, &compressed).unwrap();
        let (a, b) = (a.fetch_model(0).unwrap(), b.fetch_model(0).unwrap());
        for (x, y) in a.coefficients().iter().zip(b.coefficients().iter()) {
            assert_abs_diff_eq!(x, y, epsilon = 1e-10);
        }
        for (x, y) in a.vcov_matrix().iter().zip(b.vcov_matrix().iter()) {
            assert_abs_diff_eq!(x, y, epsilon = 1e-10);
        }
    }

    let clustered = EstimationConfig {
        use_compression: true,
        ..EstimationConfig::default().with_vcov("CRV1:g1")
    };
    assert!(matches!(
        feols("Y ~ T + G2", &data, &clustered),
        Err(EstimationError::NotSupported(_))
    ));
}

#[test]
fn multiple_estimation_order_and_cache_reuse() {
    let data = common::dataset(400, 17);
    let fits = feols("Y + Yiv ~ X1 + csw0(X2, Z) | f1 + sw0(f2)", &data, &precise()).unwrap();
    assert_eq!(fits.len(), 2 * 2 * 3);

    let first = fits.fetch_model(0).unwrap();
    assert_eq!(first.spec().depvar, "Y");
    assert_eq!(first.spec().fixef_names(), vec!["f1"]);
    assert_eq!(first.coef_names(), ["X1"]);
    let last = fits.fetch_model(11).unwrap();
    assert_eq!(last.spec().depvar, "Yiv");
    assert_eq!(last.spec().fixef_names(), vec!["f1", "f2"]);
    assert_eq!(last.coef_names(), ["X1", "X2", "Z"]);

    // Within each fixed-effect step: Y, X1, X2, Z, Yiv are each demeaned once.
    let stats = fits.cache_stats();
    assert_eq!(stats.misses, 2 * 5);
    assert!(stats.hits > 0);

    assert!(matches!(
        fits.fetch_model(12),
        Err(EstimationError::ModelIndexOutOfRange { index: 12, len: 12 })
    ));
}

#[test]
fn cached_and_uncached_fits_agree() {
    let data = common::dataset(300, 19);
    let fits = feols("Y ~ csw(X1, X2) | f1 + f2", &data, &precise()).unwrap();
    let alone = feols("Y ~ X1 + X2 | f1 + f2", &data, &precise()).unwrap();
    assert_eq!(
        fits.fetch_model(1).unwrap().coefficients(),
        alone.fetch_model(0).unwrap().coefficients()
    );
}

#[test]
fn missing_values_shrink_only_the_models_that_use_them() {
    let mut frame = common::panel(200, 23);
    let x2: Vec<Option<f64>> = frame
        .column("X2")
        .unwrap()
        .f64()
        .unwrap()
        .into_iter()
        .enumerate()
        .map(|(i, v)| if i % 10 == 0 { None } else { v })
        .collect();
    frame.with_column(Series::new("X2".into(), x2)).unwrap();
    let data = Dataset::new(frame);
    let fits = feols("Y ~ sw(X1, X2) | f1", &data, &precise()).unwrap();
    assert_eq!(fits.fetch_model(0).unwrap().nobs(), 200);
    assert_eq!(fits.fetch_model(1).unwrap().nobs(), 180);
}

#[test]
fn strict_mode_turns_non_convergence_into_an_error() {
    let data = common::dataset(300, 29);
    let loose = EstimationConfig {
        fixef_maxiter: 1,
        ..EstimationConfig::default()
    };
    let fit = feols("Y ~ X1 | f1 + f2", &data, &loose).unwrap();
    assert!(!fit.fetch_model(0).unwrap().converged());

    let strict = EstimationConfig {
        strict: true,
        ..loose
    };
    assert!(matches!(
        feols("Y ~ X1 | f1 + f2", &data, &strict),
        Err(EstimationError::DemeanDidNotConverge { max_iterations: 1 })
    ));
}

#[test]
fn weights_scale_observations() {
    let data = common::dataset(500, 31);
    let analytic = EstimationConfig::default().with_weights("W", WeightsType::Analytic);
    let fit = feols("Y ~ X1 + X2 | f1", &data, &analytic).unwrap();
    let fit = fit.fetch_model(0).unwrap();
    assert_abs_diff_eq!(fit.coefficient("X1").unwrap(), BETA_X1, epsilon = 0.15);
    assert_eq!(fit.weights().len(), 500);

    let frequency = EstimationConfig {
        fixef_rm: FixefRemoval::None,
        ..EstimationConfig::default().with_weights("W", WeightsType::Frequency)
    };
    let fweighted = feols("Y ~ X1 + X2 | f1", &data, &frequency).unwrap();
    let fweighted = fweighted.fetch_model(0).unwrap();
    // Same point estimates; inference counts the weight total as the sample size.
    for (a, b) in fit.coefficients().iter().zip(fweighted.coefficients().iter()) {
        assert_abs_diff_eq!(a, b, epsilon = 1e-10);
    }
}

#[test]
fn poisson_recovers_coefficients() {
    let data = common::dataset(3000, 37);
    let fits = fepois("C ~ X1 + X2 | f1", &data, &EstimationConfig::default()).unwrap();
    let fit = fits.fetch_model(0).unwrap();
    let summary = fit.iwls_summary().unwrap();
    assert!(summary.converged);
    assert!(summary.iterations <= 25);
    assert!(fit.vcov_info().normal_reference);
    assert_abs_diff_eq!(fit.coefficient("X1").unwrap(), POISSON_X1, epsilon = 0.06);
    assert_abs_diff_eq!(fit.coefficient("X2").unwrap(), POISSON_X2, epsilon = 0.06);
    assert!(fit.fitted_values().iter().all(|&mu| mu > 0.0));
}

#[test]
fn capped_iwls_is_flagged_or_fatal_in_strict_mode() {
    let data = common::dataset(500, 39);
    let capped = EstimationConfig {
        iwls_maxiter: 1,
        ..EstimationConfig::default()
    };
    let fits = fepois("C ~ X1 + X2 | f1", &data, &capped).unwrap();
    let fit = fits.fetch_model(0).unwrap();
    assert!(!fit.converged());
    assert_eq!(fit.iwls_summary().unwrap().iterations, 1);

    let strict = EstimationConfig {
        strict: true,
        ..capped
    };
    assert!(matches!(
        fepois("C ~ X1 + X2 | f1", &data, &strict),
        Err(EstimationError::IwlsDidNotConverge { max_iterations: 1, .. })
    ));
}

#[test]
fn poisson_rejects_negative_outcomes() {
    let data = common::dataset(200, 41);
    assert!(matches!(
        fepois("Y ~ X1", &data, &EstimationConfig::default()),
        Err(EstimationError::NegativeOutcome(_))
    ));
}

#[test]
fn iv_recovers_the_structural_coefficient() {
    let data = common::dataset(3000, 43);
    let hetero = EstimationConfig::default().with_vcov("hetero");
    let iv = feols("Yiv ~ X1 | D ~ Z", &data, &hetero).unwrap();
    let iv = iv.fetch_model(0).unwrap();
    assert_eq!(iv.coef_names(), ["D", "Intercept", "X1"]);
    assert_abs_diff_eq!(iv.coefficient("D").unwrap(), BETA_D, epsilon = 0.15);

    // OLS is biased upwards by the confounder.
    let ols = feols("Yiv ~ D + X1", &data, &EstimationConfig::default()).unwrap();
    assert!(ols.fetch_model(0).unwrap().coefficient("D").unwrap() > BETA_D + 0.3);

    assert!(matches!(
        feols("Yiv ~ X1 | D + X2 ~ Z", &data, &EstimationConfig::default()),
        Err(EstimationError::Underidentified { endogenous: 2, instruments: 1 })
    ));
}

#[test]
fn inference_table_is_consistent() {
    let data = common::dataset(400, 47);
    let fits = feols("Y ~ X1 + X2", &data, &EstimationConfig::default().with_vcov("HC3")).unwrap();
    let fit = fits.fetch_model(0).unwrap();
    let rows = fit.tidy(0.95);
    assert_eq!(rows.len(), 3);
    for row in &rows {
        assert_abs_diff_eq!(row.statistic, row.estimate / row.std_error, epsilon = 1e-12);
        assert!(row.conf_low < row.estimate && row.estimate < row.conf_high);
        assert!((0.0..=1.0).contains(&row.pvalue));
    }
    let text = fit.to_string();
    assert!(text.contains("Intercept") && text.contains("HC3"));
}
