//! # Estimation Entry Points
//!
//! [`feols`] and [`fepois`] parse a formula, expand it into model specs, and
//! estimate the specs in order with one shared demeaning cache.
//!
//! Every spec is validated (columns, option combinations, covariance support)
//! before the first model is fitted. Each spec then gets its own estimation
//! sample: rows missing any variable the model reads, including weights and
//! clustering columns, are dropped for that model only.

use crate::cache::DemeanCache;
use crate::config::{ConfigError, EstimationConfig, FixefRemoval, WeightsType};
use crate::data::{DataError, Dataset};
use crate::fit::{FitResult, fit_design};
use crate::fixef::{FixedEffectTerm, FixedEffects};
use crate::formula::{Formula, FormulaError};
use crate::inference::vcov::{ClusterVar, VcovType, check_support, compute_vcov};
use crate::model::{INTERCEPT, ModelDesign, ModelFamily, ModelSpec};
use crate::multi::MultiFit;
use ahash::AHashMap;
use ndarray::{Array1, Array2};
use ndarray_linalg::error::LinalgError;
use thiserror::Error;

/// A comprehensive error type for the estimation pipeline.
#[derive(Error, Debug)]
pub enum EstimationError {
    #[error(transparent)]
    Data(#[from] DataError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Formula(#[from] FormulaError),

    #[error("Not supported: {0}")]
    NotSupported(String),

    #[error("Clustering variable '{name}' has {found} cluster(s); at least 2 are required.")]
    TooFewClusters { name: String, found: usize },

    #[error("A linear system could not be solved: {0}")]
    LinearSystemSolveFailed(LinalgError),

    #[error("Every regressor is collinear or absorbed by the fixed effects: {}", .0.join(", "))]
    AllRegressorsCollinear(Vec<String>),

    #[error(
        "The model is underidentified: {endogenous} endogenous regressor(s) but only {instruments} instrument(s)."
    )]
    Underidentified {
        endogenous: usize,
        instruments: usize,
    },

    #[error("Only {nobs} observation(s) remain for {params} parameter(s).")]
    InsufficientObservations { nobs: usize, params: usize },

    #[error("Model '{0}' has no regressors to estimate.")]
    NoRegressors(String),

    #[error("The Poisson outcome '{0}' has negative values.")]
    NegativeOutcome(String),

    #[error("The weights column '{0}' has negative values.")]
    NegativeWeights(String),

    #[error("Demeaning did not converge within {max_iterations} iterations.")]
    DemeanDidNotConverge { max_iterations: usize },

    #[error(
        "IWLS did not converge within {max_iterations} iterations (last relative deviance change {last_change:e})."
    )]
    IwlsDidNotConverge {
        max_iterations: usize,
        last_change: f64,
    },

    #[error("Model index {index} is out of range for {len} estimated model(s).")]
    ModelIndexOutOfRange { index: usize, len: usize },
}

/// Estimates every linear (or IV) model a formula expands to.
pub fn feols(
    formula: &str,
    data: &Dataset,
    config: &EstimationConfig,
) -> Result<MultiFit, EstimationError> {
    estimate_all(formula, data, config, ModelFamily::Ols)
}

/// Estimates every Poisson model a formula expands to.
pub fn fepois(
    formula: &str,
    data: &Dataset,
    config: &EstimationConfig,
) -> Result<MultiFit, EstimationError> {
    estimate_all(formula, data, config, ModelFamily::Poisson)
}

fn estimate_all(
    formula: &str,
    data: &Dataset,
    config: &EstimationConfig,
    family: ModelFamily,
) -> Result<MultiFit, EstimationError> {
    config.validate()?;
    let parsed: Formula = formula.parse()?;
    if parsed.is_iv() && family == ModelFamily::Poisson {
        return Err(EstimationError::NotSupported(
            "instrumental variables cannot be combined with a Poisson model".to_string(),
        ));
    }

    let specs = parsed.expand(family, config.drop_intercept);
    let kinds = specs
        .iter()
        .map(|spec| {
            let kind = default_vcov(spec, config)?;
            validate_spec(spec, &kind, data, config)?;
            Ok(kind)
        })
        .collect::<Result<Vec<VcovType>, EstimationError>>()?;

    log::info!(
        "Estimating {} {} model(s) from '{}'.",
        specs.len(),
        family.name(),
        parsed.text()
    );
    let mut cache = DemeanCache::new();
    let mut models = Vec::with_capacity(specs.len());
    for (spec, kind) in specs.iter().zip(&kinds) {
        models.push(estimate_spec(spec, kind, data, config, &mut cache)?);
    }

    let stats = cache.stats();
    log::debug!(
        "Demeaning cache: {} hit(s), {} miss(es).",
        stats.hits,
        stats.misses
    );
    Ok(MultiFit::new(models, stats))
}

/// The covariance requested in the configuration, or the default: iid
/// without fixed effects, clustered by the first fixed effect otherwise.
pub(crate) fn default_vcov(
    spec: &ModelSpec,
    config: &EstimationConfig,
) -> Result<VcovType, EstimationError> {
    if let Some(kind) = config.vcov_type()? {
        return Ok(kind);
    }
    Ok(match spec.fixed_effects.first() {
        Some(term) => VcovType::Crv1(vec![term.name()]),
        None => VcovType::Iid,
    })
}

/// Every column a clustering name (`g` or `g1^g2`) reads.
fn cluster_columns(names: &[String]) -> Vec<String> {
    names
        .iter()
        .flat_map(|name| name.split('^').map(|c| c.trim().to_string()))
        .collect()
}

fn validate_spec(
    spec: &ModelSpec,
    kind: &VcovType,
    data: &Dataset,
    config: &EstimationConfig,
) -> Result<(), EstimationError> {
    data.require_columns(spec.numeric_columns())?;
    data.require_columns(spec.fixef_columns())?;
    data.require_columns(config.weights.as_deref())?;
    let clusters = cluster_columns(&kind.cluster_names());
    data.require_columns(clusters.iter().map(String::as_str))?;

    if spec.family == ModelFamily::Poisson && config.weights.is_some() {
        return Err(EstimationError::NotSupported(
            "weights are not supported for Poisson models".to_string(),
        ));
    }
    if spec.instruments.len() < spec.endogenous.len() {
        return Err(EstimationError::Underidentified {
            endogenous: spec.endogenous.len(),
            instruments: spec.instruments.len(),
        });
    }
    if config.use_compression
        && (config.weights.is_some() || spec.has_fixed_effects() || spec.family != ModelFamily::Ols)
    {
        return Err(EstimationError::NotSupported(
            "compression is only available for unweighted least squares without fixed effects"
                .to_string(),
        ));
    }
    if spec.design_columns().is_empty() {
        return Err(EstimationError::NoRegressors(spec.formula()));
    }

    let frequency_weights =
        config.weights.is_some() && config.weights_type == WeightsType::Frequency;
    check_support(
        kind,
        spec.family,
        spec.has_fixed_effects(),
        config.use_compression,
        frequency_weights,
    )
}

/// Validates, builds the design, fits and computes the covariance of one spec.
pub(crate) fn estimate_spec(
    spec: &ModelSpec,
    kind: &VcovType,
    data: &Dataset,
    config: &EstimationConfig,
    cache: &mut DemeanCache,
) -> Result<FitResult, EstimationError> {
    let design = build_design(spec, data, config, &kind.cluster_names())?;
    log::info!(
        "Fitting '{}' on {} observations ({} dropped for missing values, {} pruned).",
        spec,
        design.nobs(),
        data.nrows() - design.nobs() - design.pruned_rows,
        design.pruned_rows
    );

    let core = fit_design(spec.family, &design, config, cache)?;
    let clusters = resolve_clusters(data, &kind.cluster_names(), &design.rows)?;
    let vcov = compute_vcov(&core.vcov_inputs(&design), kind, &clusters, &config.ssc)?;
    Ok(FitResult::new(spec.clone(), core, design, config.clone(), vcov))
}

/// Encodes clustering variables on the given dataset rows. Names joined by
/// `^` cluster by the combination of their columns.
pub(crate) fn resolve_clusters(
    data: &Dataset,
    names: &[String],
    rows: &[usize],
) -> Result<Vec<ClusterVar>, EstimationError> {
    names
        .iter()
        .map(|name| {
            let labels = term_labels(data, &term_for(name)?, rows)?;
            Ok(ClusterVar::from_labels(name, labels))
        })
        .collect()
}

fn term_for(name: &str) -> Result<FixedEffectTerm, EstimationError> {
    name.parse::<FixedEffectTerm>()
        .map_err(EstimationError::NotSupported)
}

/// One label per row for a (possibly interacted) term.
fn term_labels(
    data: &Dataset,
    term: &FixedEffectTerm,
    rows: &[usize],
) -> Result<Vec<String>, DataError> {
    let per_column = term
        .columns()
        .iter()
        .map(|column| data.categorical_rows(column, rows))
        .collect::<Result<Vec<_>, _>>()?;
    if let [single] = per_column.as_slice() {
        return Ok(single.clone());
    }
    Ok((0..rows.len())
        .map(|i| {
            let parts: Vec<&str> = per_column.iter().map(|labels| labels[i].as_str()).collect();
            FixedEffectTerm::join_labels(&parts)
        })
        .collect())
}

/// Builds the raw design of `spec` on its own complete-case sample.
pub(crate) fn build_design(
    spec: &ModelSpec,
    data: &Dataset,
    config: &EstimationConfig,
    clusters: &[String],
) -> Result<ModelDesign, EstimationError> {
    let n = data.nrows();
    let mut numeric: AHashMap<&str, Vec<Option<f64>>> = AHashMap::new();
    for name in spec.numeric_columns() {
        if !numeric.contains_key(name) {
            numeric.insert(name, data.numeric_column(name)?);
        }
    }
    let weights = config
        .weights
        .as_deref()
        .map(|name| data.numeric_column(name))
        .transpose()?;

    let mut label_columns: Vec<String> = spec
        .fixef_columns()
        .into_iter()
        .map(str::to_string)
        .collect();
    label_columns.extend(cluster_columns(clusters));
    label_columns.sort_unstable();
    label_columns.dedup();
    let labels = label_columns
        .iter()
        .map(|name| data.categorical_column(name))
        .collect::<Result<Vec<_>, _>>()?;

    let mut rows: Vec<usize> = (0..n)
        .filter(|&i| {
            numeric.values().all(|column| column[i].is_some())
                && weights.as_ref().is_none_or(|w| w[i].is_some())
                && labels.iter().all(|column| column[i].is_some())
        })
        .collect();

    if let (Some(name), Some(w)) = (config.weights.as_ref(), weights.as_ref()) {
        if rows.iter().any(|&i| w[i].is_some_and(|v| v < 0.0)) {
            return Err(EstimationError::NegativeWeights(name.clone()));
        }
    }

    let outcome = &numeric[spec.depvar.as_str()];
    let value_at = |column: &[Option<f64>], i: usize| column[i].unwrap_or(f64::NAN);

    let mut fixef = if spec.has_fixed_effects() {
        let term_codes = spec
            .fixed_effects
            .iter()
            .map(|term| term_labels(data, term, &rows))
            .collect::<Result<Vec<_>, _>>()?;
        Some(FixedEffects::from_labels(spec.fixef_names(), term_codes))
    } else {
        None
    };

    let complete = rows.len();
    if let Some(fe) = fixef.as_mut() {
        loop {
            let before = rows.len();
            if spec.family == ModelFamily::Poisson {
                let y: Vec<f64> = rows.iter().map(|&i| value_at(outcome, i)).collect();
                let keep = fe.rows_with_outcome_variation(&y);
                if keep.len() < rows.len() {
                    rows = keep.iter().map(|&k| rows[k]).collect();
                    *fe = fe.subset(&keep);
                }
            }
            if config.fixef_rm == FixefRemoval::Singleton {
                let keep = fe.non_singleton_rows();
                if keep.len() < rows.len() {
                    rows = keep.iter().map(|&k| rows[k]).collect();
                    *fe = fe.subset(&keep);
                }
            }
            if rows.len() == before {
                break;
            }
        }
    }
    let pruned_rows = complete - rows.len();
    if pruned_rows > 0 {
        log::info!(
            "Removed {pruned_rows} observation(s) in singleton or all-zero fixed-effect groups."
        );
    }

    let x_names = spec.design_columns();
    let fill = |names: &[String]| {
        Array2::from_shape_fn((rows.len(), names.len()), |(r, j)| {
            if names[j] == INTERCEPT {
                1.0
            } else {
                value_at(&numeric[names[j].as_str()], rows[r])
            }
        })
    };
    let x = fill(&x_names);
    let (z, z_names) = if spec.family == ModelFamily::Iv {
        let z_names = spec.instrument_columns();
        (Some(fill(&z_names)), z_names)
    } else {
        (None, Vec::new())
    };

    let y = Array1::from_iter(rows.iter().map(|&i| value_at(outcome, i)));
    let weights = match weights.as_ref() {
        Some(w) => Array1::from_iter(rows.iter().map(|&i| value_at(w, i))),
        None => Array1::ones(rows.len()),
    };

    if rows.len() <= x_names.len() {
        return Err(EstimationError::InsufficientObservations {
            nobs: rows.len(),
            params: x_names.len(),
        });
    }

    Ok(ModelDesign {
        rows,
        y_name: spec.depvar.clone(),
        y,
        x,
        x_names,
        z,
        z_names,
        weights,
        weights_name: config.weights.clone(),
        weights_type: config.weights_type,
        fixef,
        pruned_rows,
    })
}
