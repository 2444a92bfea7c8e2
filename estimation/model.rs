//! # Model Specifications and Designs
//!
//! A [`ModelSpec`] names the variables of one model; a [`ModelDesign`] holds
//! their values on the model's own estimation sample, before any demeaning.
//! Designs are kept inside fits so post-estimation routines (leave-one-out
//! variances, randomization refits) can start again from the raw data.

use crate::cache::CacheKey;
use crate::config::WeightsType;
use crate::fixef::{FixedEffectTerm, FixedEffects};
use ndarray::{Array1, Array2, ArrayView1};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Name given to the constant column of models without fixed effects.
pub const INTERCEPT: &str = "Intercept";

/// The estimator family of a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModelFamily {
    /// Ordinary or weighted least squares.
    Ols,
    /// Poisson pseudo-maximum likelihood with a log link.
    Poisson,
    /// Two-stage least squares.
    Iv,
}

impl ModelFamily {
    pub fn name(&self) -> &'static str {
        match self {
            ModelFamily::Ols => "OLS",
            ModelFamily::Poisson => "Poisson",
            ModelFamily::Iv => "IV",
        }
    }
}

/// The variables of one model, fully expanded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSpec {
    pub depvar: String,
    /// Exogenous regressors, without the intercept.
    pub regressors: Vec<String>,
    pub fixed_effects: Vec<FixedEffectTerm>,
    pub endogenous: Vec<String>,
    pub instruments: Vec<String>,
    pub family: ModelFamily,
    pub intercept: bool,
}

impl ModelSpec {
    pub fn has_fixed_effects(&self) -> bool {
        !self.fixed_effects.is_empty()
    }

    pub fn fixef_names(&self) -> Vec<String> {
        self.fixed_effects.iter().map(FixedEffectTerm::name).collect()
    }

    /// Every numeric column the model reads, outcome first.
    pub fn numeric_columns(&self) -> Vec<&str> {
        std::iter::once(self.depvar.as_str())
            .chain(self.endogenous.iter().map(String::as_str))
            .chain(self.regressors.iter().map(String::as_str))
            .chain(self.instruments.iter().map(String::as_str))
            .collect()
    }

    /// Every label column behind the fixed effects.
    pub fn fixef_columns(&self) -> Vec<&str> {
        let mut columns: Vec<&str> = self
            .fixed_effects
            .iter()
            .flat_map(|term| term.columns().iter().map(String::as_str))
            .collect();
        columns.sort_unstable();
        columns.dedup();
        columns
    }

    /// Regressor names in coefficient order: endogenous variables, then the
    /// intercept, then the exogenous regressors.
    pub fn design_columns(&self) -> Vec<String> {
        let mut names = self.endogenous.clone();
        if self.intercept {
            names.push(INTERCEPT.to_string());
        }
        names.extend(self.regressors.iter().cloned());
        names
    }

    /// Instrument names: excluded instruments, then the exogenous columns.
    pub fn instrument_columns(&self) -> Vec<String> {
        let mut names = self.instruments.clone();
        if self.intercept {
            names.push(INTERCEPT.to_string());
        }
        names.extend(self.regressors.iter().cloned());
        names
    }

    pub fn formula(&self) -> String {
        let rhs = if self.regressors.is_empty() && self.intercept {
            "1".to_string()
        } else {
            let mut terms = self.regressors.join(" + ");
            if terms.is_empty() {
                terms.push('0');
            }
            terms
        };
        let mut formula = format!("{} ~ {}", self.depvar, rhs);
        if self.has_fixed_effects() {
            formula.push_str(" | ");
            formula.push_str(&self.fixef_names().join(" + "));
        }
        if !self.endogenous.is_empty() {
            formula.push_str(&format!(
                " | {} ~ {}",
                self.endogenous.join(" + "),
                self.instruments.join(" + ")
            ));
        }
        formula
    }
}

impl fmt::Display for ModelSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.formula())
    }
}

/// Raw model data on the estimation sample.
#[derive(Debug, Clone)]
pub struct ModelDesign {
    /// Positions of the sample in the original dataset.
    pub rows: Vec<usize>,
    pub y_name: String,
    pub y: Array1<f64>,
    pub x: Array2<f64>,
    pub x_names: Vec<String>,
    /// Full instrument matrix of IV models.
    pub z: Option<Array2<f64>>,
    pub z_names: Vec<String>,
    pub weights: Array1<f64>,
    pub weights_name: Option<String>,
    pub weights_type: WeightsType,
    pub fixef: Option<FixedEffects>,
    /// Rows removed by singleton or zero-outcome pruning.
    pub pruned_rows: usize,
}

impl ModelDesign {
    pub fn nobs(&self) -> usize {
        self.y.len()
    }

    pub fn is_weighted(&self) -> bool {
        self.weights_name.is_some()
    }

    /// Effective number of observations: the weight total under frequency
    /// weights, the row count otherwise.
    pub fn effective_nobs(&self) -> f64 {
        match self.weights_type {
            WeightsType::Frequency if self.is_weighted() => self.weights.sum(),
            _ => self.nobs() as f64,
        }
    }

    pub fn sqrt_weights(&self) -> Array1<f64> {
        self.weights.mapv(f64::sqrt)
    }

    pub fn cache_key(&self) -> Option<CacheKey> {
        self.fixef.as_ref().map(|fe| {
            CacheKey::new(fe.names().to_vec(), self.weights_name.clone(), &self.rows)
        })
    }

    /// A copy with the regressor `name` (and its instrument twin, if any)
    /// replaced by `values`.
    pub fn with_regressor(&self, name: &str, values: ArrayView1<f64>) -> Self {
        let mut design = self.clone();
        if let Some(j) = design.x_names.iter().position(|n| n == name) {
            design.x.column_mut(j).assign(&values);
        }
        if let Some(z) = design.z.as_mut() {
            if let Some(j) = design.z_names.iter().position(|n| n == name) {
                z.column_mut(j).assign(&values);
            }
        }
        design
    }

    pub fn with_outcome(mut self, y: Array1<f64>) -> Self {
        self.y = y;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn spec() -> ModelSpec {
        ModelSpec {
            depvar: "Y".into(),
            regressors: vec!["X1".into(), "X2".into()],
            fixed_effects: vec![
                FixedEffectTerm::simple("f1"),
                FixedEffectTerm::interacted(["f2", "f3"]),
            ],
            endogenous: vec![],
            instruments: vec![],
            family: ModelFamily::Ols,
            intercept: false,
        }
    }

    #[test]
    fn formula_round_trips_the_spec_layout() {
        assert_eq!(spec().formula(), "Y ~ X1 + X2 | f1 + f2^f3");
        let mut iv = spec();
        iv.fixed_effects.clear();
        iv.intercept = true;
        iv.family = ModelFamily::Iv;
        iv.endogenous = vec!["D".into()];
        iv.instruments = vec!["Z".into()];
        assert_eq!(iv.formula(), "Y ~ X1 + X2 | D ~ Z");
        assert_eq!(iv.design_columns(), vec!["D", "Intercept", "X1", "X2"]);
        assert_eq!(iv.instrument_columns(), vec!["Z", "Intercept", "X1", "X2"]);
    }

    #[test]
    fn columns_needed_from_the_data() {
        let s = spec();
        assert_eq!(s.numeric_columns(), vec!["Y", "X1", "X2"]);
        assert_eq!(s.fixef_columns(), vec!["f1", "f2", "f3"]);
    }

    #[test]
    fn replacing_a_regressor_touches_both_matrices() {
        let design = ModelDesign {
            rows: vec![0, 1],
            y_name: "Y".into(),
            y: array![1.0, 2.0],
            x: array![[1.0, 5.0], [1.0, 6.0]],
            x_names: vec!["D".into(), "W".into()],
            z: Some(array![[9.0, 5.0], [8.0, 6.0]]),
            z_names: vec!["Z".into(), "W".into()],
            weights: array![1.0, 1.0],
            weights_name: None,
            weights_type: WeightsType::Analytic,
            fixef: None,
            pruned_rows: 0,
        };
        let altered = design.with_regressor("W", array![0.0, -1.0].view());
        assert_eq!(altered.x.column(1).to_vec(), vec![0.0, -1.0]);
        assert_eq!(altered.z.unwrap().column(1).to_vec(), vec![0.0, -1.0]);
        assert_eq!(design.x.column(1).to_vec(), vec![5.0, 6.0]);
    }
}
