//! Reuse of demeaned columns across the models of one estimation call.
//!
//! A demeaned column depends on the variable, the fixed effects, the weights
//! and the estimation sample, nothing else. Models that share those reuse the
//! column instead of demeaning it again. The cache only grows: entries are
//! never invalidated while an orchestration call is running.

use crate::demean::demean;
use crate::fixef::FixedEffects;
use ahash::AHashMap;
use ndarray::{Array1, Array2, ArrayView1, Axis};

/// Canonical identity of one demeaning problem, minus the variable.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    fixed_effects: Vec<String>,
    weights: Option<String>,
    rows: Vec<usize>,
}

impl CacheKey {
    /// The fixed-effect names are sorted, so `f1 + f2` and `f2 + f1` share.
    pub fn new(mut fixed_effects: Vec<String>, weights: Option<String>, rows: &[usize]) -> Self {
        fixed_effects.sort();
        Self {
            fixed_effects,
            weights,
            rows: rows.to_vec(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: usize,
    pub misses: usize,
}

#[derive(Debug, Clone)]
struct CachedColumn {
    values: Array1<f64>,
    converged: bool,
}

/// Demeaned columns keyed by [`CacheKey`] and variable name.
#[derive(Debug, Default)]
pub struct DemeanCache {
    disabled: bool,
    entries: AHashMap<CacheKey, AHashMap<String, CachedColumn>>,
    stats: CacheStats,
}

impl DemeanCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// A cache that never stores anything, for refits on altered data where
    /// a variable name no longer identifies its values.
    pub fn disabled() -> Self {
        Self {
            disabled: true,
            ..Self::default()
        }
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    /// Demeans the named columns, taking whatever is already cached.
    ///
    /// Returns the columns in the requested order and whether all of them
    /// converged.
    pub fn demean_columns(
        &mut self,
        key: &CacheKey,
        columns: &[(&str, ArrayView1<f64>)],
        fixef: &FixedEffects,
        weights: ArrayView1<f64>,
        tol: f64,
        max_iter: usize,
    ) -> (Array2<f64>, bool) {
        let nobs = weights.len();
        let missing: Vec<usize> = if self.disabled {
            (0..columns.len()).collect()
        } else {
            let cached = self.entries.get(key);
            (0..columns.len())
                .filter(|&i| cached.is_none_or(|entry| !entry.contains_key(columns[i].0)))
                .collect()
        };
        self.stats.misses += missing.len();
        self.stats.hits += columns.len() - missing.len();

        let mut fresh: AHashMap<String, CachedColumn> = AHashMap::new();
        if !missing.is_empty() {
            let mut block = Array2::zeros((nobs, missing.len()));
            for (j, &i) in missing.iter().enumerate() {
                block.column_mut(j).assign(&columns[i].1);
            }
            let outcome = demean(block.view(), fixef, weights, tol, max_iter);
            for (j, &i) in missing.iter().enumerate() {
                fresh.insert(
                    columns[i].0.to_string(),
                    CachedColumn {
                        values: outcome.values.column(j).to_owned(),
                        converged: outcome.column_converged[j],
                    },
                );
            }
        }

        let mut result = Array2::zeros((nobs, columns.len()));
        let mut converged = true;
        {
            let stored = self.entries.get(key);
            for (j, (name, _)) in columns.iter().enumerate() {
                let column = fresh
                    .get(*name)
                    .or_else(|| stored.and_then(|entry| entry.get(*name)));
                if let Some(column) = column {
                    result.column_mut(j).assign(&column.values);
                    converged &= column.converged;
                }
            }
        }

        if !self.disabled && !fresh.is_empty() {
            self.entries.entry(key.clone()).or_default().extend(fresh);
        }
        (result, converged)
    }

    /// Single-column form of [`DemeanCache::demean_columns`].
    pub fn demean_one(
        &mut self,
        key: &CacheKey,
        name: &str,
        values: ArrayView1<f64>,
        fixef: &FixedEffects,
        weights: ArrayView1<f64>,
        tol: f64,
        max_iter: usize,
    ) -> (Array1<f64>, bool) {
        let (block, converged) =
            self.demean_columns(key, &[(name, values)], fixef, weights, tol, max_iter);
        (block.index_axis_move(Axis(1), 0), converged)
    }
}
