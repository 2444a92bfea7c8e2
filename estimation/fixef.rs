//! # Fixed-Effect Encoding
//!
//! Fixed effects arrive as label columns and leave as dense integer codes.
//! Every [`FixedEffects`] value is defined on one estimation sample: code `j`
//! of effect `g` means "row belongs to level `j` of effect `g`", and codes run
//! over `0..n_levels(g)` with no gaps. Subsetting re-encodes, so the no-gap
//! invariant survives singleton and zero-outcome removal.

use ahash::AHashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::Hash;
use std::str::FromStr;

/// Separator used when joining the labels of an interacted effect.
const INTERACTION_SEPARATOR: char = '\u{1f}';

/// One fixed effect as written in a formula: `f1` or the interaction `f1^f2`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FixedEffectTerm {
    columns: Vec<String>,
}

impl FixedEffectTerm {
    pub fn simple(column: impl Into<String>) -> Self {
        Self {
            columns: vec![column.into()],
        }
    }

    pub fn interacted<I, S>(columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            columns: columns.into_iter().map(Into::into).collect(),
        }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn is_interacted(&self) -> bool {
        self.columns.len() > 1
    }

    pub fn name(&self) -> String {
        self.columns.join("^")
    }

    /// Combines per-column labels of one row into the label of the term.
    pub fn join_labels(labels: &[&str]) -> String {
        let mut joined = String::new();
        for (i, label) in labels.iter().enumerate() {
            if i > 0 {
                joined.push(INTERACTION_SEPARATOR);
            }
            joined.push_str(label);
        }
        joined
    }
}

impl fmt::Display for FixedEffectTerm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

impl FromStr for FixedEffectTerm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let columns: Vec<String> = s.split('^').map(|c| c.trim().to_string()).collect();
        if columns.iter().any(|c| c.is_empty()) {
            return Err(format!("'{s}' is not a valid fixed effect"));
        }
        Ok(Self { columns })
    }
}

/// Maps arbitrary hashable keys to dense codes in order of first appearance.
pub fn factorize<K, I>(keys: I) -> (Vec<usize>, usize)
where
    K: Eq + Hash,
    I: IntoIterator<Item = K>,
{
    let mut lookup: AHashMap<K, usize> = AHashMap::new();
    let codes = keys
        .into_iter()
        .map(|key| {
            let next = lookup.len();
            *lookup.entry(key).or_insert(next)
        })
        .collect();
    (codes, lookup.len())
}

/// Dense group codes of one or more fixed effects on a common sample.
#[derive(Debug, Clone, PartialEq)]
pub struct FixedEffects {
    names: Vec<String>,
    ids: Vec<Vec<usize>>,
    n_levels: Vec<usize>,
    nobs: usize,
}

impl FixedEffects {
    /// Builds the encoding from arbitrary labels, one label vector per effect.
    pub fn from_labels<K: Eq + Hash + Clone>(names: Vec<String>, labels: Vec<Vec<K>>) -> Self {
        let nobs = labels.first().map_or(0, Vec::len);
        let mut ids = Vec::with_capacity(labels.len());
        let mut n_levels = Vec::with_capacity(labels.len());
        for column in labels {
            debug_assert_eq!(column.len(), nobs);
            let (codes, levels) = factorize(column);
            ids.push(codes);
            n_levels.push(levels);
        }
        Self {
            names,
            ids,
            n_levels,
            nobs,
        }
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn n_effects(&self) -> usize {
        self.ids.len()
    }

    pub fn nobs(&self) -> usize {
        self.nobs
    }

    pub fn ids(&self, effect: usize) -> &[usize] {
        &self.ids[effect]
    }

    pub fn n_levels(&self, effect: usize) -> usize {
        self.n_levels[effect]
    }

    /// Restricts to the given rows and re-encodes every effect.
    pub fn subset(&self, rows: &[usize]) -> Self {
        let labels: Vec<Vec<usize>> = self
            .ids
            .iter()
            .map(|codes| rows.iter().map(|&row| codes[row]).collect())
            .collect();
        Self::from_labels(self.names.clone(), labels)
    }

    /// Per-level totals of `values` for one effect.
    pub fn level_sums(&self, effect: usize, values: impl Iterator<Item = f64>) -> Vec<f64> {
        let mut sums = vec![0.0; self.n_levels[effect]];
        for (&level, value) in self.ids[effect].iter().zip(values) {
            sums[level] += value;
        }
        sums
    }

    /// Rows that survive iterated singleton removal.
    ///
    /// Removing a singleton of one effect can create a singleton in another,
    /// so the pass repeats until no effect has a level with one observation.
    pub fn non_singleton_rows(&self) -> Vec<usize> {
        let mut keep: Vec<usize> = (0..self.nobs).collect();
        loop {
            let mut counts: Vec<Vec<usize>> =
                self.n_levels.iter().map(|&levels| vec![0; levels]).collect();
            for &row in &keep {
                for (effect, codes) in self.ids.iter().enumerate() {
                    counts[effect][codes[row]] += 1;
                }
            }
            let before = keep.len();
            keep.retain(|&row| {
                self.ids
                    .iter()
                    .enumerate()
                    .all(|(effect, codes)| counts[effect][codes[row]] > 1)
            });
            if keep.len() == before {
                return keep;
            }
        }
    }

    /// Rows outside any level whose outcome is identically zero.
    ///
    /// For count models such levels push the fixed effect to minus infinity
    /// and carry no information about the slopes.
    pub fn rows_with_outcome_variation(&self, y: &[f64]) -> Vec<usize> {
        let totals: Vec<Vec<f64>> = (0..self.n_effects())
            .map(|effect| self.level_sums(effect, y.iter().copied()))
            .collect();
        (0..self.nobs)
            .filter(|&row| {
                self.ids
                    .iter()
                    .enumerate()
                    .all(|(effect, codes)| totals[effect][codes[row]] > 0.0)
            })
            .collect()
    }

    /// Number of fixed-effect coefficients absorbed by demeaning: every level
    /// counts once, minus one redundant level for each effect past the first.
    pub fn dof(&self) -> usize {
        let total: usize = self.n_levels.iter().sum();
        total.saturating_sub(self.n_effects().saturating_sub(1))
    }

    /// Like [`FixedEffects::dof`], ignoring effects nested in any clustering.
    pub fn dof_excluding_nested(&self, clusters: &[&[usize]]) -> usize {
        let nested_levels: usize = (0..self.n_effects())
            .filter(|&effect| clusters.iter().any(|ids| self.is_nested_in(effect, ids)))
            .map(|effect| self.n_levels[effect])
            .sum();
        self.dof().saturating_sub(nested_levels)
    }

    /// True when every level of `effect` lies inside a single cluster.
    pub fn is_nested_in(&self, effect: usize, clusters: &[usize]) -> bool {
        let mut owner: Vec<Option<usize>> = vec![None; self.n_levels[effect]];
        for (&level, &cluster) in self.ids[effect].iter().zip(clusters) {
            match owner[level] {
                None => owner[level] = Some(cluster),
                Some(existing) if existing != cluster => return false,
                Some(_) => {}
            }
        }
        true
    }
}
