//! The results of one multiple-estimation call.

use crate::cache::CacheStats;
use crate::estimate::EstimationError;
use crate::fit::FitResult;
use std::fmt;

/// Fitted models in the order their specs were expanded.
#[derive(Debug, Clone)]
pub struct MultiFit {
    models: Vec<FitResult>,
    cache_stats: CacheStats,
}

impl MultiFit {
    pub(crate) fn new(models: Vec<FitResult>, cache_stats: CacheStats) -> Self {
        Self {
            models,
            cache_stats,
        }
    }

    pub fn fetch_model(&self, index: usize) -> Result<&FitResult, EstimationError> {
        self.models
            .get(index)
            .ok_or(EstimationError::ModelIndexOutOfRange {
                index,
                len: self.models.len(),
            })
    }

    pub fn models(&self) -> &[FitResult] {
        &self.models
    }

    pub fn into_models(self) -> Vec<FitResult> {
        self.models
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &FitResult> {
        self.models.iter()
    }

    /// Hits and misses of the demeaning cache shared by all models.
    pub fn cache_stats(&self) -> CacheStats {
        self.cache_stats
    }
}

impl<'a> IntoIterator for &'a MultiFit {
    type Item = &'a FitResult;
    type IntoIter = std::slice::Iter<'a, FitResult>;

    fn into_iter(self) -> Self::IntoIter {
        self.models.iter()
    }
}

impl fmt::Display for MultiFit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, model) in self.models.iter().enumerate() {
            if i > 0 {
                writeln!(f, "---")?;
            }
            writeln!(f, "Model {i}")?;
            write!(f, "{model}")?;
        }
        Ok(())
    }
}
