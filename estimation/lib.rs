//! # hdfe
//!
//! Linear, instrumental-variable and Poisson regression with high-dimensional
//! fixed effects, absorbed by alternating projections rather than dummy
//! variables. Fits carry everything needed for post-estimation inference:
//! alternative covariance estimators and randomization inference.
//!
//! The usual entry points are [`feols`] and [`fepois`], which take a formula
//! such as `"Y ~ X1 + X2 | f1 + f2"`, a [`Dataset`] and an
//! [`EstimationConfig`], and return a [`MultiFit`] with one [`FitResult`] per
//! expanded model.

pub mod cache;
pub mod collinear;
pub mod compression;
pub mod config;
pub mod data;
pub mod demean;
pub mod estimate;
pub mod fit;
pub mod fixef;
pub mod formula;
pub mod iv;
pub mod iwls;
pub mod model;
pub mod multi;

#[path = "../inference/mod.rs"]
pub mod inference;

pub use config::{EstimationConfig, WeightsType};
pub use data::{Dataset, load_dataset};
pub use estimate::{EstimationError, feols, fepois};
pub use fit::FitResult;
pub use inference::ritest::{RitestOptions, RitestResult};
pub use inference::ssc::SscConfig;
pub use inference::vcov::VcovType;
pub use model::{ModelFamily, ModelSpec};
pub use multi::MultiFit;
