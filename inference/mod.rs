//! Post-estimation inference: covariance estimators, small-sample
//! corrections, reference distributions and randomization inference.

pub mod distributions;
pub mod ritest;
pub mod ssc;
pub mod vcov;
