//! Training-side consumers of the return estimates
//!
//! Loss formulas for fitting the value curve and diagnostics describing how
//! well it fits.

pub mod loss;

pub use loss::{explained_variance, mean_loss, CurveQuality, ValueLossFn};
