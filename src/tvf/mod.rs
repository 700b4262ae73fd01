//! Truncated value function building blocks
//!
//! A truncated value function predicts, for every state, the discounted sum
//! of rewards over the next `h` steps for any horizon `h`. This module holds
//! the pieces that deal with that curve directly:
//!
//! - [`horizons`]: which horizons to sample and train on
//! - [`features`]: packing `(horizon, time)` into model inputs
//! - [`value_curve`]: micro-batched queries against a model
//! - [`rediscount`]: reading a curve back under a different discount

pub mod features;
pub mod horizons;
pub mod rediscount;
pub mod value_curve;

pub use features::{package_aux_features, ScaleFunction};
pub use horizons::{HorizonDistribution, HorizonSampler};
pub use rediscount::rediscount;
pub use value_curve::ValueCurveEstimator;
