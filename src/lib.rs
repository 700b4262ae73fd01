//! # tvf-rl
//!
//! Return and advantage estimation for truncated value functions
//!
//! A truncated value function (TVF) learns a curve of value estimates indexed
//! by horizon rather than a single discounted value. This crate provides the
//! estimators that turn a rollout and a sampled value curve into training
//! targets and advantages, and the runner that collects rollouts for them.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use tvf_rl::prelude::*;
//! use tvf_rl::env::{pool::EnvPool, simple_bandit::SimpleBandit};
//!
//! # fn run<M: TvfModel>(model: M) -> anyhow::Result<()> {
//! let config = TvfConfig::new().n_steps(64).agents(4);
//! let mut runner = Runner::new(config, model)?;
//! runner.attach_env(EnvPool::new(SimpleBandit::new, 4))?;
//! runner.reset()?;
//!
//! runner.generate_rollout()?;
//! let batch = runner.calculate_returns()?;
//! let sample = runner.generate_return_sample(true)?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Run configuration
pub mod config;

/// Environment traits and implementations
pub mod env;

/// Model contract; the tch reference model requires the training feature
pub mod policy;

/// Horizon sampling, value-curve queries and rediscounting
pub mod tvf;

/// Return and advantage estimators
pub mod returns;

/// Rollout storage
pub mod buffer;

/// Rollout collection and adaptive horizons
pub mod runner;

/// Value-curve losses and diagnostics
pub mod train;

/// Prelude module for convenient imports
///
/// This module re-exports commonly used types and traits for convenience.
pub mod prelude {
    pub use crate::buffer::RolloutBuffer;
    pub use crate::config::TvfConfig;
    pub use crate::env::{Environment, VecEnv};
    pub use crate::policy::{TvfModel, ValuePrediction};
    pub use crate::returns::{ReturnMode, ReturnRequest};
    pub use crate::runner::horizon::{AutoGamma, AutoStrategy};
    pub use crate::runner::{BatchReturns, ReturnSample, Runner};
    pub use crate::tvf::{HorizonDistribution, HorizonSampler, ValueCurveEstimator};
}

/// Current version of tvf-rl
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert_eq!(VERSION, "0.1.0");
    }
}
