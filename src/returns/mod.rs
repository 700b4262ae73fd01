//! Return and advantage estimation
//!
//! Two families of estimators live here:
//!
//! - [`gae`]: scalar returns and advantages over `[N, A]` rollouts (GAE,
//!   bootstrapped returns, GAE over a value curve)
//! - [`tvf`]: multi-horizon targets `[N, A, H]` for training a truncated
//!   value function (TD, n-step, Monte-Carlo, λ-mixtures) along with their
//!   second-moment counterparts
//!
//! [`get_return_estimate`] ties the multi-horizon estimators to a sparse
//! sample of the value curve.

use std::fmt;

use serde::{Deserialize, Serialize};

pub mod gae;
pub mod sampled;
pub mod tvf;


pub use gae::{
    calculate_bootstrapped_returns, calculate_gae, calculate_gae_tvf, calculate_tp_returns,
    normalize_advantages,
};
pub use sampled::{
    get_return_estimate, Interpolation, ReturnEstimate, ReturnRequest, SecondMomentRequest,
};
pub use tvf::{
    calculate_tvf_adaptive, calculate_tvf_adaptive_m2, calculate_tvf_lambda,
    calculate_tvf_lambda_m2, calculate_tvf_mc, calculate_tvf_mc_m2, calculate_tvf_n_step,
    calculate_tvf_n_step_m2, calculate_tvf_td, calculate_tvf_td_m2,
};

/// Estimator used to build multi-horizon targets
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReturnMode {
    /// n-step targets with a fixed n
    Fixed {
        /// Number of real rewards before bootstrapping
        n_step: usize,
    },
    /// Real rewards to the end of the rollout
    MonteCarlo,
    /// One-step targets
    TemporalDifference,
    /// Mixture of n-step targets
    Lambda {
        /// Mixing parameter in `[0, 1]`
        lambda: f32,
    },
    /// n-step targets with n proportional to the horizon, capped at `n_step`
    Adaptive {
        /// Largest n
        n_step: usize,
        /// n per unit of horizon
        ratio: f32,
    },
}

impl Default for ReturnMode {
    fn default() -> Self {
        ReturnMode::Lambda { lambda: 0.95 }
    }
}

impl fmt::Display for ReturnMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReturnMode::Fixed { n_step } => write!(f, "fixed(n={})", n_step),
            ReturnMode::MonteCarlo => f.write_str("monte_carlo"),
            ReturnMode::TemporalDifference => f.write_str("temporal_difference"),
            ReturnMode::Lambda { lambda } => write!(f, "lambda({})", lambda),
            ReturnMode::Adaptive { n_step, ratio } => {
                write!(f, "adaptive(n={}, ratio={})", n_step, ratio)
            }
        }
    }
}
