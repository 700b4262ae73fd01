//! Run configuration
//!
//! Every estimator takes its parameters explicitly; [`TvfConfig`] is the one
//! place they are collected for the runner. Configurations round-trip
//! through JSON and missing fields fall back to their defaults.

use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::returns::{Interpolation, ReturnMode};
use crate::runner::horizon::{AutoGamma, AutoStrategy};
use crate::train::loss::ValueLossFn;
use crate::tvf::{HorizonDistribution, ScaleFunction};

/// Largest supported value-curve horizon
pub const MAX_HORIZON: usize = 30000;

/// Rollout and return-estimation parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TvfConfig {
    /// Seed for every random draw the runner makes
    pub seed: u64,

    /// Steps per rollout (N)
    pub n_steps: usize,

    /// Parallel agents (A)
    pub agents: usize,

    /// Discount used for advantages
    pub gamma: f32,

    /// Discount the value curve is learned under
    pub tvf_gamma: f32,

    /// GAE lambda for advantages
    pub gae_lambda: f32,

    /// Lambda for the scalar return targets
    pub td_lambda: f32,

    /// Use GAE over the value curve instead of scalar GAE
    pub tvf_gae: bool,

    /// Largest horizon the value curve covers
    pub tvf_max_horizon: usize,

    /// Horizons to train on per batch, `None` for all of them
    pub tvf_horizon_samples: Option<usize>,

    /// Placement of the training horizons
    pub tvf_horizon_distribution: HorizonDistribution,

    /// Horizons the value curve is queried at, `None` for all of them
    pub tvf_value_samples: Option<usize>,

    /// Placement of the query horizons
    pub tvf_value_distribution: HorizonDistribution,

    /// Estimator for the value-curve targets
    pub tvf_return_mode: ReturnMode,

    /// Interpolation between value samples
    pub interpolation: Interpolation,

    /// Also produce second-moment targets
    pub learn_second_moment: bool,

    /// Separate estimator for the second moment, `None` to share
    /// `tvf_return_mode`
    pub sqr_return_mode: Option<ReturnMode>,

    /// Adapt the horizon during training
    pub auto_horizon: bool,

    /// Signal the adaptive horizon follows
    pub auto_strategy: AutoStrategy,

    /// Derive discounts from the adaptive horizon
    pub auto_gamma: AutoGamma,

    /// Drift of the annealing random walk (log2 space)
    pub sa_mu: f32,

    /// Step size of the annealing random walk (log2 space)
    pub sa_sigma: f32,

    /// Starting value of the annealed horizon
    pub sa_initial_value: f32,

    /// Largest batch handed to the model in one call
    pub max_micro_batch_size: usize,

    /// Normalize advantages per batch
    pub normalize_advantages: bool,

    /// Multiplier applied to extrinsic advantages
    pub extrinsic_reward_scale: f32,

    /// Loss used when fitting the value curve
    pub tvf_loss_fn: ValueLossFn,

    /// Scaling of the horizon feature
    pub tvf_horizon_scale: ScaleFunction,

    /// Scaling of the time feature
    pub tvf_time_scale: ScaleFunction,
}

impl Default for TvfConfig {
    fn default() -> Self {
        Self {
            seed: 0,
            n_steps: 128,
            agents: 8,
            gamma: 0.99,
            tvf_gamma: 0.99,
            gae_lambda: 0.95,
            td_lambda: 0.95,
            tvf_gae: false,
            tvf_max_horizon: 1000,
            tvf_horizon_samples: Some(64),
            tvf_horizon_distribution: HorizonDistribution::FixedGeometric,
            tvf_value_samples: Some(64),
            tvf_value_distribution: HorizonDistribution::FixedGeometric,
            tvf_return_mode: ReturnMode::Lambda { lambda: 0.95 },
            interpolation: Interpolation::Linear,
            learn_second_moment: false,
            sqr_return_mode: None,
            auto_horizon: false,
            auto_strategy: AutoStrategy::EpisodeLength,
            auto_gamma: AutoGamma::Off,
            sa_mu: 0.0,
            sa_sigma: 0.05,
            sa_initial_value: 1000.0,
            max_micro_batch_size: 512,
            normalize_advantages: true,
            extrinsic_reward_scale: 1.0,
            tvf_loss_fn: ValueLossFn::Mse,
            tvf_horizon_scale: ScaleFunction::Default,
            tvf_time_scale: ScaleFunction::Default,
        }
    }
}

impl TvfConfig {
    /// Create a new default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Read a configuration from a JSON file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let config: Self = serde_json::from_str(&text)
            .with_context(|| format!("failed to parse config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Write the configuration to a JSON file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let text = serde_json::to_string_pretty(self)?;
        fs::write(path, text).with_context(|| format!("failed to write config {}", path.display()))
    }

    /// Validate configuration parameters
    pub fn validate(&self) -> Result<()> {
        if self.n_steps == 0 {
            bail!("n_steps must be positive");
        }
        if self.agents == 0 {
            bail!("agents must be positive");
        }
        if !(self.gamma > 0.0 && self.gamma <= 1.0) {
            bail!("gamma must be in (0, 1], got {}", self.gamma);
        }
        if !(self.tvf_gamma > 0.0 && self.tvf_gamma <= 1.0) {
            bail!("tvf_gamma must be in (0, 1], got {}", self.tvf_gamma);
        }
        if !(0.0..=1.0).contains(&self.gae_lambda) {
            bail!("gae_lambda must be in [0, 1]");
        }
        if !(0.0..=1.0).contains(&self.td_lambda) {
            bail!("td_lambda must be in [0, 1]");
        }
        if self.tvf_gae && self.tvf_gamma != 1.0 {
            bail!("tvf_gae requires an undiscounted value curve (tvf_gamma = 1), got {}", self.tvf_gamma);
        }
        if self.tvf_gae && self.auto_gamma.drives_tvf_gamma() {
            bail!("tvf_gae can't be combined with an adaptive tvf_gamma");
        }
        if self.tvf_max_horizon == 0 || self.tvf_max_horizon > MAX_HORIZON {
            bail!("tvf_max_horizon must be in [1, {}], got {}", MAX_HORIZON, self.tvf_max_horizon);
        }
        if matches!(self.tvf_value_samples, Some(k) if k < 2) {
            bail!("tvf_value_samples must be at least 2 so that 0 and the max horizon are sampled");
        }
        if matches!(self.tvf_horizon_samples, Some(0)) {
            bail!("tvf_horizon_samples must be positive");
        }
        validate_mode("tvf_return_mode", self.tvf_return_mode)?;
        if let Some(mode) = self.sqr_return_mode {
            validate_mode("sqr_return_mode", mode)?;
        }
        if self.sa_sigma < 0.0 {
            bail!("sa_sigma must be non-negative");
        }
        if self.sa_initial_value <= 0.0 {
            bail!("sa_initial_value must be positive");
        }
        if self.max_micro_batch_size == 0 {
            bail!("max_micro_batch_size must be positive");
        }
        if !self.extrinsic_reward_scale.is_finite() {
            bail!("extrinsic_reward_scale must be finite");
        }
        Ok(())
    }

    /// Set the random seed
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Set rollout length
    pub fn n_steps(mut self, n_steps: usize) -> Self {
        self.n_steps = n_steps;
        self
    }

    /// Set number of agents
    pub fn agents(mut self, agents: usize) -> Self {
        self.agents = agents;
        self
    }

    /// Set advantage discount
    pub fn gamma(mut self, gamma: f32) -> Self {
        self.gamma = gamma;
        self
    }

    /// Set value-curve discount
    pub fn tvf_gamma(mut self, gamma: f32) -> Self {
        self.tvf_gamma = gamma;
        self
    }

    /// Set GAE lambda
    pub fn gae_lambda(mut self, lambda: f32) -> Self {
        self.gae_lambda = lambda;
        self
    }

    /// Set lambda for scalar return targets
    pub fn td_lambda(mut self, lambda: f32) -> Self {
        self.td_lambda = lambda;
        self
    }

    /// Enable GAE over the value curve
    pub fn tvf_gae(mut self, enabled: bool) -> Self {
        self.tvf_gae = enabled;
        self
    }

    /// Set the largest horizon
    pub fn tvf_max_horizon(mut self, horizon: usize) -> Self {
        self.tvf_max_horizon = horizon;
        self
    }

    /// Set training horizon count and distribution
    pub fn tvf_horizon_samples(
        mut self,
        samples: Option<usize>,
        distribution: HorizonDistribution,
    ) -> Self {
        self.tvf_horizon_samples = samples;
        self.tvf_horizon_distribution = distribution;
        self
    }

    /// Set query horizon count and distribution
    pub fn tvf_value_samples(
        mut self,
        samples: Option<usize>,
        distribution: HorizonDistribution,
    ) -> Self {
        self.tvf_value_samples = samples;
        self.tvf_value_distribution = distribution;
        self
    }

    /// Set the value-curve target estimator
    pub fn tvf_return_mode(mut self, mode: ReturnMode) -> Self {
        self.tvf_return_mode = mode;
        self
    }

    /// Set the interpolation between value samples
    pub fn interpolation(mut self, interpolation: Interpolation) -> Self {
        self.interpolation = interpolation;
        self
    }

    /// Enable second-moment targets, optionally with their own estimator
    pub fn learn_second_moment(mut self, enabled: bool, mode: Option<ReturnMode>) -> Self {
        self.learn_second_moment = enabled;
        self.sqr_return_mode = mode;
        self
    }

    /// Enable the adaptive horizon
    pub fn auto_horizon(mut self, strategy: AutoStrategy) -> Self {
        self.auto_horizon = true;
        self.auto_strategy = strategy;
        self
    }

    /// Derive discounts from the adaptive horizon
    pub fn auto_gamma(mut self, auto_gamma: AutoGamma) -> Self {
        self.auto_gamma = auto_gamma;
        self
    }

    /// Set the annealing random walk
    pub fn simulated_annealing(mut self, mu: f32, sigma: f32, initial_value: f32) -> Self {
        self.sa_mu = mu;
        self.sa_sigma = sigma;
        self.sa_initial_value = initial_value;
        self
    }

    /// Set the model micro-batch size
    pub fn max_micro_batch_size(mut self, size: usize) -> Self {
        self.max_micro_batch_size = size;
        self
    }

    /// Enable advantage normalization
    pub fn normalize_advantages(mut self, enabled: bool) -> Self {
        self.normalize_advantages = enabled;
        self
    }

    /// Set the extrinsic advantage multiplier
    pub fn extrinsic_reward_scale(mut self, scale: f32) -> Self {
        self.extrinsic_reward_scale = scale;
        self
    }

    /// Set the value-curve loss
    pub fn tvf_loss_fn(mut self, loss: ValueLossFn) -> Self {
        self.tvf_loss_fn = loss;
        self
    }

    /// Set the feature scalings
    pub fn feature_scales(mut self, horizon: ScaleFunction, time: ScaleFunction) -> Self {
        self.tvf_horizon_scale = horizon;
        self.tvf_time_scale = time;
        self
    }
}

fn validate_mode(name: &str, mode: ReturnMode) -> Result<()> {
    match mode {
        ReturnMode::Fixed { n_step: 0 } | ReturnMode::Adaptive { n_step: 0, .. } => {
            bail!("{}: n_step must be positive", name)
        }
        ReturnMode::Lambda { lambda } if !(0.0..=1.0).contains(&lambda) => {
            bail!("{}: lambda must be in [0, 1], got {}", name, lambda)
        }
        ReturnMode::Adaptive { ratio, .. } if ratio <= 0.0 => {
            bail!("{}: ratio must be positive, got {}", name, ratio)
        }
        _ => Ok(()),
    }
}
