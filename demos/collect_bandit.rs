//! Collect SimpleBandit rollouts and estimate TVF returns
//!
//! The model here is not learned. It plays the bandit perfectly and predicts
//! a value curve that is deliberately too optimistic, so the advantages and
//! the value-quality report show how far the curve is from the truth.
//!
//! # Usage
//!
//! ```bash
//! RUST_LOG=debug cargo run --example collect_bandit
//! ```

use anyhow::Result;
use ndarray::{Array2, ArrayView3};
use tracing_subscriber::EnvFilter;
use tvf_rl::{
    env::{pool::EnvPool, simple_bandit::SimpleBandit},
    prelude::*,
};

const NUM_ENVS: usize = 4;
const NUM_STEPS: usize = 64;
const EPISODE_LENGTH: usize = 50;
const ROLLOUTS: usize = 5;

/// Optimal policy with a value curve that assumes episodes never end
struct OptimisticBandit;

impl TvfModel for OptimisticBandit {
    fn num_actions(&self) -> usize {
        2
    }

    fn log_policy(&self, observations: &[Vec<f32>]) -> Result<Array2<f32>> {
        let mut log_probs = Array2::from_elem((observations.len(), 2), (0.05_f32).ln());
        for (i, obs) in observations.iter().enumerate() {
            log_probs[[i, obs[0] as usize]] = (0.95_f32).ln();
        }
        Ok(log_probs)
    }

    fn predict_values(
        &self,
        _observations: &[Vec<f32>],
        aux: ArrayView3<f32>,
    ) -> Result<ValuePrediction> {
        let (batch, horizons, _) = aux.dim();
        let value = Array2::from_shape_fn((batch, horizons), |(b, k)| aux[[b, k, 0]]);
        Ok(ValuePrediction { value, sqrt_m2: None })
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = TvfConfig::new()
        .seed(7)
        .n_steps(NUM_STEPS)
        .agents(NUM_ENVS)
        .tvf_max_horizon(300)
        .tvf_return_mode(ReturnMode::Lambda { lambda: 0.95 })
        .tvf_value_samples(Some(32), HorizonDistribution::FixedGeometric)
        .auto_horizon(AutoStrategy::EpisodeLength)
        .auto_gamma(AutoGamma::Gamma);

    let envs = (0..NUM_ENVS)
        .map(|i| SimpleBandit::with_seed(i as u64).max_steps(EPISODE_LENGTH))
        .collect();

    let mut runner = Runner::new(config, OptimisticBandit)?;
    runner.attach_env(EnvPool::from_envs(envs))?;
    runner.reset()?;

    tracing::info!("Collecting {} rollouts of {}x{}", ROLLOUTS, NUM_STEPS, NUM_ENVS);

    for rollout in 0..ROLLOUTS {
        runner.generate_rollout()?;
        let batch = runner.calculate_returns()?;
        let sample = runner.generate_return_sample(false)?;
        let quality = runner.value_quality()?;

        let mean_reward = runner.buffer().rewards().mean().unwrap_or(0.0);
        let mean_return = batch.ext_returns.mean().unwrap_or(0.0);

        tracing::info!(
            "Rollout {}: horizon {} gamma {:.4} reward {:.3} return {:.2} episodes {}",
            rollout + 1,
            batch.current_horizon,
            batch.gamma,
            mean_reward,
            mean_return,
            runner.stats().ep_count(),
        );
        tracing::info!(
            "  {} target horizons, curve ev {:.3}",
            sample.horizons.len(),
            quality.average_explained_variance,
        );
        for ((h, ev), mse) in quality
            .horizons
            .iter()
            .zip(quality.explained_variance.iter())
            .zip(quality.mse.iter())
        {
            tracing::debug!("    h={:<4} ev={:>7.3} mse={:.3}", h, ev, mse);
        }
    }

    Ok(())
}
