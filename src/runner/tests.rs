use anyhow::Result;
use ndarray::{Array2, Array3, ArrayView3, Axis};

use super::*;
use crate::env::pool::EnvPool;
use crate::env::simple_bandit::SimpleBandit;
use crate::policy::ValuePrediction;
use crate::train::ValueLossFn;
use crate::tvf::HorizonDistribution;

/// Uniform policy over two actions with value `rate · h`
struct LinearValueModel {
    rate: f32,
    broken: bool,
}

impl LinearValueModel {
    fn new(rate: f32) -> Self {
        Self { rate, broken: false }
    }
}

impl TvfModel for LinearValueModel {
    fn num_actions(&self) -> usize {
        2
    }

    fn log_policy(&self, observations: &[Vec<f32>]) -> Result<Array2<f32>> {
        let rows = if self.broken { observations.len() + 1 } else { observations.len() };
        Ok(Array2::from_elem((rows, 2), 0.5_f32.ln()))
    }

    fn predict_values(
        &self,
        _observations: &[Vec<f32>],
        aux: ArrayView3<f32>,
    ) -> Result<ValuePrediction> {
        let value = aux.index_axis(Axis(2), 0).mapv(|h| h * self.rate);
        Ok(ValuePrediction { sqrt_m2: Some(value.clone()), value })
    }
}

type TestRunner = Runner<LinearValueModel, EnvPool<SimpleBandit>>;

fn test_config() -> TvfConfig {
    TvfConfig::new()
        .seed(3)
        .n_steps(8)
        .agents(2)
        .tvf_max_horizon(100)
        .tvf_horizon_samples(Some(16), HorizonDistribution::FixedGeometric)
        .tvf_value_samples(Some(16), HorizonDistribution::FixedGeometric)
}

fn bandit_pool(episode_length: usize) -> EnvPool<SimpleBandit> {
    EnvPool::from_envs(vec![
        SimpleBandit::with_seed(1).max_steps(episode_length),
        SimpleBandit::with_seed(2).max_steps(episode_length),
    ])
}

fn ready_runner(config: TvfConfig, model: LinearValueModel) -> TestRunner {
    let mut runner = Runner::new(config, model).unwrap();
    runner.attach_env(bandit_pool(5)).unwrap();
    runner.reset().unwrap();
    runner
}

#[test]
fn test_rollout_requires_reset() {
    let mut runner: TestRunner = Runner::new(test_config(), LinearValueModel::new(0.5)).unwrap();
    assert_eq!(runner.state(), RunnerState::Uninitialized);
    assert!(runner.generate_rollout().is_err());

    runner.attach_env(bandit_pool(5)).unwrap();
    assert!(runner.generate_rollout().is_err());

    runner.reset().unwrap();
    assert_eq!(runner.state(), RunnerState::Ready);
    assert!(runner.generate_rollout().is_ok());
}

#[test]
fn test_returns_require_rollout() {
    let mut runner = ready_runner(test_config(), LinearValueModel::new(0.5));
    let err = runner.calculate_returns().unwrap_err();
    assert!(err.to_string().contains("no rollout"));
}

#[test]
fn test_attach_env_checks_agents() {
    let mut runner: TestRunner =
        Runner::new(test_config().agents(3), LinearValueModel::new(0.5)).unwrap();
    assert!(runner.attach_env(bandit_pool(5)).is_err());
}

#[test]
fn test_invalid_config_is_rejected() {
    let result: Result<TestRunner> =
        Runner::new(test_config().gamma(2.0), LinearValueModel::new(0.5));
    assert!(result.is_err());
}

#[test]
fn test_rollout_fills_buffer() {
    let mut runner = ready_runner(test_config(), LinearValueModel::new(0.5));
    runner.generate_rollout().unwrap();

    let buffer = runner.buffer();
    assert_eq!(buffer.shape(), (8, 2));
    for agent in 0..2 {
        // episodes of five steps end at t = 4
        for t in 0..8 {
            assert_eq!(buffer.dones()[[t, agent]], t == 4);
        }
        assert_eq!(buffer.time()[[0, agent]], 0.0);
        assert!((buffer.time()[[4, agent]] - 0.8).abs() < 1e-6);
        assert_eq!(buffer.time()[[5, agent]], 0.0);
        assert!((buffer.time()[[8, agent]] - 0.6).abs() < 1e-6);
    }
    assert_eq!(buffer.raw_rewards(), buffer.rewards());
    assert!(buffer.log_policy().iter().all(|&lp| (lp - 0.5_f32.ln()).abs() < 1e-6));

    assert_eq!(runner.stats().ep_count(), 2);
    assert_eq!(runner.total_steps(), 16);
    assert_eq!(runner.agent_age(), 8);
}

#[test]
fn test_failed_rollout_needs_reset() {
    let mut model = LinearValueModel::new(0.5);
    model.broken = true;
    let mut runner = ready_runner(test_config(), model);

    let err = runner.generate_rollout().unwrap_err();
    assert!(err.to_string().contains("log policy"));
    assert_eq!(runner.state(), RunnerState::Uninitialized);
}

#[test]
fn test_calculate_returns_without_rediscount() {
    let mut runner = ready_runner(test_config(), LinearValueModel::new(0.5));
    runner.generate_rollout().unwrap();
    let batch = runner.calculate_returns().unwrap();

    assert_eq!(batch.values.dim(), (9, 2));
    assert_eq!(batch.current_horizon, 100);
    // gamma equals tvf_gamma, so values come straight from the curve
    assert!(batch.values.iter().all(|&v| (v - 50.0).abs() < 1e-4));
    assert_eq!(batch.advantage.dim(), (8, 2));
    assert_eq!(batch.ext_returns.dim(), (8, 2));

    // normalized advantages have zero mean
    assert!(batch.advantage.mean().unwrap().abs() < 1e-4);
}

#[test]
fn test_calculate_returns_rediscounts() {
    let config = test_config().tvf_gamma(1.0).tvf_max_horizon(1000);
    let mut runner = ready_runner(config, LinearValueModel::new(0.5));
    runner.generate_rollout().unwrap();
    let batch = runner.calculate_returns().unwrap();

    // 0.5 per step discounted at 0.99 is worth about 50, far below the
    // undiscounted 500
    for &v in batch.values.iter() {
        assert!(v > 45.0 && v < 52.0, "rediscounted value {}", v);
    }
}

#[test]
fn test_calculate_returns_with_tvf_gae() {
    let config = test_config()
        .tvf_gamma(1.0)
        .tvf_gae(true)
        .normalize_advantages(false)
        .extrinsic_reward_scale(2.0);
    let mut runner = ready_runner(config, LinearValueModel::new(0.5));
    runner.generate_rollout().unwrap();
    let batch = runner.calculate_returns().unwrap();

    assert_eq!(batch.ext_advantage.dim(), (8, 2));
    assert!(batch.ext_advantage.iter().all(|a| a.is_finite()));
    let scaled = &batch.ext_advantage * 2.0;
    assert_eq!(batch.advantage, scaled);
}

#[test]
fn test_return_sample_shapes() {
    let config = test_config().learn_second_moment(true, Some(ReturnMode::TemporalDifference));
    let mut runner = ready_runner(config, LinearValueModel::new(0.5));
    runner.generate_rollout().unwrap();
    let sample = runner.generate_return_sample(true).unwrap();

    let h = sample.horizons.len();
    assert_eq!(h, 16);
    assert_eq!(sample.horizons[0], 0);
    assert_eq!(sample.horizons[h - 1], 100);
    assert!(sample.horizons.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(sample.returns.dim(), (8, 2, h));

    let m2 = sample.returns_m2.expect("second moment requested");
    assert_eq!(m2.dim(), (8, 2, h));
    // horizon zero has no return
    for t in 0..8 {
        for a in 0..2 {
            assert_eq!(sample.returns[[t, a, 0]], 0.0);
            assert_eq!(m2[[t, a, 0]], 0.0);
        }
    }
}

#[test]
fn test_second_moment_targets_are_square_rooted() {
    let config = test_config()
        .tvf_return_mode(ReturnMode::TemporalDifference)
        .tvf_value_samples(None, HorizonDistribution::FixedLinear)
        .learn_second_moment(true, None);
    let mut runner = ready_runner(config, LinearValueModel::new(0.5));
    runner.generate_rollout().unwrap();
    let sample = runner.generate_return_sample(true).unwrap();
    let m2 = sample.returns_m2.unwrap();

    // one-step targets from a deterministic curve: E[G²] = G², so the
    // reported target is G itself
    for (first, second) in sample.returns.iter().zip(m2.iter()) {
        assert!((second - first).abs() < 1e-3 * first.max(1.0), "{} vs {}", second, first);
    }
}

#[test]
fn test_value_loss_uses_configured_loss() {
    let loss_with = |loss_fn| {
        let config = test_config()
            .tvf_return_mode(ReturnMode::TemporalDifference)
            .tvf_loss_fn(loss_fn);
        let mut runner = ready_runner(config, LinearValueModel::new(0.5));
        runner.generate_rollout().unwrap();
        let sample = runner.generate_return_sample(true).unwrap();
        let (loss, m2_loss) = runner.value_loss(&sample).unwrap();
        assert!(m2_loss.is_none());
        loss
    };

    // the same rollout under both losses: mean |e| can't exceed sqrt(mean e²)
    let mse = loss_with(ValueLossFn::Mse);
    let abs = loss_with(ValueLossFn::Huber { delta: 0.0 });
    assert!(mse > 0.0 && abs > 0.0);
    assert!(abs * abs <= mse * (1.0 + 1e-5), "abs {} mse {}", abs, mse);
}

#[test]
fn test_value_loss_rejects_foreign_sample() {
    let mut runner = ready_runner(test_config(), LinearValueModel::new(0.5));
    runner.generate_rollout().unwrap();
    let mut sample = runner.generate_return_sample(true).unwrap();
    sample.returns = Array3::zeros((3, 2, sample.horizons.len()));
    assert!(runner.value_loss(&sample).is_err());
}

#[test]
fn test_return_sample_without_second_moment() {
    let mut runner = ready_runner(test_config(), LinearValueModel::new(0.5));
    runner.generate_rollout().unwrap();
    let sample = runner.generate_return_sample(false).unwrap();
    assert!(sample.returns_m2.is_none());
}

#[test]
fn test_runs_are_reproducible() {
    let run = || {
        let mut runner = ready_runner(
            test_config().tvf_horizon_samples(Some(8), HorizonDistribution::Geometric),
            LinearValueModel::new(0.5),
        );
        runner.generate_rollout().unwrap();
        let sample = runner.generate_return_sample(false).unwrap();
        (runner.buffer().actions().to_owned(), sample.horizons, sample.returns)
    };

    let (actions_a, horizons_a, returns_a) = run();
    let (actions_b, horizons_b, returns_b) = run();
    assert_eq!(actions_a, actions_b);
    assert_eq!(horizons_a, horizons_b);
    assert_eq!(returns_a, returns_b);
}

#[test]
fn test_value_quality() {
    let mut runner = ready_runner(test_config(), LinearValueModel::new(0.5));
    runner.generate_rollout().unwrap();
    let quality = runner.value_quality().unwrap();

    assert_eq!(quality.horizons, vec![1, 3, 10, 30, 100]);
    assert_eq!(quality.explained_variance.len(), 5);
    assert!(quality.mse.iter().all(|m| m.is_finite()));
    assert!((quality.mean_value[0] - 0.5).abs() < 1e-5);
}

#[test]
fn test_auto_horizon_from_episode_length() {
    let config = test_config().tvf_max_horizon(5000).auto_horizon(AutoStrategy::EpisodeLength);
    let runner = ready_runner(config, LinearValueModel::new(0.5));

    // history is seeded with a single episode of 1000 steps
    assert_eq!(runner.auto_horizon(), 1000.0);
    assert_eq!(runner.current_horizon(), 3000);
}

#[test]
fn test_auto_gamma_follows_horizon() {
    let config = test_config()
        .auto_horizon(AutoStrategy::EpisodeLength)
        .auto_gamma(horizon::AutoGamma::Gamma);
    let runner = ready_runner(config, LinearValueModel::new(0.5));

    assert!((runner.gamma() - (1.0 - 1.0 / 1000.0)).abs() < 1e-6);
    assert_eq!(runner.tvf_gamma(), 0.99);
}

#[test]
fn test_annealing_scored_by_reward() {
    let config = test_config().auto_horizon(AutoStrategy::SaReward);
    let mut runner = ready_runner(config, LinearValueModel::new(0.5));
    assert_eq!(runner.horizon_sa().acceptance_rate(), 0.0);

    runner.generate_rollout().unwrap();
    runner.calculate_returns().unwrap();

    // anything beats the initial score
    assert_eq!(runner.horizon_sa().acceptance_rate(), 1.0);
    assert!(runner.horizon_sa().prev_score() >= 0.0);
}

#[test]
fn test_annealing_steps_once_per_rollout() {
    let config = test_config().auto_horizon(AutoStrategy::SaReturn);
    let mut runner = ready_runner(config, LinearValueModel::new(0.5));
    runner.generate_rollout().unwrap();

    let first = runner.calculate_returns().unwrap();
    let candidate = runner.horizon_sa().neighbour();
    let prev_score = runner.horizon_sa().prev_score();

    let again = runner.calculate_returns().unwrap();
    assert_eq!(runner.horizon_sa().neighbour(), candidate);
    assert_eq!(runner.horizon_sa().prev_score(), prev_score);
    assert_eq!(again.current_horizon, first.current_horizon);
    assert_eq!(again.advantage, first.advantage);

    runner.generate_rollout().unwrap();
    runner.calculate_returns().unwrap();
    assert_ne!(runner.horizon_sa().neighbour(), candidate);
}

#[test]
fn test_annealing_scored_by_return() {
    let config = test_config()
        .auto_horizon(AutoStrategy::SaReturn)
        .auto_gamma(horizon::AutoGamma::Gamma);
    let mut runner = ready_runner(config, LinearValueModel::new(0.5));

    for _ in 0..2 {
        let candidate = runner.horizon_sa().neighbour();
        runner.generate_rollout().unwrap();
        runner.calculate_returns().unwrap();
        // every scored candidate is replaced by a fresh proposal
        assert_ne!(runner.horizon_sa().neighbour(), candidate);
    }
    assert!(runner.gamma() > 0.9 && runner.gamma() < 1.0);
}
