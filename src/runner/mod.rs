//! Rollout collection and return calculation
//!
//! [`Runner`] owns the rollout buffer, the random state and the episode
//! bookkeeping. It steps a [`VecEnv`] with actions sampled from a
//! [`TvfModel`], then turns the collected batch into advantages and
//! multi-horizon return targets.
//!
//! # Lifecycle
//!
//! ```text
//! Uninitialized --attach_env + reset--> Ready --generate_rollout--> Collecting --> Ready
//! ```
//!
//! A failed rollout drops the runner back to `Uninitialized`; call
//! [`Runner::reset`] before collecting again.
//!
//! # Example
//!
//! ```rust,ignore
//! let mut runner = Runner::new(config, model)?;
//! runner.attach_env(EnvPool::new(SimpleBandit::new, 8))?;
//! runner.reset()?;
//!
//! runner.generate_rollout()?;
//! let batch = runner.calculate_returns()?;
//! let targets = runner.generate_return_sample(true)?;
//! ```

use anyhow::{bail, Result};
use ndarray::{s, Array1, Array2, Array3, Axis};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info, warn};

use crate::buffer::{RolloutBuffer, RolloutSnapshot};
use crate::config::TvfConfig;
use crate::env::VecEnv;
use crate::policy::{sample_action, TvfModel};
use crate::returns::{
    calculate_gae, calculate_gae_tvf, get_return_estimate, normalize_advantages, ReturnEstimate,
    ReturnMode, ReturnRequest, SecondMomentRequest,
};
use crate::train::{mean_loss, CurveQuality};
use crate::tvf::horizons::{rediscount_horizons, standard_horizon_sample};
use crate::tvf::{rediscount, HorizonSampler, ValueCurveEstimator};

pub mod horizon;
pub mod stats;

use horizon::{auto_gamma, scheduled_horizon, AutoStrategy, SimulatedAnnealing};
use stats::EpisodeStats;

/// Smallest adaptive horizon, before accounting for the sample counts
const MIN_AUTO_HORIZON: usize = 128;

/// Where the runner is in its collection cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerState {
    /// No environment, or the environment hasn't been reset
    Uninitialized,
    /// Ready to collect a rollout
    Ready,
    /// A rollout is being collected
    Collecting,
}

/// Advantages and scalar returns for one rollout
#[derive(Debug, Clone)]
pub struct BatchReturns {
    /// Value estimates under `gamma`, including the bootstrap row `[N+1, A]`
    pub values: Array2<f32>,

    /// Unscaled advantages `[N, A]`
    pub ext_advantage: Array2<f32>,

    /// Scalar return targets `[N, A]`
    pub ext_returns: Array2<f32>,

    /// Scaled, optionally normalized advantages used for the policy `[N, A]`
    pub advantage: Array2<f32>,

    /// Discount the advantages were computed under
    pub gamma: f32,

    /// Horizon in use for this batch
    pub current_horizon: usize,
}

/// Multi-horizon targets for one rollout
#[derive(Debug, Clone)]
pub struct ReturnSample {
    /// First-moment targets `[N, A, H]`
    pub returns: Array3<f32>,

    /// Square root of the second-moment targets `[N, A, H]`, when second
    /// moments are learned
    pub returns_m2: Option<Array3<f32>>,

    /// Horizon of each target column, shared by every row
    pub horizons: Vec<usize>,
}

/// Drives rollout collection and return estimation
pub struct Runner<M: TvfModel, E: VecEnv> {
    config: TvfConfig,
    model: M,
    env: Option<E>,
    state: RunnerState,
    rng: StdRng,

    buffer: RolloutBuffer,
    obs: Vec<Vec<f32>>,
    time: Array1<f32>,

    stats: EpisodeStats,
    horizon_sa: SimulatedAnnealing,
    previous_rollout: Option<RolloutSnapshot>,

    /// Environment steps summed over agents
    step: usize,
    rollouts: usize,
    /// Rollout count at the last annealing step
    annealed_at: usize,
}

impl<M: TvfModel, E: VecEnv> Runner<M, E> {
    /// Create a runner
    ///
    /// The configuration is validated and the rollout buffer allocated for
    /// `n_steps × agents` with the model's action count.
    pub fn new(config: TvfConfig, model: M) -> Result<Self> {
        config.validate()?;

        let mut rng = StdRng::seed_from_u64(config.seed);
        let horizon_sa = SimulatedAnnealing::new(
            config.sa_initial_value,
            config.sa_mu,
            config.sa_sigma,
            rng.gen(),
        );
        let buffer = RolloutBuffer::new(config.n_steps, config.agents, model.num_actions());

        Ok(Self {
            obs: Vec::new(),
            time: Array1::zeros(config.agents),
            config,
            model,
            env: None,
            state: RunnerState::Uninitialized,
            rng,
            buffer,
            stats: EpisodeStats::new(),
            horizon_sa,
            previous_rollout: None,
            step: 0,
            rollouts: 0,
            annealed_at: 0,
        })
    }

    /// Attach the environment to collect from
    ///
    /// The runner must be [`reset`](Self::reset) before collecting.
    pub fn attach_env(&mut self, env: E) -> Result<()> {
        if env.num_envs() != self.config.agents {
            bail!(
                "environment has {} copies but the runner expects {} agents",
                env.num_envs(),
                self.config.agents
            );
        }
        if env.num_actions() != self.model.num_actions() {
            bail!(
                "environment has {} actions but the model has {}",
                env.num_actions(),
                self.model.num_actions()
            );
        }
        self.env = Some(env);
        self.state = RunnerState::Uninitialized;
        Ok(())
    }

    /// Reset the environment and the episode statistics
    pub fn reset(&mut self) -> Result<()> {
        let Some(env) = self.env.as_mut() else {
            bail!("no environment attached");
        };
        let obs = env.reset()?;
        if obs.len() != self.config.agents {
            bail!("reset returned {} observations for {} agents", obs.len(), self.config.agents);
        }

        self.obs = obs;
        self.time = Array1::zeros(self.config.agents);
        self.stats.reset();
        self.previous_rollout = None;
        self.state = RunnerState::Ready;

        info!(
            "Runner reset: {} agents, {} steps per rollout, horizon {}",
            self.config.agents,
            self.config.n_steps,
            self.current_horizon()
        );
        Ok(())
    }

    /// Collect `n_steps` steps from every agent into the rollout buffer
    pub fn generate_rollout(&mut self) -> Result<()> {
        match self.state {
            RunnerState::Uninitialized => {
                bail!("runner is not initialized, call attach_env and reset first")
            }
            RunnerState::Collecting => bail!("a rollout is already being collected"),
            RunnerState::Ready => {}
        }

        self.state = RunnerState::Collecting;
        match self.collect() {
            Ok(()) => {
                self.state = RunnerState::Ready;
                self.rollouts += 1;
                Ok(())
            }
            Err(e) => {
                self.state = RunnerState::Uninitialized;
                Err(e)
            }
        }
    }

    fn collect(&mut self) -> Result<()> {
        let Some(env) = self.env.as_mut() else {
            bail!("no environment attached");
        };
        let (n_steps, agents) = self.buffer.shape();
        let num_actions = self.buffer.num_actions();
        self.stats.begin_rollout();

        for t in 0..n_steps {
            let log_policy = self.model.log_policy(&self.obs)?;
            if log_policy.dim() != (agents, num_actions) {
                bail!(
                    "model returned log policy with shape {:?}, expected [{}, {}]",
                    log_policy.dim(),
                    agents,
                    num_actions
                );
            }
            let actions = log_policy
                .outer_iter()
                .map(|row| sample_action(row, &mut self.rng))
                .collect::<Result<Vec<_>>>()?;

            let step = env.step(&actions)?;
            if step.observations.len() != agents
                || step.rewards.len() != agents
                || step.dones.len() != agents
                || step.infos.len() != agents
            {
                bail!("environment step returned results for the wrong number of agents");
            }

            let raw_rewards: Array1<f32> = step
                .infos
                .iter()
                .zip(&step.rewards)
                .map(|(info, &reward)| info.raw_reward.unwrap_or(reward))
                .collect();
            let next_time: Array1<f32> = step.infos.iter().map(|info| info.time).collect();
            let rewards = Array1::from(step.rewards);

            for (agent, (info, &done)) in step.infos.iter().zip(&step.dones).enumerate() {
                if info.game_freeze {
                    warn!("Environment {} froze at step {} and was restarted", agent, t);
                }
                if let Some(episode) = self.stats.record(info, done) {
                    debug!(
                        "Episode {} finished: score {:.2}, length {}",
                        self.stats.ep_count(),
                        episode.score,
                        episode.length
                    );
                }
            }

            self.buffer.record_step(
                t,
                &self.obs,
                self.time.view(),
                &actions,
                rewards.view(),
                raw_rewards.view(),
                &step.dones,
                log_policy.view(),
            );
            self.obs = step.observations;
            self.time = next_time;
        }

        self.buffer.record_bootstrap(&self.obs, self.time.view());
        self.step += n_steps * agents;
        Ok(())
    }

    /// Horizon the value curve is trained and queried to
    pub fn current_horizon(&self) -> usize {
        if !self.config.auto_horizon {
            return self.config.tvf_max_horizon;
        }
        let min_horizon = MIN_AUTO_HORIZON
            .max(self.config.tvf_horizon_samples.unwrap_or(0))
            .max(self.config.tvf_value_samples.unwrap_or(0));
        scheduled_horizon(self.auto_horizon(), min_horizon, self.config.tvf_max_horizon)
    }

    /// Unscaled adaptive horizon estimate from the configured strategy
    pub fn auto_horizon(&self) -> f32 {
        match self.config.auto_strategy {
            AutoStrategy::EpisodeLength => self.stats.length_horizon(),
            AutoStrategy::AgentAgeSlow => self.step as f32 / 1000.0,
            AutoStrategy::SaReward | AutoStrategy::SaReturn => self.horizon_sa.neighbour(),
        }
    }

    /// Discount used for advantages
    pub fn gamma(&self) -> f32 {
        if self.config.auto_gamma.drives_gamma() {
            auto_gamma(self.auto_horizon())
        } else {
            self.config.gamma
        }
    }

    /// Discount the value curve is learned under
    pub fn tvf_gamma(&self) -> f32 {
        if self.config.auto_gamma.drives_tvf_gamma() {
            auto_gamma(self.auto_horizon())
        } else {
            self.config.tvf_gamma
        }
    }

    /// Approximate per-agent age in environment steps
    pub fn agent_age(&self) -> usize {
        self.step / self.config.agents
    }

    /// Advantages and scalar returns for the last rollout
    pub fn calculate_returns(&mut self) -> Result<BatchReturns> {
        self.require_rollout()?;

        // one annealing step per collected rollout
        if self.config.auto_strategy.is_annealed() && self.annealed_at < self.rollouts {
            self.anneal_horizon()?;
            self.annealed_at = self.rollouts;
        }

        let (n_steps, _) = self.buffer.shape();
        let gamma = self.gamma();
        let current_horizon = self.current_horizon();
        let values = self.rediscounted_values(&self.buffer, gamma, current_horizon)?;
        let head = values.slice(s![..n_steps, ..]);
        let bootstrap = values.row(n_steps);
        let rewards = self.buffer.rewards();
        let dones = self.buffer.dones();

        let ext_advantage = if self.config.tvf_gae {
            // implied rewards need the whole undiscounted curve
            let curve_horizons: Vec<usize> = (0..=current_horizon).collect();
            let curve = self.estimator(current_horizon).rollout_curve(
                self.buffer.observations(),
                self.buffer.time(),
                &curve_horizons,
            )?;
            calculate_gae_tvf(
                rewards,
                curve.slice(s![..n_steps, .., ..]),
                curve.index_axis(Axis(0), n_steps),
                dones,
                self.tvf_gamma(),
                |k| gamma.powi(k as i32),
                self.config.gae_lambda,
            )
        } else {
            calculate_gae(rewards, head, bootstrap, dones, gamma, self.config.gae_lambda)
        };

        let ext_returns =
            calculate_gae(rewards, head, bootstrap, dones, gamma, self.config.td_lambda) + &head;

        let mut advantage = &ext_advantage * self.config.extrinsic_reward_scale;
        if self.config.normalize_advantages {
            normalize_advantages(&mut advantage);
        }

        info!(
            "Batch {}: gamma {:.4}, horizon {}, return mean {:.3}, advantage std {:.3}, episodes {}",
            self.rollouts,
            gamma,
            current_horizon,
            ext_returns.mean().unwrap_or(0.0),
            ext_advantage.std(0.0),
            self.stats.ep_count()
        );

        Ok(BatchReturns {
            values,
            ext_advantage,
            ext_returns,
            advantage,
            gamma,
            current_horizon,
        })
    }

    /// Multi-horizon targets for the last rollout
    ///
    /// Training horizons are drawn from `tvf_horizon_distribution`; the value
    /// curve is queried at horizons from `tvf_value_distribution`, always
    /// including 0 and the current horizon.
    pub fn generate_return_sample(&mut self, force_first_and_last: bool) -> Result<ReturnSample> {
        self.require_rollout()?;

        let (n_steps, _) = self.buffer.shape();
        let current_horizon = self.current_horizon();

        let horizons = HorizonSampler::new(self.config.tvf_horizon_distribution, n_steps).generate(
            current_horizon,
            self.config.tvf_horizon_samples,
            force_first_and_last,
            &mut self.rng,
        );
        let value_horizons = self.value_sample_horizons(current_horizon);

        let estimate = self.sampled_returns(
            &horizons,
            &value_horizons,
            current_horizon,
            self.config.tvf_return_mode,
            self.config.learn_second_moment,
        )?;

        // the model's second-moment head predicts sqrt(E[G²])
        let returns_m2 = estimate.second.map(|m2| m2.mapv(|x| x.max(0.0).sqrt()));

        Ok(ReturnSample {
            returns: estimate.first,
            returns_m2,
            horizons,
        })
    }

    /// Compare the model's value curve with Monte-Carlo targets at the
    /// standard debug horizons
    pub fn value_quality(&mut self) -> Result<CurveQuality> {
        self.require_rollout()?;

        let (n_steps, _) = self.buffer.shape();
        let current_horizon = self.current_horizon();
        let horizons = standard_horizon_sample(current_horizon);
        let value_horizons = self.value_sample_horizons(current_horizon);

        let targets = self
            .sampled_returns(
                &horizons,
                &value_horizons,
                current_horizon,
                ReturnMode::Fixed { n_step: n_steps },
                false,
            )?
            .first;
        let estimates = self.estimator(current_horizon).rollout_curve(
            self.buffer.prev_observations(),
            self.buffer.prev_time(),
            &horizons,
        )?;

        let quality = CurveQuality::measure(estimates.view(), targets.view(), &horizons);
        for (h, ev) in quality.horizons.iter().zip(&quality.explained_variance) {
            debug!("Value quality at horizon {}: explained variance {:.3}", h, ev);
        }
        Ok(quality)
    }

    /// Value-curve loss of the model against a return sample, under the
    /// configured `tvf_loss_fn`
    ///
    /// The sample must come from the last rollout. Second-moment targets,
    /// when present, are scored against the model's `sqrt_m2` head and
    /// returned separately.
    pub fn value_loss(&self, sample: &ReturnSample) -> Result<(f32, Option<f32>)> {
        self.require_rollout()?;

        let current_horizon = self.current_horizon();
        let estimator = self.estimator(current_horizon);
        let observations = self.buffer.prev_observations();
        let time = self.buffer.prev_time();
        let loss_fn = self.config.tvf_loss_fn;
        let score = |targets: &Array3<f32>, predictions: &Array3<f32>| -> Result<f32> {
            if targets.dim() != predictions.dim() {
                bail!(
                    "return sample has shape {:?} but the rollout gives {:?}",
                    targets.dim(),
                    predictions.dim()
                );
            }
            let loss = loss_fn.loss(
                targets.view(),
                predictions.view(),
                Some(sample.horizons.as_slice()),
                current_horizon,
            );
            Ok(mean_loss(&loss))
        };

        let (value_loss, m2_loss) = match &sample.returns_m2 {
            Some(targets_m2) => {
                let (values, m2) = estimator.rollout_curve_m2(observations, time, &sample.horizons)?;
                let sqrt_m2 = m2.mapv(|x| x.max(0.0).sqrt());
                (score(&sample.returns, &values)?, Some(score(targets_m2, &sqrt_m2)?))
            }
            None => {
                let values = estimator.rollout_curve(observations, time, &sample.horizons)?;
                (score(&sample.returns, &values)?, None)
            }
        };

        debug!("Value loss {:.4} ({:?})", value_loss, loss_fn);
        Ok((value_loss, m2_loss))
    }

    /// Current state of the collection cycle
    pub fn state(&self) -> RunnerState {
        self.state
    }

    /// Runner configuration
    pub fn config(&self) -> &TvfConfig {
        &self.config
    }

    /// The model actions are sampled from
    pub fn model(&self) -> &M {
        &self.model
    }

    /// The last collected rollout
    pub fn buffer(&self) -> &RolloutBuffer {
        &self.buffer
    }

    /// Episode statistics
    pub fn stats(&self) -> &EpisodeStats {
        &self.stats
    }

    /// Horizon search state
    pub fn horizon_sa(&self) -> &SimulatedAnnealing {
        &self.horizon_sa
    }

    /// Environment steps taken, summed over agents
    pub fn total_steps(&self) -> usize {
        self.step
    }

    fn require_rollout(&self) -> Result<()> {
        match self.state {
            RunnerState::Uninitialized => {
                bail!("runner is not initialized, call attach_env and reset first")
            }
            RunnerState::Collecting => bail!("a rollout is still being collected"),
            RunnerState::Ready if self.rollouts == 0 => bail!("no rollout has been collected yet"),
            RunnerState::Ready => Ok(()),
        }
    }

    fn estimator(&self, current_horizon: usize) -> ValueCurveEstimator<'_, M> {
        ValueCurveEstimator::new(&self.model, self.config.max_micro_batch_size, current_horizon)
    }

    fn value_sample_horizons(&mut self, current_horizon: usize) -> Vec<usize> {
        let (n_steps, _) = self.buffer.shape();
        HorizonSampler::new(self.config.tvf_value_distribution, n_steps).generate(
            current_horizon,
            self.config.tvf_value_samples,
            true,
            &mut self.rng,
        )
    }

    fn sampled_returns(
        &self,
        horizons: &[usize],
        value_horizons: &[usize],
        current_horizon: usize,
        mode: ReturnMode,
        second_moment: bool,
    ) -> Result<ReturnEstimate> {
        let estimator = self.estimator(current_horizon);
        let observations = self.buffer.observations();
        let time = self.buffer.time();

        let (values, values_m2) = if second_moment {
            let (values, m2) = estimator.rollout_curve_m2(observations, time, value_horizons)?;
            (values, Some(m2))
        } else {
            (estimator.rollout_curve(observations, time, value_horizons)?, None)
        };

        let request = ReturnRequest {
            mode,
            gamma: self.tvf_gamma(),
            rewards: self.buffer.rewards(),
            dones: self.buffer.dones(),
            required_horizons: horizons,
            value_sample_horizons: value_horizons,
            value_samples: values.view(),
            interpolation: self.config.interpolation,
            second_moment: values_m2.as_ref().map(|m2| SecondMomentRequest {
                mode: self.config.sqr_return_mode.unwrap_or(mode),
                value_samples: m2.view(),
            }),
        };
        Ok(get_return_estimate(&request))
    }

    /// Scalar values `[N+1, A]` of a rollout under `new_gamma`
    fn rediscounted_values(
        &self,
        buffer: &RolloutBuffer,
        new_gamma: f32,
        current_horizon: usize,
    ) -> Result<Array2<f32>> {
        let estimator = self.estimator(current_horizon);
        let tvf_gamma = self.tvf_gamma();

        if (new_gamma - tvf_gamma).abs() < 1e-8 {
            let curve =
                estimator.rollout_curve(buffer.observations(), buffer.time(), &[current_horizon])?;
            return Ok(curve.index_axis_move(Axis(2), 0));
        }

        let horizons = rediscount_horizons(current_horizon, new_gamma);
        let curve = estimator.rollout_curve(buffer.observations(), buffer.time(), &horizons)?;
        let (rows, agents, k) = curve.dim();
        let flat = curve.into_shape((rows * agents, k))?;
        let values = rediscount(flat.view(), tvf_gamma, new_gamma, &horizons);
        Ok(values.into_shape((rows, agents))?)
    }

    fn snapshot(&self) -> RolloutSnapshot {
        RolloutSnapshot {
            buffer: self.buffer.clone(),
            gamma: self.gamma(),
            tvf_gamma: self.tvf_gamma(),
            current_horizon: self.current_horizon(),
        }
    }

    /// Mean GAE return of a rollout under the current discount
    fn discounted_score(&self, snapshot: &RolloutSnapshot) -> Result<f32> {
        let (n_steps, _) = snapshot.buffer.shape();
        let gamma = self.gamma();
        let values = self.rediscounted_values(&snapshot.buffer, gamma, snapshot.current_horizon)?;
        let head = values.slice(s![..n_steps, ..]);
        let advantage = calculate_gae(
            snapshot.buffer.rewards(),
            head,
            values.row(n_steps),
            snapshot.buffer.dones(),
            gamma,
            self.config.gae_lambda,
        );
        Ok((advantage + &head).mean().unwrap_or(0.0))
    }

    fn anneal_horizon(&mut self) -> Result<()> {
        let (score, prev_score) = match self.config.auto_strategy {
            AutoStrategy::SaReward => {
                (self.buffer.rewards().mean().unwrap_or(0.0), self.horizon_sa.prev_score())
            }
            AutoStrategy::SaReturn => {
                let current = self.snapshot();
                let score = self.discounted_score(&current)?;
                let previous = self.previous_rollout.take().unwrap_or_else(|| current.clone());
                let prev_score = self.discounted_score(&previous)?;
                self.previous_rollout = Some(current);
                (score, prev_score)
            }
            AutoStrategy::EpisodeLength | AutoStrategy::AgentAgeSlow => return Ok(()),
        };

        let candidate = self.horizon_sa.neighbour();
        let accepted = self.horizon_sa.process(score, Some(prev_score));
        debug!(
            "Horizon candidate {:.1} {} (score {:.4}, previous {:.4}, acceptance {:.2})",
            candidate,
            if accepted { "accepted" } else { "rejected" },
            score,
            prev_score,
            self.horizon_sa.acceptance_rate()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests;
