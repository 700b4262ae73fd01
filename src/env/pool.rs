//! Vectorized environment pool for parallel execution
//!
//! Steps many [`Environment`]s in parallel on Rayon's thread pool and adds
//! the bookkeeping a [`VecEnv`] owes its caller: automatic resets, episode
//! length and score on the terminal step, and the time fraction of the next
//! observation.
//!
//! # Example
//!
//! ```rust
//! use tvf_rl::env::{pool::EnvPool, simple_bandit::SimpleBandit, VecEnv};
//!
//! let mut pool = EnvPool::new(|| SimpleBandit::new(), 4);
//! let observations = pool.reset().unwrap();
//! assert_eq!(observations.len(), 4);
//!
//! let step = pool.step(&[0, 1, 0, 1]).unwrap();
//! assert_eq!(step.rewards.len(), 4);
//! ```

use anyhow::{bail, Result};
use rayon::prelude::*;

use crate::env::{Environment, SpaceInfo, SpaceType, StepInfo, VecEnv, VecStep};

struct Slot<E> {
    env: E,
    score: f32,
    length: usize,
}

impl<E: Environment> Slot<E> {
    fn step(&mut self, action: usize) -> (Vec<f32>, f32, bool, StepInfo) {
        let result = self.env.step(action);
        let mut info = result.info;
        let raw_reward = info.raw_reward.unwrap_or(result.reward);
        info.raw_reward = Some(raw_reward);

        self.score += raw_reward;
        self.length += 1;

        let done = result.terminated || result.truncated;
        if done {
            info.ep_length = Some(self.length);
            info.ep_score = Some(self.score);
            self.length = 0;
        }
        // a fake done (lost life) keeps the episode and its score running
        let observation = if done && !info.fake_done {
            self.score = 0.0;
            self.env.reset();
            self.env.get_observation()
        } else {
            result.observation
        };
        info.time = self.env.time_fraction();

        (observation, result.reward, done, info)
    }
}

/// A pool of environments for parallel execution
pub struct EnvPool<E: Environment> {
    slots: Vec<Slot<E>>,
}

impl<E: Environment + Send> EnvPool<E> {
    /// Create a new environment pool
    ///
    /// # Arguments
    ///
    /// * `env_fn` - Factory function to create environment instances
    /// * `num_envs` - Number of parallel environments
    pub fn new<F>(env_fn: F, num_envs: usize) -> Self
    where
        F: Fn() -> E,
    {
        Self::from_envs((0..num_envs).map(|_| env_fn()).collect())
    }

    /// Create a pool from already constructed environments
    pub fn from_envs(envs: Vec<E>) -> Self {
        let slots = envs.into_iter().map(|env| Slot { env, score: 0.0, length: 0 }).collect();
        Self { slots }
    }

    /// Get observation space information from first environment
    pub fn observation_space(&self) -> Option<SpaceInfo> {
        self.slots.first().map(|slot| slot.env.observation_space())
    }

    /// Get action space information from first environment
    pub fn action_space(&self) -> Option<SpaceInfo> {
        self.slots.first().map(|slot| slot.env.action_space())
    }

    /// Reset a specific environment by index
    ///
    /// Returns the initial observation from the reset environment.
    pub fn reset_env(&mut self, env_id: usize) -> Result<Vec<f32>> {
        let Some(slot) = self.slots.get_mut(env_id) else {
            bail!("environment {} out of range ({} environments)", env_id, self.slots.len());
        };
        slot.env.reset();
        slot.score = 0.0;
        slot.length = 0;
        Ok(slot.env.get_observation())
    }
}

impl<E: Environment + Send> VecEnv for EnvPool<E> {
    fn num_envs(&self) -> usize {
        self.slots.len()
    }

    fn num_actions(&self) -> usize {
        match self.action_space().map(|space| space.space_type) {
            Some(SpaceType::Discrete(n)) => n,
            _ => 0,
        }
    }

    fn reset(&mut self) -> Result<Vec<Vec<f32>>> {
        Ok(self
            .slots
            .par_iter_mut()
            .map(|slot| {
                slot.env.reset();
                slot.score = 0.0;
                slot.length = 0;
                slot.env.get_observation()
            })
            .collect())
    }

    fn step(&mut self, actions: &[usize]) -> Result<VecStep> {
        if actions.len() != self.slots.len() {
            bail!(
                "Number of actions ({}) must match number of environments ({})",
                actions.len(),
                self.slots.len()
            );
        }

        let results: Vec<_> = self
            .slots
            .par_iter_mut()
            .zip(actions.par_iter())
            .map(|(slot, &action)| slot.step(action))
            .collect();

        let num_envs = results.len();
        let mut step = VecStep {
            observations: Vec::with_capacity(num_envs),
            rewards: Vec::with_capacity(num_envs),
            dones: Vec::with_capacity(num_envs),
            infos: Vec::with_capacity(num_envs),
        };
        for (observation, reward, done, info) in results {
            step.observations.push(observation);
            step.rewards.push(reward);
            step.dones.push(done);
            step.infos.push(info);
        }
        Ok(step)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::simple_bandit::SimpleBandit;

    fn seeded_pool(num_envs: usize, max_steps: usize) -> EnvPool<SimpleBandit> {
        EnvPool::from_envs(
            (0..num_envs)
                .map(|i| SimpleBandit::with_seed(i as u64).max_steps(max_steps))
                .collect(),
        )
    }

    #[test]
    fn test_pool_reset() {
        let mut pool = seeded_pool(4, 10);
        let observations = pool.reset().unwrap();

        assert_eq!(observations.len(), 4);
        for obs in observations {
            assert_eq!(obs.len(), 1);
        }
        assert_eq!(pool.num_actions(), 2);
    }

    #[test]
    fn test_pool_step_wrong_action_count() {
        let mut pool = seeded_pool(4, 10);
        pool.reset().unwrap();

        let err = pool.step(&[0, 1]).unwrap_err();
        assert!(err.to_string().contains("must match number of environments"));
    }

    #[test]
    fn test_pool_auto_reset_reports_episode() {
        let mut pool = seeded_pool(3, 5);
        pool.reset().unwrap();

        for t in 0..5 {
            let step = pool.step(&[0, 0, 0]).unwrap();
            for info in &step.infos {
                assert!(info.raw_reward.is_some());
            }
            if t < 4 {
                assert!(step.dones.iter().all(|&d| !d));
                assert!((step.infos[0].time - (t + 1) as f32 / 5.0).abs() < 1e-6);
            } else {
                assert!(step.dones.iter().all(|&d| d));
                for info in &step.infos {
                    assert_eq!(info.ep_length, Some(5));
                    assert!(info.ep_score.is_some());
                    // next observation starts a new episode
                    assert_eq!(info.time, 0.0);
                }
            }
        }
    }

    #[test]
    fn test_pool_large_batch() {
        let mut pool = seeded_pool(16, 100);
        assert_eq!(pool.reset().unwrap().len(), 16);

        let step = pool.step(&[1; 16]).unwrap();
        assert_eq!(step.observations.len(), 16);
        assert!(step.rewards.iter().all(|&r| r == 0.0 || r == 1.0));
    }

    #[test]
    fn test_reset_env_out_of_range() {
        let mut pool = seeded_pool(2, 10);
        assert!(pool.reset_env(1).is_ok());
        assert!(pool.reset_env(2).is_err());
    }
}
