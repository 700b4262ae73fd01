//! Fixed-length contextual bandit
//!
//! Each step shows a coin (0 or 1) and pays 1 for naming it. Episodes last
//! exactly `max_steps` steps, so the time fraction is exact and a policy
//! that always names the coin has the closed-form value curve
//! `V(s, h) = min(h, steps left)`.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::{Environment, SpaceInfo, SpaceType, StepInfo, StepResult};

/// Coin-naming bandit with fixed-length episodes
#[derive(Debug)]
pub struct SimpleBandit {
    coin: usize,
    elapsed: usize,
    max_steps: usize,
    rng: StdRng,
}

impl SimpleBandit {
    /// Bandit seeded from entropy, 100-step episodes
    pub fn new() -> Self {
        Self::from_rng(StdRng::from_entropy())
    }

    /// Bandit with a reproducible coin sequence
    pub fn with_seed(seed: u64) -> Self {
        Self::from_rng(StdRng::seed_from_u64(seed))
    }

    fn from_rng(rng: StdRng) -> Self {
        Self { coin: 0, elapsed: 0, max_steps: 100, rng }
    }

    /// Set the episode length, at least one step
    pub fn max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps.max(1);
        self
    }

    fn flip(&mut self) {
        self.coin = self.rng.gen_range(0..2);
    }
}

impl Default for SimpleBandit {
    fn default() -> Self {
        Self::new()
    }
}

impl Environment for SimpleBandit {
    fn reset(&mut self) {
        self.elapsed = 0;
        self.flip();
    }

    fn get_observation(&self) -> Vec<f32> {
        vec![self.coin as f32]
    }

    fn step(&mut self, action: usize) -> StepResult {
        let reward = if action == self.coin { 1.0 } else { 0.0 };
        self.elapsed += 1;
        self.flip();

        StepResult {
            observation: self.get_observation(),
            reward,
            terminated: self.elapsed >= self.max_steps,
            truncated: false,
            info: StepInfo::default(),
        }
    }

    fn time_fraction(&self) -> f32 {
        self.elapsed as f32 / self.max_steps as f32
    }

    fn observation_space(&self) -> SpaceInfo {
        SpaceInfo { shape: vec![1], space_type: SpaceType::Box }
    }

    fn action_space(&self) -> SpaceInfo {
        SpaceInfo { shape: vec![], space_type: SpaceType::Discrete(2) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_naming_the_coin_pays() {
        let mut env = SimpleBandit::with_seed(0);
        env.reset();
        for _ in 0..10 {
            let coin = env.get_observation()[0] as usize;
            assert_eq!(env.step(coin).reward, 1.0);
            let coin = env.get_observation()[0] as usize;
            assert_eq!(env.step(1 - coin).reward, 0.0);
        }
    }

    #[test]
    fn test_time_fraction_tracks_episode() {
        let mut env = SimpleBandit::with_seed(1).max_steps(4);
        env.reset();
        assert_eq!(env.time_fraction(), 0.0);

        let ends: Vec<bool> = (0..4).map(|_| env.step(0).terminated).collect();
        assert_eq!(ends, vec![false, false, false, true]);
        assert_eq!(env.time_fraction(), 1.0);

        env.reset();
        assert_eq!(env.time_fraction(), 0.0);
    }

    #[test]
    fn test_seeded_bandits_match() {
        let mut a = SimpleBandit::with_seed(5).max_steps(20);
        let mut b = SimpleBandit::with_seed(5).max_steps(20);
        a.reset();
        b.reset();
        for _ in 0..20 {
            assert_eq!(a.get_observation(), b.get_observation());
            a.step(0);
            b.step(0);
        }
    }
}
