//! Adaptive horizon and discount selection
//!
//! The runner can grow or shrink the horizon it trains on while learning.
//! [`AutoStrategy`] picks the signal the horizon follows and [`AutoGamma`]
//! decides which discounts are derived from it. The `Sa*` strategies search
//! for a horizon with [`SimulatedAnnealing`].

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

/// Signal the adaptive horizon follows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutoStrategy {
    /// Mean plus two standard deviations of recent episode lengths
    #[default]
    EpisodeLength,
    /// One thousandth of the per-agent step count
    AgentAgeSlow,
    /// Annealed, scored by mean reward
    SaReward,
    /// Annealed, scored by mean discounted return
    SaReturn,
}

impl AutoStrategy {
    /// Whether this strategy is driven by simulated annealing
    pub fn is_annealed(self) -> bool {
        matches!(self, AutoStrategy::SaReward | AutoStrategy::SaReturn)
    }
}

/// Which discounts follow the adaptive horizon
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutoGamma {
    /// Both discounts come from the configuration
    #[default]
    Off,
    /// Advantage discount only
    Gamma,
    /// Value-curve discount only
    Tvf,
    /// Both discounts
    Both,
}

impl AutoGamma {
    /// Whether the advantage discount is derived
    pub fn drives_gamma(self) -> bool {
        matches!(self, AutoGamma::Gamma | AutoGamma::Both)
    }

    /// Whether the value-curve discount is derived
    pub fn drives_tvf_gamma(self) -> bool {
        matches!(self, AutoGamma::Tvf | AutoGamma::Both)
    }
}

/// Discount whose effective horizon matches `auto_horizon`, never shorter
/// than 10 steps
pub fn auto_gamma(auto_horizon: f32) -> f32 {
    let horizon = auto_horizon.max(10.0);
    1.0 - 1.0 / horizon
}

/// Training horizon for an adaptive estimate
///
/// Three times the estimate, clipped to `[min_horizon, max_horizon]`. When
/// the bounds cross, `max_horizon` wins.
pub fn scheduled_horizon(auto_horizon: f32, min_horizon: usize, max_horizon: usize) -> usize {
    let horizon = (auto_horizon * 3.0).max(min_horizon as f32).min(max_horizon as f32);
    horizon as usize
}

/// Random-walk search over a positive scalar
///
/// Candidates are proposed by a normal step in log2 space, so repeated
/// proposals have no drift when `mu` is 0. A candidate is accepted when it
/// scores better than the previous accepted value, and otherwise with 5%
/// probability.
///
/// # Example
///
/// ```rust
/// use tvf_rl::runner::horizon::SimulatedAnnealing;
///
/// let mut sa = SimulatedAnnealing::new(1000.0, 0.0, 0.05, 0);
/// for _ in 0..100 {
///     let score = -(sa.neighbour() - 300.0).abs();
///     sa.process(score, None);
/// }
/// assert!(sa.acceptance_rate() > 0.0);
/// ```
#[derive(Debug, Clone)]
pub struct SimulatedAnnealing {
    value: f32,
    neighbour: f32,
    prev_score: f32,
    accepts: usize,
    rejects: usize,
    mu: f32,
    sigma: f32,
    rng: StdRng,
}

impl SimulatedAnnealing {
    /// Acceptance probability for candidates that don't improve the score
    pub const RANDOM_ACCEPT: f32 = 0.05;

    /// Start a search at `initial_value`
    ///
    /// # Arguments
    ///
    /// * `initial_value` - Starting point, must be positive
    /// * `mu` - Mean of the log2 step
    /// * `sigma` - Standard deviation of the log2 step
    /// * `seed` - Seed for proposals and random acceptance
    pub fn new(initial_value: f32, mu: f32, sigma: f32, seed: u64) -> Self {
        assert!(initial_value > 0.0, "annealed value must be positive, got {}", initial_value);
        let mut sa = Self {
            value: initial_value,
            neighbour: initial_value,
            prev_score: f32::NEG_INFINITY,
            accepts: 0,
            rejects: 0,
            mu,
            sigma,
            rng: StdRng::seed_from_u64(seed),
        };
        sa.generate_neighbour();
        sa
    }

    /// Last accepted value
    pub fn value(&self) -> f32 {
        self.value
    }

    /// Candidate currently being evaluated
    pub fn neighbour(&self) -> f32 {
        self.neighbour
    }

    /// Score of the last accepted candidate
    pub fn prev_score(&self) -> f32 {
        self.prev_score
    }

    /// Fraction of candidates accepted so far, 0 before the first one
    pub fn acceptance_rate(&self) -> f32 {
        let iterations = self.accepts + self.rejects;
        if iterations > 0 {
            self.accepts as f32 / iterations as f32
        } else {
            0.0
        }
    }

    /// Score the current candidate and propose the next one
    ///
    /// `prev_score` overrides the stored score of the last accepted value.
    /// Returns whether the candidate was accepted.
    pub fn process(&mut self, score: f32, prev_score: Option<f32>) -> bool {
        let prev_score = prev_score.unwrap_or(self.prev_score);
        let accepted = score > prev_score || self.rng.gen::<f32>() < Self::RANDOM_ACCEPT;
        if accepted {
            self.value = self.neighbour;
            self.prev_score = score;
            self.accepts += 1;
        } else {
            self.rejects += 1;
        }
        self.generate_neighbour();
        accepted
    }

    fn generate_neighbour(&mut self) {
        let theta = self.value.log2();
        let step = self.mu + self.sigma * self.standard_normal();
        self.neighbour = (theta + step).exp2();
    }

    /// Box-Muller transform: two uniform samples to one standard normal sample
    fn standard_normal(&mut self) -> f32 {
        let u1: f32 = self.rng.gen::<f32>().max(1e-10);
        let u2: f32 = self.rng.gen();
        (-2.0 * u1.ln()).sqrt() * (2.0 * std::f32::consts::PI * u2).cos()
    }
}
