//! Environment traits and implementations
//!
//! [`Environment`] is a single episodic environment with discrete actions.
//! The runner talks to a [`VecEnv`]: a batch of environments stepped
//! together that reset finished episodes on their own and report episode
//! bookkeeping through [`StepInfo`]. [`pool::EnvPool`] provides one over any
//! `Environment`.

use anyhow::Result;

pub mod pool;
pub mod simple_bandit;

/// Core trait for RL environments
pub trait Environment {
    /// Start a new episode
    fn reset(&mut self);

    /// Current observation
    fn get_observation(&self) -> Vec<f32>;

    /// Step the environment with a discrete action
    fn step(&mut self, action: usize) -> StepResult;

    /// Fraction of the episode time limit used so far, in `[0, 1]`
    fn time_fraction(&self) -> f32 {
        0.0
    }

    /// Get the observation space dimensions
    fn observation_space(&self) -> SpaceInfo;

    /// Get the action space dimensions
    fn action_space(&self) -> SpaceInfo;
}

/// Result of an environment step
#[derive(Debug, Clone)]
pub struct StepResult {
    /// Next observation
    pub observation: Vec<f32>,

    /// Reward received
    pub reward: f32,

    /// Whether the episode terminated
    pub terminated: bool,

    /// Whether the episode was truncated
    pub truncated: bool,

    /// Additional info
    pub info: StepInfo,
}

/// Space information for observations and actions
#[derive(Debug, Clone)]
pub struct SpaceInfo {
    /// Shape of the space
    pub shape: Vec<usize>,

    /// Data type
    pub space_type: SpaceType,
}

/// Space data types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpaceType {
    /// Discrete space with n options
    Discrete(usize),

    /// Continuous space
    Box,
}

/// Per-step side information reported by an environment
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepInfo {
    /// Normalized episode time of the next observation
    pub time: f32,

    /// Reward before any clipping or scaling, if it differs from the reward
    pub raw_reward: Option<f32>,

    /// Length of the episode that just ended
    pub ep_length: Option<usize>,

    /// Raw score of the episode that just ended
    pub ep_score: Option<f32>,

    /// Terminal that doesn't end the episode, e.g. a lost life
    pub fake_done: bool,

    /// Number of reward clips this step
    pub reward_clips: usize,

    /// The environment stopped responding and was restarted
    pub game_freeze: bool,

    /// The environment repeated the previous action instead of this one
    pub repeated_action: bool,
}

/// A batch of environments stepped in lockstep
///
/// Finished episodes reset automatically: the observation returned for a
/// done environment is the first observation of its next episode.
pub trait VecEnv {
    /// Number of environments
    fn num_envs(&self) -> usize;

    /// Number of discrete actions
    fn num_actions(&self) -> usize;

    /// Reset every environment and return the initial observations
    fn reset(&mut self) -> Result<Vec<Vec<f32>>>;

    /// Step every environment with one action each
    fn step(&mut self, actions: &[usize]) -> Result<VecStep>;
}

/// Result of stepping a [`VecEnv`]
#[derive(Debug, Clone)]
pub struct VecStep {
    /// Observation for each environment
    pub observations: Vec<Vec<f32>>,

    /// Reward for each environment
    pub rewards: Vec<f32>,

    /// Episode ended (terminated or truncated) for each environment
    pub dones: Vec<bool>,

    /// Side information for each environment
    pub infos: Vec<StepInfo>,
}
