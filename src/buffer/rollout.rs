//! Rollout buffer for one batch of experience
//!
//! # Buffer Layout
//!
//! Per-step arrays use a `[n_steps, agents]` layout. Observations and time
//! have one extra row: row `n_steps` holds the state after the last action,
//! which the estimators bootstrap from.
//!
//! The buffer is allocated once per run and overwritten in place every
//! batch; estimators only ever read from it.

use ndarray::{s, Array2, Array3, ArrayView1, ArrayView2, ArrayView3};

/// Rollout storage for N steps of A agents
///
/// # Example
///
/// ```rust
/// use ndarray::array;
/// use tvf_rl::buffer::rollout::RolloutBuffer;
///
/// let mut buffer = RolloutBuffer::new(2, 1, 2);
/// buffer.record_step(
///     0,
///     &[vec![0.0]],              // observation before acting
///     array![0.0].view(),        // time
///     &[1],                      // action
///     array![1.0].view(),        // reward
///     array![1.0].view(),        // raw reward
///     &[false],                  // done
///     array![[-0.7, -0.7]].view(), // log policy
/// );
/// assert_eq!(buffer.rewards()[[0, 0]], 1.0);
/// ```
#[derive(Debug, Clone)]
pub struct RolloutBuffer {
    n_steps: usize,
    agents: usize,
    num_actions: usize,

    /// Observations: [n_steps + 1][agents]
    observations: Vec<Vec<Vec<f32>>>,

    /// Normalized episode time: [n_steps + 1, agents]
    time: Array2<f32>,

    /// Rewards used for training: [n_steps, agents]
    rewards: Array2<f32>,

    /// Rewards as reported before clipping: [n_steps, agents]
    raw_rewards: Array2<f32>,

    /// Transition at t ended an episode: [n_steps, agents]
    dones: Array2<bool>,

    /// Sampled actions: [n_steps, agents]
    actions: Array2<usize>,

    /// Log-probabilities of the behaviour policy: [n_steps, agents, num_actions]
    log_policy: Array3<f32>,
}

impl RolloutBuffer {
    /// Create a new rollout buffer
    ///
    /// # Arguments
    ///
    /// * `n_steps` - Number of timesteps per rollout
    /// * `agents` - Number of parallel agents
    /// * `num_actions` - Size of the discrete action space
    pub fn new(n_steps: usize, agents: usize, num_actions: usize) -> Self {
        Self {
            n_steps,
            agents,
            num_actions,
            observations: vec![vec![Vec::new(); agents]; n_steps + 1],
            time: Array2::zeros((n_steps + 1, agents)),
            rewards: Array2::zeros((n_steps, agents)),
            raw_rewards: Array2::zeros((n_steps, agents)),
            dones: Array2::from_elem((n_steps, agents), false),
            actions: Array2::zeros((n_steps, agents)),
            log_policy: Array3::zeros((n_steps, agents, num_actions)),
        }
    }

    /// `(n_steps, agents)`
    pub fn shape(&self) -> (usize, usize) {
        (self.n_steps, self.agents)
    }

    /// Size of the discrete action space
    pub fn num_actions(&self) -> usize {
        self.num_actions
    }

    /// Record everything observed at step `t`
    ///
    /// `observations` and `time` describe the state the agents acted in;
    /// the remaining arguments describe the transition out of it.
    #[allow(clippy::too_many_arguments)]
    pub fn record_step(
        &mut self,
        t: usize,
        observations: &[Vec<f32>],
        time: ArrayView1<f32>,
        actions: &[usize],
        rewards: ArrayView1<f32>,
        raw_rewards: ArrayView1<f32>,
        dones: &[bool],
        log_policy: ArrayView2<f32>,
    ) {
        assert!(t < self.n_steps, "step {} out of bounds for {} steps", t, self.n_steps);
        assert_eq!(observations.len(), self.agents, "observation count mismatch");
        assert_eq!(actions.len(), self.agents, "action count mismatch");
        assert_eq!(dones.len(), self.agents, "done count mismatch");
        assert_eq!(
            log_policy.dim(),
            (self.agents, self.num_actions),
            "log policy has shape {:?}, expected [{}, {}]",
            log_policy.dim(),
            self.agents,
            self.num_actions
        );

        self.observations[t] = observations.to_vec();
        self.time.row_mut(t).assign(&time);
        self.rewards.row_mut(t).assign(&rewards);
        self.raw_rewards.row_mut(t).assign(&raw_rewards);
        for agent in 0..self.agents {
            self.actions[[t, agent]] = actions[agent];
            self.dones[[t, agent]] = dones[agent];
        }
        self.log_policy.slice_mut(s![t, .., ..]).assign(&log_policy);
    }

    /// Record the state after the final step
    pub fn record_bootstrap(&mut self, observations: &[Vec<f32>], time: ArrayView1<f32>) {
        assert_eq!(observations.len(), self.agents, "observation count mismatch");
        self.observations[self.n_steps] = observations.to_vec();
        self.time.row_mut(self.n_steps).assign(&time);
    }

    /// All observations including the bootstrap state `[n_steps + 1][agents]`
    pub fn observations(&self) -> &[Vec<Vec<f32>>] {
        &self.observations
    }

    /// Observations the agents acted in `[n_steps][agents]`
    pub fn prev_observations(&self) -> &[Vec<Vec<f32>>] {
        &self.observations[..self.n_steps]
    }

    /// Time including the bootstrap state `[n_steps + 1, agents]`
    pub fn time(&self) -> ArrayView2<f32> {
        self.time.view()
    }

    /// Time of the states the agents acted in `[n_steps, agents]`
    pub fn prev_time(&self) -> ArrayView2<f32> {
        self.time.slice(s![..self.n_steps, ..])
    }

    /// Rewards `[n_steps, agents]`
    pub fn rewards(&self) -> ArrayView2<f32> {
        self.rewards.view()
    }

    /// Raw rewards `[n_steps, agents]`
    pub fn raw_rewards(&self) -> ArrayView2<f32> {
        self.raw_rewards.view()
    }

    /// Terminal flags `[n_steps, agents]`
    pub fn dones(&self) -> ArrayView2<bool> {
        self.dones.view()
    }

    /// Actions `[n_steps, agents]`
    pub fn actions(&self) -> ArrayView2<usize> {
        self.actions.view()
    }

    /// Log-policy `[n_steps, agents, num_actions]`
    pub fn log_policy(&self) -> ArrayView3<f32> {
        self.log_policy.view()
    }
}

/// A previous rollout together with the discounts and horizon it was
/// collected under
#[derive(Debug, Clone)]
pub struct RolloutSnapshot {
    /// The rollout itself
    pub buffer: RolloutBuffer,

    /// Advantage discount at collection time
    pub gamma: f32,

    /// Value-curve discount at collection time
    pub tvf_gamma: f32,

    /// Horizon in use at collection time
    pub current_horizon: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn filled_buffer() -> RolloutBuffer {
        let mut buffer = RolloutBuffer::new(2, 2, 3);
        for t in 0..2 {
            let obs = vec![vec![t as f32], vec![t as f32 + 0.5]];
            buffer.record_step(
                t,
                &obs,
                array![0.1 * t as f32, 0.2].view(),
                &[t, 2],
                array![1.0, -1.0].view(),
                array![10.0, -1.0].view(),
                &[t == 1, false],
                Array2::from_elem((2, 3), -(3.0_f32).ln()).view(),
            );
        }
        buffer.record_bootstrap(&[vec![9.0], vec![9.5]], array![0.3, 0.4].view());
        buffer
    }

    #[test]
    fn test_buffer_shapes() {
        let buffer = filled_buffer();
        assert_eq!(buffer.shape(), (2, 2));
        assert_eq!(buffer.observations().len(), 3);
        assert_eq!(buffer.prev_observations().len(), 2);
        assert_eq!(buffer.time().dim(), (3, 2));
        assert_eq!(buffer.prev_time().dim(), (2, 2));
        assert_eq!(buffer.log_policy().dim(), (2, 2, 3));
    }

    #[test]
    fn test_buffer_contents() {
        let buffer = filled_buffer();
        assert_eq!(buffer.observations()[2][1], vec![9.5]);
        assert_eq!(buffer.time()[[2, 0]], 0.3);
        assert_eq!(buffer.raw_rewards()[[1, 0]], 10.0);
        assert!(buffer.dones()[[1, 0]]);
        assert!(!buffer.dones()[[0, 0]]);
        assert_eq!(buffer.actions()[[1, 0]], 1);
    }

    #[test]
    #[should_panic(expected = "out of bounds")]
    fn test_step_out_of_bounds() {
        let mut buffer = RolloutBuffer::new(1, 1, 2);
        buffer.record_step(
            1,
            &[vec![0.0]],
            array![0.0].view(),
            &[0],
            array![0.0].view(),
            array![0.0].view(),
            &[false],
            Array2::zeros((1, 2)).view(),
        );
    }
}
