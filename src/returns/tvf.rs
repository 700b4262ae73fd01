//! Multi-horizon return targets
//!
//! Targets for a truncated value curve: `R[t, a, h]` estimates the discounted
//! sum of the next `h` rewards from state t. Horizon h = 0 is always 0.
//! Bootstrapping from state `t+k` at horizon `h` reads `V(t+k, h-k)`, so a
//! target never looks further than `h` steps ahead in total.
//!
//! Value arrays are `[N, A, H]` for the pre-transition states, with the
//! bootstrap state's curve passed separately as `[A, H]`.

use ndarray::{Array3, ArrayView2, ArrayView3};

use super::gae::{check_rollout_shape, mask};

/// Value curves to bootstrap from
#[derive(Clone, Copy)]
struct Curves<'a> {
    /// `None` means every bootstrap reads the final state
    values: Option<ArrayView3<'a, f32>>,
    final_value: ArrayView2<'a, f32>,
}

impl<'a> Curves<'a> {
    fn new<'v: 'a, 'f: 'a>(
        n: usize,
        values: Option<ArrayView3<'v, f32>>,
        final_value: ArrayView2<'f, f32>,
    ) -> Self {
        let values: Option<ArrayView3<'a, f32>> = values.map(|v| v.reborrow());
        let final_value: ArrayView2<'a, f32> = final_value.reborrow();
        let (a, h) = final_value.dim();
        if let Some(values) = values {
            assert_eq!(
                values.dim(),
                (n, a, h),
                "values have shape {:?}, expected {:?}",
                values.dim(),
                (n, a, h)
            );
        }
        Self { values, final_value }
    }

    fn horizons(&self) -> usize {
        self.final_value.ncols()
    }

    #[inline]
    fn at(&self, row: usize, agent: usize, h: usize) -> f32 {
        match self.values {
            Some(values) if row < values.dim().0 => values[[row, agent, h]],
            _ => self.final_value[[agent, h]],
        }
    }
}

/// One-step multi-horizon targets
///
/// # Formula
/// ```text
/// R[t, 0] = 0
/// R[t, h] = r_t + γ * (1 - d_t) * V(t+1, h-1),   V(·, 0) treated as 0
/// ```
pub fn calculate_tvf_td(
    rewards: ArrayView2<f32>,
    dones: ArrayView2<bool>,
    values: ArrayView3<f32>,
    final_value: ArrayView2<f32>,
    gamma: f32,
) -> Array3<f32> {
    let (n, a) = check_rollout_shape(rewards, dones, final_value.nrows());
    let curves = Curves::new(n, Some(values), final_value);
    let h_count = curves.horizons();

    let mut returns = Array3::<f32>::zeros((n, a, h_count));
    for t in 0..n {
        for agent in 0..a {
            let reward = rewards[[t, agent]];
            let discount = gamma * mask(dones[[t, agent]]);
            for h in 1..h_count {
                let bootstrap = if h > 1 { discount * curves.at(t + 1, agent, h - 1) } else { 0.0 };
                returns[[t, agent, h]] = reward + bootstrap;
            }
        }
    }
    returns
}

/// Second-moment targets for [`calculate_tvf_td`]
///
/// `E[(r + D·G')²] ≈ r² + 2·r·D·V' + D²·M2'` with `D = γ(1 - d_t)`.
#[allow(clippy::too_many_arguments)]
pub fn calculate_tvf_td_m2(
    rewards: ArrayView2<f32>,
    dones: ArrayView2<bool>,
    values: ArrayView3<f32>,
    final_value: ArrayView2<f32>,
    values_m2: ArrayView3<f32>,
    final_value_m2: ArrayView2<f32>,
    gamma: f32,
) -> Array3<f32> {
    let (n, a) = check_rollout_shape(rewards, dones, final_value.nrows());
    let curves = Curves::new(n, Some(values), final_value);
    let curves_m2 = Curves::new(n, Some(values_m2), final_value_m2);
    let h_count = curves.horizons();

    let mut returns = Array3::<f32>::zeros((n, a, h_count));
    for t in 0..n {
        for agent in 0..a {
            let reward = rewards[[t, agent]];
            let discount = gamma * mask(dones[[t, agent]]);
            for h in 1..h_count {
                returns[[t, agent, h]] = if h > 1 {
                    let v = curves.at(t + 1, agent, h - 1);
                    let m2 = curves_m2.at(t + 1, agent, h - 1);
                    reward * reward + 2.0 * reward * discount * v + discount * discount * m2
                } else {
                    reward * reward
                };
            }
        }
    }
    returns
}

/// n-step multi-horizon targets
///
/// Real discounted rewards are used for up to `n_step` steps, stopping at
/// the end of the rollout or at horizon `H-1`. The remaining horizons
/// bootstrap from the state where the rewards stopped.
///
/// # Formula
/// ```text
/// k = min(n_step, N - t, H - 1)
/// R[t, h] = S_h                          for h <= k
/// R[t, h] = S_k + D_k * V(t+k, h-k)      for h > k
/// ```
/// where `S_k` is the discounted sum of the first k rewards and `D_k` the
/// discount (zeroed by any done flag) after them.
pub fn calculate_tvf_n_step(
    rewards: ArrayView2<f32>,
    dones: ArrayView2<bool>,
    values: ArrayView3<f32>,
    final_value: ArrayView2<f32>,
    gamma: f32,
    n_step: usize,
) -> Array3<f32> {
    let n = rewards.nrows();
    let curves = Curves::new(n, Some(values), final_value);
    n_step_targets(rewards, dones, curves, None, gamma, |_| n_step).0
}

/// Second-moment targets for [`calculate_tvf_n_step`]
#[allow(clippy::too_many_arguments)]
pub fn calculate_tvf_n_step_m2(
    rewards: ArrayView2<f32>,
    dones: ArrayView2<bool>,
    values: ArrayView3<f32>,
    final_value: ArrayView2<f32>,
    values_m2: ArrayView3<f32>,
    final_value_m2: ArrayView2<f32>,
    gamma: f32,
    n_step: usize,
) -> Array3<f32> {
    let n = rewards.nrows();
    let curves = Curves::new(n, Some(values), final_value);
    let curves_m2 = Curves::new(n, Some(values_m2), final_value_m2);
    second_moment(n_step_targets(rewards, dones, curves, Some(curves_m2), gamma, |_| n_step))
}

/// Monte-Carlo multi-horizon targets
///
/// Real rewards all the way to the end of the rollout, bootstrapping only
/// from the final state. Needs no per-step value estimates.
pub fn calculate_tvf_mc(
    rewards: ArrayView2<f32>,
    dones: ArrayView2<bool>,
    final_value: ArrayView2<f32>,
    gamma: f32,
) -> Array3<f32> {
    let n = rewards.nrows();
    let curves = Curves::new(n, None, final_value);
    n_step_targets(rewards, dones, curves, None, gamma, |_| n).0
}

/// Second-moment targets for [`calculate_tvf_mc`]
pub fn calculate_tvf_mc_m2(
    rewards: ArrayView2<f32>,
    dones: ArrayView2<bool>,
    final_value: ArrayView2<f32>,
    final_value_m2: ArrayView2<f32>,
    gamma: f32,
) -> Array3<f32> {
    let n = rewards.nrows();
    let curves = Curves::new(n, None, final_value);
    let curves_m2 = Curves::new(n, None, final_value_m2);
    second_moment(n_step_targets(rewards, dones, curves, Some(curves_m2), gamma, |_| n))
}

/// TD(λ)-style mixture of n-step targets
///
/// λ = 0 is [`calculate_tvf_td`] and λ = 1 is [`calculate_tvf_mc`]. Otherwise
/// n-step targets for `n = 1..=K`, `K = min(⌊1/(1-λ)⌋, N, 100)`, are mixed with
/// weights `(1-λ)λ^(n-1)`, the K-th target taking the remaining weight.
pub fn calculate_tvf_lambda(
    rewards: ArrayView2<f32>,
    dones: ArrayView2<bool>,
    values: ArrayView3<f32>,
    final_value: ArrayView2<f32>,
    gamma: f32,
    lambda: f32,
) -> Array3<f32> {
    if lambda == 0.0 {
        return calculate_tvf_td(rewards, dones, values, final_value, gamma);
    }
    if lambda == 1.0 {
        return calculate_tvf_mc(rewards, dones, final_value, gamma);
    }

    let n = rewards.nrows();
    let curves = Curves::new(n, Some(values), final_value);
    lambda_mixture(lambda, n, |n_step| {
        n_step_targets(rewards, dones, curves, None, gamma, |_| n_step).0
    })
}

/// Second-moment targets for [`calculate_tvf_lambda`]
///
/// Mixing second moments with the same weights gives the second moment of
/// the mixture.
#[allow(clippy::too_many_arguments)]
pub fn calculate_tvf_lambda_m2(
    rewards: ArrayView2<f32>,
    dones: ArrayView2<bool>,
    values: ArrayView3<f32>,
    final_value: ArrayView2<f32>,
    values_m2: ArrayView3<f32>,
    final_value_m2: ArrayView2<f32>,
    gamma: f32,
    lambda: f32,
) -> Array3<f32> {
    if lambda == 0.0 {
        return calculate_tvf_td_m2(
            rewards,
            dones,
            values,
            final_value,
            values_m2,
            final_value_m2,
            gamma,
        );
    }
    if lambda == 1.0 {
        return calculate_tvf_mc_m2(rewards, dones, final_value, final_value_m2, gamma);
    }

    let n = rewards.nrows();
    let curves = Curves::new(n, Some(values), final_value);
    let curves_m2 = Curves::new(n, Some(values_m2), final_value_m2);
    lambda_mixture(lambda, n, |n_step| {
        second_moment(n_step_targets(rewards, dones, curves, Some(curves_m2), gamma, |_| n_step))
    })
}

/// n-step targets where the step count grows with the horizon
///
/// Horizon h uses `clamp(round(h * ratio), 1, n_step)` real rewards, so short
/// horizons lean on bootstrapping less than they would under a fixed n.
pub fn calculate_tvf_adaptive(
    rewards: ArrayView2<f32>,
    dones: ArrayView2<bool>,
    values: ArrayView3<f32>,
    final_value: ArrayView2<f32>,
    gamma: f32,
    n_step: usize,
    ratio: f32,
) -> Array3<f32> {
    let n = rewards.nrows();
    let curves = Curves::new(n, Some(values), final_value);
    n_step_targets(rewards, dones, curves, None, gamma, adaptive_n(n_step, ratio)).0
}

/// Second-moment targets for [`calculate_tvf_adaptive`]
#[allow(clippy::too_many_arguments)]
pub fn calculate_tvf_adaptive_m2(
    rewards: ArrayView2<f32>,
    dones: ArrayView2<bool>,
    values: ArrayView3<f32>,
    final_value: ArrayView2<f32>,
    values_m2: ArrayView3<f32>,
    final_value_m2: ArrayView2<f32>,
    gamma: f32,
    n_step: usize,
    ratio: f32,
) -> Array3<f32> {
    let n = rewards.nrows();
    let curves = Curves::new(n, Some(values), final_value);
    let curves_m2 = Curves::new(n, Some(values_m2), final_value_m2);
    second_moment(n_step_targets(
        rewards,
        dones,
        curves,
        Some(curves_m2),
        gamma,
        adaptive_n(n_step, ratio),
    ))
}

fn adaptive_n(n_step: usize, ratio: f32) -> impl Fn(usize) -> usize {
    let n_step = n_step.max(1);
    move |h| ((h as f32 * ratio).round() as usize).clamp(1, n_step)
}

/// Number of n-step targets mixed for a given λ and rollout length
pub(crate) fn lambda_terms(lambda: f32, n: usize) -> usize {
    let effective = (1.0 / (1.0 - lambda)).floor() as usize;
    effective.min(n).min(100).max(1)
}

fn lambda_mixture<F: FnMut(usize) -> Array3<f32>>(lambda: f32, n: usize, mut n_step: F) -> Array3<f32> {
    let k = lambda_terms(lambda, n);
    let weights = super::gae::g_weights(k, lambda);

    let mut result: Option<Array3<f32>> = None;
    for (i, &weight) in weights.iter().enumerate() {
        let target = n_step(i + 1);
        match result.as_mut() {
            Some(acc) => acc.scaled_add(weight, &target),
            None => result = Some(target * weight),
        }
    }
    // k >= 1 so at least one target was produced
    result.unwrap_or_else(|| Array3::zeros((0, 0, 0)))
}

fn second_moment(targets: (Array3<f32>, Option<Array3<f32>>)) -> Array3<f32> {
    let (first, second) = targets;
    second.unwrap_or_else(|| Array3::zeros(first.dim()))
}

/// Shared n-step kernel; `n_for_h` gives the step budget at each horizon
///
/// Returns first-moment targets, and second-moment targets when `curves_m2`
/// is given.
fn n_step_targets<F: Fn(usize) -> usize>(
    rewards: ArrayView2<f32>,
    dones: ArrayView2<bool>,
    curves: Curves,
    curves_m2: Option<Curves>,
    gamma: f32,
    n_for_h: F,
) -> (Array3<f32>, Option<Array3<f32>>) {
    let (n, a) = check_rollout_shape(rewards, dones, curves.final_value.nrows());
    let h_count = curves.horizons();
    if let Some(m2) = curves_m2 {
        assert_eq!(m2.horizons(), h_count, "second-moment curve horizons mismatch");
    }

    let mut returns = Array3::<f32>::zeros((n, a, h_count));
    let mut returns_m2 = curves_m2.map(|_| Array3::<f32>::zeros((n, a, h_count)));
    if h_count == 0 {
        return (returns, returns_m2);
    }

    let max_n = (1..h_count).map(&n_for_h).max().unwrap_or(0);
    let steps_for_h: Vec<usize> = (0..h_count).map(&n_for_h).collect();

    // prefix sums of discounted rewards, and the discount after k steps
    let mut reward_sum = vec![0.0_f32; max_n + 1];
    let mut discount = vec![1.0_f32; max_n + 1];

    for t in 0..n {
        let k_max = max_n.min(n - t).min(h_count - 1);
        for agent in 0..a {
            for k in 1..=k_max {
                let step = t + k - 1;
                reward_sum[k] = reward_sum[k - 1] + discount[k - 1] * rewards[[step, agent]];
                discount[k] = discount[k - 1] * gamma * mask(dones[[step, agent]]);
            }

            for h in 1..h_count {
                let k = steps_for_h[h].min(n - t).min(h_count - 1);
                if h <= k {
                    returns[[t, agent, h]] = reward_sum[h];
                    if let Some(m2) = returns_m2.as_mut() {
                        m2[[t, agent, h]] = reward_sum[h] * reward_sum[h];
                    }
                } else {
                    let s = reward_sum[k];
                    let d = discount[k];
                    let v = curves.at(t + k, agent, h - k);
                    returns[[t, agent, h]] = s + d * v;
                    if let (Some(m2), Some(curves_m2)) = (returns_m2.as_mut(), curves_m2) {
                        let second = curves_m2.at(t + k, agent, h - k);
                        m2[[t, agent, h]] = s * s + 2.0 * s * d * v + d * d * second;
                    }
                }
            }
        }
    }

    (returns, returns_m2)
}
