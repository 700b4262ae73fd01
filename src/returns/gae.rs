//! Scalar return and advantage estimators
//!
//! Everything here works on `[N, A]` rollouts: N steps for each of A agents,
//! with `dones[t, a]` marking that the transition at step t ended an episode.
//! All recursions run backwards over time and never carry a discounted
//! continuation across a done flag.

use ndarray::{Array1, Array2, ArrayView1, ArrayView2, ArrayView3};

pub(crate) fn check_rollout_shape(
    rewards: ArrayView2<f32>,
    dones: ArrayView2<bool>,
    final_len: usize,
) -> (usize, usize) {
    let (n, a) = rewards.dim();
    assert_eq!(
        dones.dim(),
        (n, a),
        "dones have shape {:?} but rewards have shape {:?}",
        dones.dim(),
        (n, a)
    );
    assert_eq!(final_len, a, "final estimate has {} agents, expected {}", final_len, a);
    (n, a)
}

#[inline]
pub(crate) fn mask(done: bool) -> f32 {
    if done {
        0.0
    } else {
        1.0
    }
}

/// Discounted returns bootstrapped from a final value estimate
///
/// # Formula
/// ```text
/// G_N = V_final
/// G_t = r_t + γ * (1 - d_t) * G_{t+1}
/// ```
pub fn calculate_bootstrapped_returns(
    rewards: ArrayView2<f32>,
    dones: ArrayView2<bool>,
    final_value: ArrayView1<f32>,
    gamma: f32,
) -> Array2<f32> {
    let (n, a) = check_rollout_shape(rewards, dones, final_value.len());

    let mut returns = Array2::<f32>::zeros((n, a));
    let mut current_return = final_value.to_owned();

    for t in (0..n).rev() {
        for agent in 0..a {
            current_return[agent] =
                rewards[[t, agent]] + gamma * mask(dones[[t, agent]]) * current_return[agent];
            returns[[t, agent]] = current_return[agent];
        }
    }
    returns
}

/// Generalized Advantage Estimation
///
/// # Arguments
/// * `rewards` - Rewards `[N, A]`
/// * `values` - Value estimates of the pre-transition states `[N, A]`
/// * `final_value` - Value estimate of the state after the last step `[A]`
/// * `dones` - Terminal flags `[N, A]`
/// * `gamma` - Discount factor
/// * `lambda` - GAE lambda, 0 gives the TD residual and 1 the Monte-Carlo
///   advantage
///
/// # Formula
/// ```text
/// δ_t = r_t + γ * (1 - d_t) * V_{t+1} - V_t
/// A_t = δ_t + γ * λ * (1 - d_t) * A_{t+1}
/// ```
pub fn calculate_gae(
    rewards: ArrayView2<f32>,
    values: ArrayView2<f32>,
    final_value: ArrayView1<f32>,
    dones: ArrayView2<bool>,
    gamma: f32,
    lambda: f32,
) -> Array2<f32> {
    let (n, a) = check_rollout_shape(rewards, dones, final_value.len());
    assert_eq!(
        values.dim(),
        (n, a),
        "values have shape {:?}, expected {:?}",
        values.dim(),
        (n, a)
    );

    let mut advantages = Array2::<f32>::zeros((n, a));
    let mut prev_adv = Array1::<f32>::zeros(a);

    for t in (0..n).rev() {
        for agent in 0..a {
            let not_done = mask(dones[[t, agent]]);
            let next_value = if t + 1 == n { final_value[agent] } else { values[[t + 1, agent]] };
            let delta = rewards[[t, agent]] + gamma * next_value * not_done - values[[t, agent]];
            prev_adv[agent] = delta + gamma * lambda * not_done * prev_adv[agent];
            advantages[[t, agent]] = prev_adv[agent];
        }
    }
    advantages
}

/// Normalize advantages to zero mean and unit variance in place
pub fn normalize_advantages(advantages: &mut Array2<f32>) {
    let count = advantages.len();
    if count == 0 {
        return;
    }
    let mean = advantages.sum() / count as f32;
    let variance = advantages.iter().map(|x| (x - mean).powi(2)).sum::<f32>() / count as f32;
    let std = variance.sqrt();
    advantages.mapv_inplace(|x| (x - mean) / (std + 1e-8));
}

/// Discounted time-until-terminal targets
///
/// # Formula
/// ```text
/// T_N = final
/// T_t = 1 + γ * (1 - d_t) * T_{t+1}
/// ```
pub fn calculate_tp_returns(
    dones: ArrayView2<bool>,
    final_tp_estimate: ArrayView1<f32>,
    gamma: f32,
) -> Array2<f32> {
    let ones = Array2::<f32>::ones(dones.dim());
    calculate_bootstrapped_returns(ones.view(), dones, final_tp_estimate, gamma)
}

/// GAE over a truncated value curve, for arbitrary discount functions
///
/// Rewards past the real ones are read off the curve at the pivot state
/// `p = min(t + n, N)` as finite differences, `r̂_k = V(p, k+1) - V(p, k)`.
/// The n-step estimate uses real rewards up to the pivot and implied rewards
/// after it, each weighted by `discount_fn(i)` for the i-th step ahead. The
/// n-step estimates are mixed with weights `(1-λ)λ^(n-1)`, the last one
/// taking all remaining weight, and the advantage is the mixture minus
/// `V(t, H-1)`.
///
/// # Arguments
/// * `rewards` - Rewards `[N, A]`
/// * `values` - Dense value curve at horizons `0..H` for each state `[N, A, H]`
/// * `final_value` - Dense value curve of the bootstrap state `[A, H]`
/// * `dones` - Terminal flags `[N, A]`
/// * `tvf_gamma` - Discount the curve was learned under, must be 1
/// * `discount_fn` - Weight for a reward `i` steps in the future
/// * `lambda` - Mixing parameter
///
/// # Panics
///
/// Panics if `tvf_gamma != 1`; finite differences of a discounted curve are
/// not undiscounted rewards.
#[allow(clippy::too_many_arguments)]
pub fn calculate_gae_tvf<F: Fn(usize) -> f32>(
    rewards: ArrayView2<f32>,
    values: ArrayView3<f32>,
    final_value: ArrayView2<f32>,
    dones: ArrayView2<bool>,
    tvf_gamma: f32,
    discount_fn: F,
    lambda: f32,
) -> Array2<f32> {
    assert!(
        tvf_gamma == 1.0,
        "general discount functions require an undiscounted value curve (tvf_gamma = {})",
        tvf_gamma
    );
    let (n, a) = check_rollout_shape(rewards, dones, final_value.nrows());
    let h = values.dim().2;
    assert_eq!(
        values.dim(),
        (n, a, h),
        "values have shape {:?}, expected [{}, {}, H]",
        values.dim(),
        n,
        a
    );
    assert_eq!(final_value.ncols(), h, "final curve has {} horizons, values have {}", final_value.ncols(), h);

    let mut advantages = Array2::<f32>::zeros((n, a));
    if h == 0 {
        return advantages;
    }

    let discounts: Vec<f32> = (0..h).map(&discount_fn).collect();
    let curve = |row: usize, agent: usize, k: usize| -> f32 {
        if row == n {
            final_value[[agent, k]]
        } else {
            values[[row, agent, k]]
        }
    };
    let implied_reward = |pivot: usize, agent: usize, k: usize| -> f32 {
        curve(pivot, agent, k + 1) - curve(pivot, agent, k)
    };

    for t in 0..n {
        let max_n = n - t;
        let weights = g_weights(max_n, lambda);

        for (idx, &weight) in weights.iter().enumerate() {
            if weight <= 1e-6 {
                continue;
            }
            let pivot = (t + idx + 1).min(n);

            for agent in 0..a {
                let mut sum_of_rewards = 0.0_f32;
                let mut discount = 1.0_f32;
                for i in 0..h - 1 {
                    let reward = if t + i < pivot {
                        let r = rewards[[t + i, agent]] * discount;
                        discount *= mask(dones[[t + i, agent]]);
                        r
                    } else {
                        implied_reward(pivot, agent, t + i - pivot) * discount
                    };
                    sum_of_rewards += reward * discounts[i];
                }
                advantages[[t, agent]] += weight * sum_of_rewards;
            }
        }

        for agent in 0..a {
            advantages[[t, agent]] -= values[[t, agent, h - 1]];
        }
    }
    advantages
}

/// `(1-λ)λ^(n-1)` for n in `1..max_n`, then `λ^(max_n-1)` for the last
/// estimate so that the weights sum to one
pub(crate) fn g_weights(max_n: usize, lambda: f32) -> Vec<f32> {
    if max_n == 0 {
        return Vec::new();
    }
    let mut weights = Vec::with_capacity(max_n);
    let mut weight = 1.0 - lambda;
    for _ in 0..max_n - 1 {
        weights.push(weight);
        weight *= lambda;
    }
    weights.push(lambda.powi(max_n as i32 - 1));
    weights
}
