//! Return targets from a sparse value-curve sample
//!
//! The model is only queried at K sampled horizons. The sample is
//! interpolated to a dense curve, the dense estimator runs, and the targets
//! at the required horizons are gathered from its output.

use ndarray::{s, Array3, ArrayView2, ArrayView3, Axis};
use serde::{Deserialize, Serialize};

use super::{tvf, ReturnMode};

/// How a sparse value curve is filled in between samples
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Interpolation {
    /// Linear in the horizon
    #[default]
    Linear,
    /// Linear in `log(1 + h)`
    Log,
}

impl Interpolation {
    fn coordinate(self, h: usize) -> f32 {
        match self {
            Interpolation::Linear => h as f32,
            Interpolation::Log => (h as f32).ln_1p(),
        }
    }
}

/// Second-moment part of a [`ReturnRequest`]
#[derive(Clone, Copy)]
pub struct SecondMomentRequest<'a> {
    /// Estimator used for the second moment
    pub mode: ReturnMode,
    /// Second moment at each sampled horizon `[N+1, A, K]`
    pub value_samples: ArrayView3<'a, f32>,
}

/// Everything needed to build return targets from a sampled value curve
#[derive(Clone, Copy)]
pub struct ReturnRequest<'a> {
    /// Estimator for the first moment
    pub mode: ReturnMode,
    /// Discount factor
    pub gamma: f32,
    /// Rewards `[N, A]`
    pub rewards: ArrayView2<'a, f32>,
    /// Terminal flags `[N, A]`
    pub dones: ArrayView2<'a, bool>,
    /// Horizons to produce targets for, sorted
    pub required_horizons: &'a [usize],
    /// Horizons the value curve was sampled at, sorted, starting at 0
    pub value_sample_horizons: &'a [usize],
    /// Value at each sampled horizon for every state including the
    /// bootstrap state `[N+1, A, K]`
    pub value_samples: ArrayView3<'a, f32>,
    /// Interpolation between samples
    pub interpolation: Interpolation,
    /// Also produce second-moment targets
    pub second_moment: Option<SecondMomentRequest<'a>>,
}

/// Targets at the required horizons, both `[N, A, H]`
#[derive(Debug, Clone)]
pub struct ReturnEstimate {
    /// Expected return
    pub first: Array3<f32>,
    /// Expected squared return, when requested
    pub second: Option<Array3<f32>>,
}

/// Compute return targets at the required horizons from a sampled curve
///
/// # Panics
///
/// Panics if the required horizons are not sorted, if the sample grid does
/// not start at 0 or does not reach the largest required horizon, or on any
/// shape mismatch.
pub fn get_return_estimate(request: &ReturnRequest) -> ReturnEstimate {
    let required = request.required_horizons;
    let samples = request.value_sample_horizons;
    let (n, a) = request.rewards.dim();

    assert!(
        required.windows(2).all(|w| w[0] <= w[1]),
        "required horizons must be sorted: {:?}",
        required
    );
    assert!(
        samples.windows(2).all(|w| w[0] <= w[1]),
        "value sample horizons must be sorted: {:?}",
        samples
    );
    assert_eq!(
        request.value_samples.dim(),
        (n + 1, a, samples.len()),
        "value samples have shape {:?}, expected {:?}",
        request.value_samples.dim(),
        (n + 1, a, samples.len())
    );

    let Some(&max_required) = required.last() else {
        return ReturnEstimate {
            first: Array3::zeros((n, a, 0)),
            second: request.second_moment.map(|_| Array3::zeros((n, a, 0))),
        };
    };
    assert_eq!(samples.first(), Some(&0), "value sample horizons must start at 0");
    assert!(
        samples.last().is_some_and(|&last| last >= max_required),
        "value samples stop at {:?} but horizon {} is required",
        samples.last(),
        max_required
    );

    let weights = interpolation_weights(samples, max_required, request.interpolation);
    let dense = interpolate(request.value_samples, &weights);

    let second = request.second_moment.map(|m2| {
        assert_eq!(
            m2.value_samples.dim(),
            request.value_samples.dim(),
            "second-moment samples have shape {:?}, expected {:?}",
            m2.value_samples.dim(),
            request.value_samples.dim()
        );
        let dense_m2 = interpolate(m2.value_samples, &weights);
        let targets = dense_second_moment(m2.mode, request, &dense, &dense_m2);
        gather(&targets, required)
    });

    let first = gather(&dense_first_moment(request.mode, request, &dense), required);

    ReturnEstimate { first, second }
}

fn dense_first_moment(mode: ReturnMode, request: &ReturnRequest, dense: &Array3<f32>) -> Array3<f32> {
    let n = request.rewards.nrows();
    let values = dense.slice(s![..n, .., ..]);
    let final_value = dense.index_axis(Axis(0), n);
    let (rewards, dones, gamma) = (request.rewards, request.dones, request.gamma);

    match mode {
        ReturnMode::Fixed { n_step } => {
            tvf::calculate_tvf_n_step(rewards, dones, values, final_value, gamma, n_step)
        }
        ReturnMode::MonteCarlo => tvf::calculate_tvf_mc(rewards, dones, final_value, gamma),
        ReturnMode::TemporalDifference => {
            tvf::calculate_tvf_td(rewards, dones, values, final_value, gamma)
        }
        ReturnMode::Lambda { lambda } => {
            tvf::calculate_tvf_lambda(rewards, dones, values, final_value, gamma, lambda)
        }
        ReturnMode::Adaptive { n_step, ratio } => {
            tvf::calculate_tvf_adaptive(rewards, dones, values, final_value, gamma, n_step, ratio)
        }
    }
}

fn dense_second_moment(
    mode: ReturnMode,
    request: &ReturnRequest,
    dense: &Array3<f32>,
    dense_m2: &Array3<f32>,
) -> Array3<f32> {
    let n = request.rewards.nrows();
    let values = dense.slice(s![..n, .., ..]);
    let final_value = dense.index_axis(Axis(0), n);
    let values_m2 = dense_m2.slice(s![..n, .., ..]);
    let final_m2 = dense_m2.index_axis(Axis(0), n);
    let (rewards, dones, gamma) = (request.rewards, request.dones, request.gamma);

    match mode {
        ReturnMode::Fixed { n_step } => tvf::calculate_tvf_n_step_m2(
            rewards, dones, values, final_value, values_m2, final_m2, gamma, n_step,
        ),
        ReturnMode::MonteCarlo => {
            tvf::calculate_tvf_mc_m2(rewards, dones, final_value, final_m2, gamma)
        }
        ReturnMode::TemporalDifference => {
            tvf::calculate_tvf_td_m2(rewards, dones, values, final_value, values_m2, final_m2, gamma)
        }
        ReturnMode::Lambda { lambda } => tvf::calculate_tvf_lambda_m2(
            rewards, dones, values, final_value, values_m2, final_m2, gamma, lambda,
        ),
        ReturnMode::Adaptive { n_step, ratio } => tvf::calculate_tvf_adaptive_m2(
            rewards, dones, values, final_value, values_m2, final_m2, gamma, n_step, ratio,
        ),
    }
}

/// For each dense horizon `0..=max_h`: the two bracketing sample indices and
/// the weight on the upper one
pub(crate) fn interpolation_weights(
    samples: &[usize],
    max_h: usize,
    interpolation: Interpolation,
) -> Vec<(usize, usize, f32)> {
    let mut out = Vec::with_capacity(max_h + 1);
    let mut i = 0;
    for h in 0..=max_h {
        while i + 1 < samples.len() && samples[i + 1] <= h {
            i += 1;
        }
        if samples[i] == h || i + 1 >= samples.len() {
            out.push((i, i, 0.0));
        } else {
            // samples[i] < h < samples[i + 1], so the span is never zero
            let lo = interpolation.coordinate(samples[i]);
            let hi = interpolation.coordinate(samples[i + 1]);
            let w = (interpolation.coordinate(h) - lo) / (hi - lo);
            out.push((i, i + 1, w));
        }
    }
    out
}

fn interpolate(samples: ArrayView3<f32>, weights: &[(usize, usize, f32)]) -> Array3<f32> {
    let (rows, agents, _) = samples.dim();
    Array3::from_shape_fn((rows, agents, weights.len()), |(t, a, h)| {
        let (lo, hi, w) = weights[h];
        let v_lo = samples[[t, a, lo]];
        if w == 0.0 {
            v_lo
        } else {
            v_lo * (1.0 - w) + samples[[t, a, hi]] * w
        }
    })
}

fn gather(dense: &Array3<f32>, horizons: &[usize]) -> Array3<f32> {
    dense.select(Axis(2), horizons)
}
