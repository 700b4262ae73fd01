//! Horizon sampling along the value curve
//!
//! The value network is trained and queried at a subset of horizons rather
//! than every integer in `0..=max_horizon`. This module decides which ones.
//! Fixed distributions are deterministic; the randomised variants decorrelate
//! estimation error across batches and draw from the caller's RNG so that a
//! seeded run is reproducible.

use std::fmt;
use std::str::FromStr;

use anyhow::{anyhow, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Distribution used to place horizon samples in `[0, max_value]`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HorizonDistribution {
    /// Evenly spaced, endpoints included
    FixedLinear,
    /// Geometric spacing over `[1, max+1]`, shifted down by one
    FixedGeometric,
    /// Uniform draws without replacement from `1..max`
    Linear,
    /// Log-uniform draws over `[1, max+1]`, shifted down by one
    Geometric,
    /// Half log-uniform inside the rollout window, half over the full range
    SaturatedGeometric,
    /// Half geometric inside the rollout window, half over the full range
    SaturatedFixedGeometric,
}

impl HorizonDistribution {
    /// Whether sampling consumes randomness
    pub fn is_random(self) -> bool {
        matches!(
            self,
            HorizonDistribution::Linear
                | HorizonDistribution::Geometric
                | HorizonDistribution::SaturatedGeometric
        )
    }

    /// Name used in configuration files
    pub fn name(self) -> &'static str {
        match self {
            HorizonDistribution::FixedLinear => "fixed_linear",
            HorizonDistribution::FixedGeometric => "fixed_geometric",
            HorizonDistribution::Linear => "linear",
            HorizonDistribution::Geometric => "geometric",
            HorizonDistribution::SaturatedGeometric => "saturated_geometric",
            HorizonDistribution::SaturatedFixedGeometric => "saturated_fixed_geometric",
        }
    }
}

impl fmt::Display for HorizonDistribution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for HorizonDistribution {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "fixed_linear" => Ok(HorizonDistribution::FixedLinear),
            "fixed_geometric" => Ok(HorizonDistribution::FixedGeometric),
            "linear" => Ok(HorizonDistribution::Linear),
            "geometric" => Ok(HorizonDistribution::Geometric),
            "saturated_geometric" => Ok(HorizonDistribution::SaturatedGeometric),
            "saturated_fixed_geometric" => Ok(HorizonDistribution::SaturatedFixedGeometric),
            other => Err(anyhow!(
                "unsupported horizon distribution '{}' (expected one of fixed_linear, \
                 fixed_geometric, linear, geometric, saturated_geometric, \
                 saturated_fixed_geometric)",
                other
            )),
        }
    }
}

/// Generates sorted horizon samples for one batch
///
/// `n_steps` is the rollout length; the saturated distributions put half
/// their samples inside `[0, min(n_steps, max_value)]`.
#[derive(Debug, Clone, Copy)]
pub struct HorizonSampler {
    /// Sampling distribution
    pub distribution: HorizonDistribution,

    /// Rollout length used by the saturated variants
    pub n_steps: usize,
}

impl HorizonSampler {
    /// Create a sampler for the given distribution
    pub fn new(distribution: HorizonDistribution, n_steps: usize) -> Self {
        Self { distribution, n_steps }
    }

    /// Generate horizon samples in `[0, max_value]`
    ///
    /// # Arguments
    ///
    /// * `max_value` - Largest horizon
    /// * `samples` - Number of samples, `None` for every horizon
    /// * `force_first_and_last` - Overwrite the first sample with 0 and the
    ///   last with `max_value` after sorting
    /// * `rng` - Randomness for the non-fixed distributions
    ///
    /// The output is sorted but may contain duplicates, in particular when
    /// forcing the endpoints or rounding geometric samples near zero.
    pub fn generate<R: Rng + ?Sized>(
        &self,
        max_value: usize,
        samples: Option<usize>,
        force_first_and_last: bool,
        rng: &mut R,
    ) -> Vec<usize> {
        let samples = match samples {
            Some(samples) if samples < max_value + 1 => samples,
            _ => return (0..=max_value).collect(),
        };
        if samples == 0 {
            return Vec::new();
        }

        let max = max_value as f64;
        let short = self.n_steps.min(max_value) as f64;

        let mut points: Vec<f64> = match self.distribution {
            HorizonDistribution::FixedLinear => linspace(0.0, max, samples, true),
            HorizonDistribution::FixedGeometric => geomspace(1.0, max + 1.0, samples, true)
                .into_iter()
                .map(|x| x - 1.0)
                .collect(),
            HorizonDistribution::Linear => sample_without_replacement(max_value, samples, rng),
            HorizonDistribution::Geometric => (0..samples)
                .map(|_| log_uniform(max + 1.0, rng) - 1.0)
                .collect(),
            HorizonDistribution::SaturatedGeometric => {
                let half = samples / 2;
                let inner: Vec<f64> =
                    (0..half).map(|_| log_uniform(short + 1.0, rng) - 1.0).collect();
                let outer: Vec<f64> =
                    (0..half).map(|_| log_uniform(max + 1.0, rng) - 1.0).collect();
                inner.into_iter().chain(outer).collect()
            }
            HorizonDistribution::SaturatedFixedGeometric => {
                let half = samples / 2;
                geomspace(1.0, short + 1.0, half, false)
                    .into_iter()
                    .chain(geomspace(1.0, max + 1.0, half, true))
                    .map(|x| x - 1.0)
                    .collect()
            }
        };

        if points.is_empty() {
            return points.into_iter().map(|x| x as usize).collect();
        }

        points.sort_by(|a, b| a.total_cmp(b));
        if force_first_and_last {
            let last = points.len() - 1;
            points[0] = 0.0;
            points[last] = max;
        }

        points
            .into_iter()
            .map(|x| x.round_ties_even().clamp(0.0, max) as usize)
            .collect()
    }
}

/// Approximately geometric debug horizons up to `max_horizon`
///
/// Always ends with `max_horizon` itself.
///
/// # Panics
///
/// Panics if `max_horizon > 30000`.
pub fn standard_horizon_sample(max_horizon: usize) -> Vec<usize> {
    assert!(max_horizon <= 30000, "horizons over 30k not yet supported (got {})", max_horizon);
    let mut horizons: Vec<usize> = [1, 3, 10, 30, 100, 300, 1000, 3000, 10000, 30000]
        .into_iter()
        .filter(|&h| h <= max_horizon)
        .collect();
    if horizons.last() != Some(&max_horizon) {
        horizons.push(max_horizon);
    }
    horizons
}

/// Horizons at which to query the value curve before rediscounting
///
/// The effective horizon keeps the truncation error below roughly 1% of the
/// discounted return, and the step size keeps the sample count near 400.
/// Sampling runs backwards from the effective horizon so it is always
/// included. Returned in ascending order.
pub fn rediscount_horizons(current_horizon: usize, new_gamma: f32) -> Vec<usize> {
    const TRUNCATION_FACTOR: f32 = 7.0;
    const MAX_SAMPLES: usize = 400;

    let effective_horizon = if new_gamma >= 1.0 {
        current_horizon
    } else {
        ((TRUNCATION_FACTOR / (1.0 - new_gamma)).round() as usize).min(current_horizon)
    };
    if effective_horizon == 0 {
        return vec![0];
    }

    let step_skip = effective_horizon.div_ceil(MAX_SAMPLES);
    let mut horizons: Vec<usize> = (1..=effective_horizon).rev().step_by(step_skip).collect();
    horizons.reverse();
    horizons
}

fn linspace(start: f64, stop: f64, num: usize, endpoint: bool) -> Vec<f64> {
    match num {
        0 => Vec::new(),
        1 => vec![start],
        _ => {
            let div = if endpoint { (num - 1) as f64 } else { num as f64 };
            let step = (stop - start) / div;
            let mut out: Vec<f64> = (0..num).map(|i| start + i as f64 * step).collect();
            if endpoint {
                out[num - 1] = stop;
            }
            out
        }
    }
}

fn geomspace(start: f64, stop: f64, num: usize, endpoint: bool) -> Vec<f64> {
    let mut out: Vec<f64> = linspace(start.ln(), stop.ln(), num, endpoint)
        .into_iter()
        .map(f64::exp)
        .collect();
    // pin the endpoints exactly, exp(ln(x)) can drift by an ulp
    if let Some(first) = out.first_mut() {
        *first = start;
    }
    if endpoint && num > 1 {
        out[num - 1] = stop;
    }
    out
}

fn log_uniform<R: Rng + ?Sized>(upper: f64, rng: &mut R) -> f64 {
    let hi = upper.ln();
    if hi <= 0.0 {
        return 1.0;
    }
    rng.gen_range(0.0..hi).exp()
}

/// Draws distinct values from `1..max_value`, topping up with uniform draws
/// over `0..=max_value` when the open range is smaller than `samples`.
fn sample_without_replacement<R: Rng + ?Sized>(
    max_value: usize,
    samples: usize,
    rng: &mut R,
) -> Vec<f64> {
    let available = max_value.saturating_sub(1);
    let amount = samples.min(available);
    let mut out: Vec<f64> = rand::seq::index::sample(rng, available, amount)
        .into_iter()
        .map(|i| (i + 1) as f64)
        .collect();
    while out.len() < samples {
        out.push(rng.gen_range(0..=max_value) as f64);
    }
    out
}
