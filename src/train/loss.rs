//! Value-curve loss and fit diagnostics
//!
//! The loss functions here consume the multi-horizon targets produced by
//! [`crate::returns`]; gradient computation is left to the model backend.

use ndarray::{Array3, ArrayView1, ArrayView3, Axis, Zip};
use serde::{Deserialize, Serialize};

/// Elementwise loss between value-curve targets and predictions
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ValueLossFn {
    /// Squared error
    #[default]
    Mse,
    /// Pseudo-Huber loss, absolute error when `delta` is 0
    Huber {
        /// Transition point between quadratic and linear behaviour
        delta: f32,
    },
    /// Squared error of the per-step average value, `(t - p)² · M / h²`
    HorizonWeighted,
}

impl ValueLossFn {
    /// Elementwise loss `[N, A, H]`
    ///
    /// # Arguments
    /// * `targets` - Return targets `[N, A, H]`
    /// * `predictions` - Model predictions `[N, A, H]`
    /// * `horizons` - Horizon of each column; only used by `HorizonWeighted`,
    ///   where `None` means every column is at `max_horizon`
    /// * `max_horizon` - Largest horizon of the value curve
    ///
    /// Horizon-zero columns contribute no loss under `HorizonWeighted`.
    pub fn loss(
        self,
        targets: ArrayView3<f32>,
        predictions: ArrayView3<f32>,
        horizons: Option<&[usize]>,
        max_horizon: usize,
    ) -> Array3<f32> {
        assert_eq!(
            targets.dim(),
            predictions.dim(),
            "targets have shape {:?} but predictions have shape {:?}",
            targets.dim(),
            predictions.dim()
        );
        let errors = &targets - &predictions;
        let max_h = max_horizon as f32;

        match self {
            ValueLossFn::Mse => errors.mapv(|e| e * e),
            ValueLossFn::Huber { delta } if delta == 0.0 => errors.mapv(f32::abs),
            ValueLossFn::Huber { delta } => {
                errors.mapv(|e| delta * delta * ((1.0 + (e / delta).powi(2)).sqrt() - 1.0))
            }
            ValueLossFn::HorizonWeighted => match horizons {
                None => errors.mapv(|e| e * e / max_h),
                Some(horizons) => {
                    assert_eq!(
                        horizons.len(),
                        errors.dim().2,
                        "got {} horizons for {} columns",
                        horizons.len(),
                        errors.dim().2
                    );
                    let mut loss = errors;
                    for (mut column, &h) in loss.axis_iter_mut(Axis(2)).zip(horizons) {
                        if h == 0 {
                            column.fill(0.0);
                        } else {
                            let scale = max_h / (h as f32 * h as f32);
                            column.mapv_inplace(|e| e * e * scale);
                        }
                    }
                    loss
                }
            },
        }
    }
}

/// Fraction of target variance explained by the predictions
///
/// Returns 0 when the targets have no variance, and clips to `[-1, 1]`.
pub fn explained_variance(predictions: ArrayView1<f32>, targets: ArrayView1<f32>) -> f32 {
    assert_eq!(predictions.len(), targets.len(), "length mismatch");
    let var_target = variance(targets.iter().copied());
    if var_target == 0.0 {
        return 0.0;
    }
    let var_residual = variance(targets.iter().zip(predictions.iter()).map(|(t, p)| t - p));
    let ev = (1.0 - var_residual / var_target).clamp(-1.0, 1.0);
    if ev.is_nan() {
        0.0
    } else {
        ev
    }
}

fn variance<I: Iterator<Item = f32> + Clone>(values: I) -> f32 {
    let (count, sum) = values.clone().fold((0usize, 0.0_f64), |(c, s), x| (c + 1, s + x as f64));
    if count == 0 {
        return 0.0;
    }
    let mean = sum / count as f64;
    let sq = values.map(|x| (x as f64 - mean).powi(2)).sum::<f64>();
    (sq / count as f64) as f32
}

/// How well a value curve fits its targets at a set of horizons
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CurveQuality {
    /// Horizons evaluated
    pub horizons: Vec<usize>,

    /// Explained variance per horizon
    pub explained_variance: Vec<f32>,

    /// Mean squared error per horizon
    pub mse: Vec<f32>,

    /// Mean prediction per horizon
    pub mean_value: Vec<f32>,

    /// Explained variance pooled over all horizons
    pub average_explained_variance: f32,
}

impl CurveQuality {
    /// Compare estimates `[N, A, K]` with targets `[N, A, K]` at `horizons`
    pub fn measure(estimates: ArrayView3<f32>, targets: ArrayView3<f32>, horizons: &[usize]) -> Self {
        assert_eq!(estimates.dim(), targets.dim(), "estimates and targets differ in shape");
        assert_eq!(estimates.dim().2, horizons.len(), "one horizon per column is required");

        let mut quality = CurveQuality { horizons: horizons.to_vec(), ..Default::default() };
        let mut total_var = 0.0_f32;
        let mut total_residual_var = 0.0_f32;

        for k in 0..horizons.len() {
            let estimate: Vec<f32> = estimates.index_axis(Axis(2), k).iter().copied().collect();
            let target: Vec<f32> = targets.index_axis(Axis(2), k).iter().copied().collect();
            let count = target.len().max(1) as f32;

            total_var += variance(target.iter().copied());
            total_residual_var += variance(target.iter().zip(&estimate).map(|(t, p)| t - p));

            quality.explained_variance.push(explained_variance(
                ArrayView1::from(&estimate[..]),
                ArrayView1::from(&target[..]),
            ));
            quality.mse.push(
                target.iter().zip(&estimate).map(|(t, p)| (t - p).powi(2)).sum::<f32>() / count,
            );
            quality.mean_value.push(estimate.iter().sum::<f32>() / count);
        }

        quality.average_explained_variance = if total_var == 0.0 {
            0.0
        } else {
            (1.0 - total_residual_var / total_var).clamp(-1.0, 1.0)
        };
        quality
    }
}

/// Mean of an elementwise loss over every entry
pub fn mean_loss(loss: &Array3<f32>) -> f32 {
    let mut total = 0.0_f64;
    Zip::from(loss).for_each(|&x| total += x as f64);
    if loss.is_empty() {
        0.0
    } else {
        (total / loss.len() as f64) as f32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Array3};

    #[test]
    fn test_mse_and_huber() {
        let targets = Array3::from_elem((1, 1, 2), 3.0_f32);
        let predictions = array![[[1.0_f32, 3.0]]];

        let mse = ValueLossFn::Mse.loss(targets.view(), predictions.view(), None, 10);
        assert_eq!(mse, array![[[4.0_f32, 0.0]]]);

        let l1 = ValueLossFn::Huber { delta: 0.0 }.loss(targets.view(), predictions.view(), None, 10);
        assert_eq!(l1, array![[[2.0_f32, 0.0]]]);

        // pseudo-Huber is quadratic for small errors
        let huber = ValueLossFn::Huber { delta: 100.0 }.loss(targets.view(), predictions.view(), None, 10);
        assert!((huber[[0, 0, 0]] - 2.0).abs() < 1e-2, "got {}", huber[[0, 0, 0]]);
    }

    #[test]
    fn test_horizon_weighted() {
        let targets = array![[[0.0_f32, 10.0, 20.0]]];
        let predictions = array![[[5.0_f32, 8.0, 16.0]]];

        let loss = ValueLossFn::HorizonWeighted.loss(
            targets.view(),
            predictions.view(),
            Some(&[0, 10, 20]),
            100,
        );
        assert_eq!(loss[[0, 0, 0]], 0.0);
        assert!((loss[[0, 0, 1]] - 4.0 * 100.0 / 100.0).abs() < 1e-5);
        assert!((loss[[0, 0, 2]] - 16.0 * 100.0 / 400.0).abs() < 1e-5);

        let unweighted = ValueLossFn::HorizonWeighted.loss(targets.view(), predictions.view(), None, 100);
        assert!((unweighted[[0, 0, 0]] - 0.25).abs() < 1e-6);
    }

    #[test]
    fn test_explained_variance() {
        let targets = array![1.0_f32, 2.0, 3.0, 4.0];
        assert!((explained_variance(targets.view(), targets.view()) - 1.0).abs() < 1e-6);

        let constant = array![2.0_f32, 2.0, 2.0, 2.0];
        assert_eq!(explained_variance(targets.view(), constant.view()), 0.0);

        let wrong = array![4.0_f32, 3.0, 2.0, 1.0];
        assert_eq!(explained_variance(wrong.view(), targets.view()), -1.0);
    }

    #[test]
    fn test_curve_quality() {
        let targets = Array3::from_shape_fn((4, 2, 2), |(t, a, k)| (t + a) as f32 * (k + 1) as f32);
        let mut estimates = targets.clone();
        estimates.index_axis_mut(Axis(2), 1).fill(0.0);

        let quality = CurveQuality::measure(estimates.view(), targets.view(), &[1, 10]);
        assert_eq!(quality.horizons, vec![1, 10]);
        assert!((quality.explained_variance[0] - 1.0).abs() < 1e-6);
        assert_eq!(quality.mse[0], 0.0);
        assert_eq!(quality.mean_value[1], 0.0);
        assert!(quality.explained_variance[1] < 1.0);
        assert!(quality.average_explained_variance < 1.0);
    }

    #[test]
    fn test_mean_loss() {
        let loss = array![[[1.0_f32, 3.0]], [[5.0, 7.0]]];
        assert_eq!(mean_loss(&loss), 4.0);
    }
}
